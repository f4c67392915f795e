use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures_util::future::join_all;
use warden_process::{ComponentSpec, LaunchOutcome, TerminationOutcome};

use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::launcher::Launcher;
use crate::registry::ComponentRegistry;
use crate::report::{Action, RunReport};
use crate::settings::{BatchMode, ScheduleSettings};
use crate::terminator::Terminator;

/// What the scheduler drives. Implemented by [`Supervisor`] for real processes.
#[async_trait]
pub trait ComponentDriver: Send + Sync {
    async fn launch(&self, spec: &ComponentSpec) -> LaunchOutcome;

    async fn terminate(&self, spec: &ComponentSpec) -> TerminationOutcome;
}

/// Launcher and terminator sharing one run context.
#[derive(Debug, Clone)]
pub struct Supervisor {
    launcher: Launcher,
    terminator: Terminator,
}

impl Supervisor {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self {
            launcher: Launcher::new(ctx.clone()),
            terminator: Terminator::new(ctx),
        }
    }
}

#[async_trait]
impl ComponentDriver for Supervisor {
    async fn launch(&self, spec: &ComponentSpec) -> LaunchOutcome {
        self.launcher.launch(spec).await
    }

    async fn terminate(&self, spec: &ComponentSpec) -> TerminationOutcome {
        self.terminator.terminate(spec).await
    }
}

/// Core components in startup order, and the leaf batch.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub core: Vec<ComponentSpec>,
    pub leaf: Vec<ComponentSpec>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.core.len() + self.leaf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.is_empty() && self.leaf.is_empty()
    }
}

/// Resolves requested ids against the registry. An empty request selects everything.
pub fn select(registry: &dyn ComponentRegistry, requested: &[String]) -> Result<Vec<ComponentSpec>> {
    if requested.is_empty() {
        return Ok(registry.all().to_vec());
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for id in requested {
        let Some(spec) = registry.get(id) else {
            return Err(OrchestratorError::config(format!("unknown component {id}")));
        };
        if seen.insert(spec.id.clone()) {
            out.push(spec.clone());
        }
    }
    Ok(out)
}

/// Splits `specs` into core and leaf, and orders core by dependency with the hierarchy as
/// tie-break. Fails before anything runs if the core dependency graph has a cycle.
pub fn plan(specs: &[ComponentSpec], hierarchy: &[String], is_core: impl Fn(&ComponentSpec) -> bool) -> Result<Plan> {
    let (core, leaf): (Vec<_>, Vec<_>) = specs.iter().cloned().partition(|s| is_core(s));

    let rank = |s: &ComponentSpec| {
        hierarchy
            .iter()
            .position(|h| h == s.id.as_str())
            .unwrap_or(hierarchy.len())
    };
    let index: HashMap<&str, usize> = core
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; core.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); core.len()];
    for (i, spec) in core.iter().enumerate() {
        for dep in &spec.dependencies {
            if let Some(&j) = index.get(dep.as_str()) {
                indegree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<(usize, String, usize)> = core
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, s)| (rank(s), s.id.0.clone(), i))
        .collect();
    let mut ordered = Vec::with_capacity(core.len());
    while let Some(next) = ready.pop_first() {
        let i = next.2;
        ordered.push(core[i].clone());
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert((rank(&core[d]), core[d].id.0.clone(), d));
            }
        }
    }

    if ordered.len() != core.len() {
        let stuck: Vec<&str> = core
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, s)| s.id.as_str())
            .collect();
        return Err(OrchestratorError::config(format!(
            "dependency cycle among core components: {}",
            stuck.join(", ")
        )));
    }

    let mut leaf = leaf;
    leaf.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Plan {
        core: ordered,
        leaf,
    })
}

/// Runs start, stop and restart in dependency-respecting phases.
pub struct Scheduler<D> {
    driver: D,
    settings: ScheduleSettings,
    run_id: warden_process::RunId,
    dry_run: bool,
}

impl<D: ComponentDriver> Scheduler<D> {
    pub fn new(driver: D, settings: ScheduleSettings) -> Self {
        Self {
            driver,
            settings,
            run_id: warden_process::RunId::new(),
            dry_run: false,
        }
    }

    pub fn with_run(mut self, run_id: warden_process::RunId, dry_run: bool) -> Self {
        self.run_id = run_id;
        self.dry_run = dry_run;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn report(&self, action: Action) -> RunReport {
        RunReport::new(self.run_id.clone(), action, self.dry_run)
    }

    /// Core one at a time, each gated on the previous finishing; then all leaves together.
    pub async fn start(&self, plan: &Plan) -> RunReport {
        let mut report = self.report(Action::Start);
        self.start_into(plan, &mut report).await;
        report.finish()
    }

    /// Leaves first, then core in reverse startup order.
    pub async fn stop(&self, plan: &Plan) -> RunReport {
        let mut report = self.report(Action::Stop);
        self.stop_into(plan, &mut report).await;
        report.finish()
    }

    pub async fn restart(&self, plan: &Plan) -> RunReport {
        let mut report = self.report(Action::Restart);
        self.stop_into(plan, &mut report).await;
        self.start_into(plan, &mut report).await;
        report.finish()
    }

    async fn start_into(&self, plan: &Plan, report: &mut RunReport) {
        tracing::info!(core = plan.core.len(), leaf = plan.leaf.len(), "start: core phase");
        for (i, spec) in plan.core.iter().enumerate() {
            let outcome = self.driver.launch(spec).await;
            if !outcome.success {
                tracing::error!(component = %spec.id, error = ?outcome.error, "core component failed to start; continuing");
            }
            let spawned = outcome.pid.is_some() && outcome.startup_time_ms > 0;
            report.launches.push(outcome);
            if spawned && i + 1 < plan.core.len() && !self.settings.settle.is_zero() {
                tokio::time::sleep(self.settings.settle).await;
            }
        }

        if plan.leaf.is_empty() {
            return;
        }
        if !plan.core.is_empty() && !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }
        tracing::info!(count = plan.leaf.len(), mode = ?self.settings.mode, "start: leaf phase");
        let outcomes = match self.settings.mode {
            BatchMode::Concurrent => join_all(plan.leaf.iter().map(|s| self.driver.launch(s))).await,
            BatchMode::Sequential => {
                let mut out = Vec::with_capacity(plan.leaf.len());
                for spec in &plan.leaf {
                    out.push(self.driver.launch(spec).await);
                }
                out
            }
        };
        report.launches.extend(outcomes);
    }

    async fn stop_into(&self, plan: &Plan, report: &mut RunReport) {
        if !plan.leaf.is_empty() {
            tracing::info!(count = plan.leaf.len(), mode = ?self.settings.mode, "stop: leaf phase");
            let outcomes = match self.settings.mode {
                BatchMode::Concurrent => {
                    join_all(plan.leaf.iter().map(|s| self.driver.terminate(s))).await
                }
                BatchMode::Sequential => {
                    let mut out = Vec::with_capacity(plan.leaf.len());
                    for spec in &plan.leaf {
                        out.push(self.driver.terminate(spec).await);
                    }
                    out
                }
            };
            report.terminations.extend(outcomes);
            if !plan.core.is_empty() && !self.settings.settle.is_zero() {
                tokio::time::sleep(self.settings.settle).await;
            }
        }

        tracing::info!(count = plan.core.len(), "stop: core phase");
        for (i, spec) in plan.core.iter().rev().enumerate() {
            let outcome = self.driver.terminate(spec).await;
            let stopped = outcome.pid.is_some();
            report.terminations.push(outcome);
            if stopped && i + 1 < plan.core.len() && !self.settings.core_stop_pause.is_zero() {
                tokio::time::sleep(self.settings.core_stop_pause).await;
            }
        }
    }
}
