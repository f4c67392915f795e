use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::{StreamExt, stream};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use warden_process::{
    ComponentId, ComponentReport, ComponentSpec, HealthState, SystemHealthSnapshot,
};

use crate::context::RunContext;
use crate::resources::sample_cpu_percent;
use crate::score::{ScoreInputs, health_score};

const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

/// A component crossing the healthy/unhealthy line between two watch ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub component_id: ComponentId,
    pub from: HealthState,
    pub to: HealthState,
    pub at: String,
}

impl Transition {
    pub fn recovered(&self) -> bool {
        self.to.is_healthy()
    }
}

/// Read-only status aggregation. Never signals or spawns.
#[derive(Debug, Clone)]
pub struct StatusMonitor {
    ctx: Arc<RunContext>,
}

impl StatusMonitor {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub async fn report_component(
        &self,
        spec: &ComponentSpec,
        registered: Option<&HashSet<String>>,
    ) -> ComponentReport {
        let settings = &self.ctx.settings;
        let enrich = settings.monitor.enrich;
        let paths = spec
            .health_paths
            .clone()
            .unwrap_or_else(|| settings.health.paths.clone());

        let mut process = self.ctx.find_process(spec.port).await;

        let health = self.ctx.health.check_health_with(&spec.id, spec.port, &paths, 1).await;

        if enrich
            && let Some(p) = process.as_mut()
            && p.cpu_percent.is_none()
        {
            p.cpu_percent = sample_cpu_percent(p.pid, CPU_SAMPLE_WINDOW).await;
        }

        let (readiness, capabilities) = if enrich && health.state.is_responsive() {
            tokio::join!(
                self.ctx.health.check_readiness(&spec.id, spec.port),
                self.ctx.health.fetch_capabilities(spec.port)
            )
        } else {
            (Default::default(), None)
        };
        let readiness = (enrich && health.state.is_responsive()).then_some(readiness);

        let registered = registered.map(|ids| ids.contains(spec.id.as_str()));

        let endpoints_total = if enrich { 3 } else { 1 };
        let endpoints_ok = usize::from(health.state.is_healthy())
            + usize::from(readiness.as_ref().is_some_and(|r| r.ready))
            + usize::from(capabilities.is_some());
        let score = health_score(&ScoreInputs {
            state: health.state,
            response_time_ms: health.response_time_ms,
            cpu_percent: process.as_ref().and_then(|p| p.cpu_percent),
            memory_bytes: process.as_ref().and_then(|p| p.memory_bytes),
            registered,
            endpoints_ok,
            endpoints_total,
        });

        ComponentReport {
            component_id: spec.id.clone(),
            display_name: spec.label().to_string(),
            port: spec.port,
            tier: spec.tier,
            health,
            process,
            readiness,
            registered,
            capabilities,
            score,
        }
    }

    async fn hub_registry(&self) -> Option<HashSet<String>> {
        self.ctx.settings.hub.url.as_ref()?;
        match crate::hub::fetch_registered(self.ctx.health.client(), &self.ctx.settings.hub).await {
            Ok(ids) => Some(ids),
            Err(e) => {
                tracing::warn!(error = %crate::support::format_error_chain(&e), "hub registry unavailable");
                None
            }
        }
    }

    /// One status pass over `specs`, fanned out with bounded parallelism.
    pub async fn snapshot(&self, specs: &[ComponentSpec]) -> SystemHealthSnapshot {
        let registered = self.hub_registry().await;
        let parallelism = self.ctx.settings.monitor.parallelism.max(1);

        let components: Vec<ComponentReport> = stream::iter(specs)
            .map(|spec| self.report_component(spec, registered.as_ref()))
            .buffered(parallelism)
            .collect()
            .await;

        let total = components.len();
        let healthy = components.iter().filter(|c| c.health.state.is_healthy()).count();
        let running = components
            .iter()
            .filter(|c| c.process.is_some() || c.health.state.is_responsive())
            .count();
        let registered_count = components.iter().filter(|c| c.registered == Some(true)).count();
        let times: Vec<f64> = components
            .iter()
            .filter_map(|c| c.health.response_time_ms)
            .map(|ms| ms as f64)
            .collect();
        let mean_response_time_ms =
            (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64);
        let mean_health_score = if total == 0 {
            0.0
        } else {
            components.iter().map(|c| c.score as f64).sum::<f64>() / total as f64
        };

        SystemHealthSnapshot {
            total,
            healthy,
            running,
            registered: registered_count,
            mean_response_time_ms,
            mean_health_score,
            hub_connected: registered.is_some(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            components,
        }
    }

    /// Re-checks every launched component each `interval` until the handle is stopped or
    /// dropped.
    pub fn watch(&self, interval: Duration) -> MonitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (transition_tx, transitions) = mpsc::unbounded_channel();
        let ctx = self.ctx.clone();

        let task = tokio::spawn(async move {
            let mut last: HashMap<ComponentId, HealthState> = HashMap::new();
            tracing::info!(interval_ms = interval.as_millis() as u64, "monitor started");
            loop {
                let tick = check_launched(&ctx);
                let results = tokio::select! {
                    _ = stop_rx.changed() => break,
                    r = tick => r,
                };

                for (id, state) in results {
                    let Some(prev) = last.insert(id.clone(), state) else {
                        continue;
                    };
                    if prev.is_healthy() == state.is_healthy() {
                        continue;
                    }
                    if state.is_healthy() {
                        tracing::info!(component = %id, from = ?prev, "component recovered");
                    } else {
                        tracing::warn!(component = %id, to = ?state, "component became unhealthy");
                    }
                    let _ = transition_tx.send(Transition {
                        component_id: id,
                        from: prev,
                        to: state,
                        at: chrono::Utc::now().to_rfc3339(),
                    });
                }

                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("monitor stopped");
        });

        MonitorHandle {
            stop_tx,
            task,
            transitions,
        }
    }
}

async fn check_launched(ctx: &RunContext) -> Vec<(ComponentId, HealthState)> {
    let entries = ctx.launched.list().await;
    let parallelism = ctx.settings.monitor.parallelism.max(1);
    stream::iter(entries)
        .map(|e| async move {
            let paths = e
                .spec
                .health_paths
                .clone()
                .unwrap_or_else(|| ctx.settings.health.paths.clone());
            let st = ctx
                .health
                .check_health_with(&e.spec.id, e.spec.port, &paths, 1)
                .await;
            (e.spec.id, st.state)
        })
        .buffer_unordered(parallelism)
        .collect()
        .await
}

/// Owner of a running watch loop.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    pub transitions: mpsc::UnboundedReceiver<Transition>,
}

impl MonitorHandle {
    /// Cancels the loop at its next suspension point and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
