use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use warden_process::{ComponentId, ComponentSpec, ComponentState, ProcessHandle, RunId};

use crate::health::HealthChecker;
use crate::locator::{PlatformLocator, PortLocator};
use crate::process_control::{OsProcessControl, ProcessControl};
use crate::registry::ComponentRegistry;
use crate::settings::Settings;
use crate::support::now_unix_ms;

/// A component this orchestrator started (or adopted) during the current run.
#[derive(Debug, Clone)]
pub struct LaunchedComponent {
    pub spec: ComponentSpec,
    pub pid: Option<u32>,
    pub log_path: Option<String>,
    pub started_at_unix_ms: u64,
    pub state: ComponentState,
    pub exit_code: Option<i32>,
    /// Found already running rather than spawned by us.
    pub adopted: bool,
}

/// Launch-path registry of started components, shared with reaper and monitor tasks.
#[derive(Debug, Clone, Default)]
pub struct LaunchedComponents {
    inner: Arc<Mutex<HashMap<ComponentId, LaunchedComponent>>>,
}

impl LaunchedComponents {
    pub async fn insert(&self, entry: LaunchedComponent) {
        self.inner.lock().await.insert(entry.spec.id.clone(), entry);
    }

    pub async fn get(&self, id: &ComponentId) -> Option<LaunchedComponent> {
        self.inner.lock().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &ComponentId) -> Option<LaunchedComponent> {
        self.inner.lock().await.remove(id)
    }

    /// Snapshot ordered by id.
    pub async fn list(&self) -> Vec<LaunchedComponent> {
        let mut out: Vec<_> = self.inner.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Records a reaped child. Ignored when the entry was replaced by a later launch.
    pub async fn mark_exited(&self, id: &ComponentId, pid: u32, exit_code: Option<i32>) {
        let mut map = self.inner.lock().await;
        let Some(e) = map.get_mut(id) else {
            return;
        };
        if e.pid != Some(pid) {
            return;
        }
        e.exit_code = exit_code;
        e.state = if exit_code == Some(0) {
            ComponentState::Stopped
        } else {
            ComponentState::Failed
        };
    }

    pub async fn set_state(&self, id: &ComponentId, state: ComponentState) {
        if let Some(e) = self.inner.lock().await.get_mut(id) {
            e.state = state;
        }
    }
}

/// Everything one orchestrator invocation shares between launcher, terminator, scheduler and
/// monitor.
pub struct RunContext {
    pub run_id: RunId,
    pub settings: Settings,
    pub registry: Arc<dyn ComponentRegistry>,
    pub locator: Arc<dyn PortLocator>,
    pub control: Arc<dyn ProcessControl>,
    pub health: HealthChecker,
    pub launched: LaunchedComponents,
    pub dry_run: bool,
    /// Relaunch even when a healthy instance already owns the port.
    pub force: bool,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("components", &self.registry.all().len())
            .field("dry_run", &self.dry_run)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Context backed by the real process table and signals.
    pub fn new(settings: Settings, registry: Arc<dyn ComponentRegistry>) -> anyhow::Result<Self> {
        let health = HealthChecker::new(settings.health.clone())?;
        Ok(Self {
            run_id: RunId::new(),
            settings,
            registry,
            locator: Arc::new(PlatformLocator::detect()),
            control: Arc::new(OsProcessControl),
            health,
            launched: LaunchedComponents::default(),
            dry_run: false,
            force: false,
        })
    }

    pub fn with_locator(mut self, locator: Arc<dyn PortLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn is_core(&self, spec: &ComponentSpec) -> bool {
        spec.tier == warden_process::Tier::Core
            || self
                .core_hierarchy()
                .iter()
                .any(|id| id == spec.id.as_str())
    }

    /// Registry order wins over the configured default.
    pub fn core_hierarchy(&self) -> Vec<String> {
        self.registry
            .core_hierarchy()
            .map(|h| h.to_vec())
            .unwrap_or_else(|| self.settings.schedule.core_hierarchy.clone())
    }

    /// Port lookup on the blocking pool; the Linux locator walks every `/proc/<pid>/fd`.
    pub async fn find_process(&self, port: u16) -> Option<ProcessHandle> {
        let locator = self.locator.clone();
        tokio::task::spawn_blocking(move || locator.find_process(port))
            .await
            .ok()
            .flatten()
    }

    pub async fn descendants(&self, pid: u32) -> Vec<u32> {
        let locator = self.locator.clone();
        tokio::task::spawn_blocking(move || locator.descendants(pid))
            .await
            .unwrap_or_default()
    }

    /// Registers components already listening on their ports so a fresh invocation can
    /// monitor them. Returns how many were adopted.
    pub async fn adopt_running(&self, specs: &[ComponentSpec]) -> usize {
        let mut adopted = 0;
        for spec in specs {
            if self.launched.get(&spec.id).await.is_some() {
                continue;
            }
            let Some(handle) = self.find_process(spec.port).await else {
                continue;
            };
            self.launched
                .insert(LaunchedComponent {
                    spec: spec.clone(),
                    pid: Some(handle.pid),
                    log_path: None,
                    started_at_unix_ms: handle.created_at_unix_ms.unwrap_or_else(now_unix_ms),
                    state: ComponentState::Starting,
                    exit_code: None,
                    adopted: true,
                })
                .await;
            adopted += 1;
        }
        adopted
    }
}
