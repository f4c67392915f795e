use std::collections::BTreeMap;

use specta::Type;

/// Stable component identifier as declared in the registry.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(transparent)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies one orchestrator invocation; stamped into log headers and the hub side channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Core,
    #[default]
    Leaf,
}

/// Registry entry for one platform component.
///
/// NOTE: `command` bypasses entry-point discovery; it is taken from the registry file
/// only, never from a remote caller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ComponentSpec {
    pub id: ComponentId,
    #[serde(default)]
    pub display_name: String,
    pub port: u16,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub dependencies: Vec<ComponentId>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_timeout_secs: Option<u64>,
}

impl ComponentSpec {
    pub fn new(id: &str, port: u16) -> Self {
        Self {
            id: ComponentId::from(id),
            display_name: id.to_string(),
            port,
            category: String::new(),
            tier: Tier::Leaf,
            dependencies: Vec::new(),
            description: String::new(),
            command: None,
            working_dir: None,
            env: BTreeMap::new(),
            health_paths: None,
            health_timeout_secs: None,
        }
    }

    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.display_name
        }
    }
}

/// A process found listening on a component's port.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ProcessHandle {
    pub pid: u32,
    pub port: u16,
    pub name: String,
    pub cmdline: String,
    pub child_pids: Vec<u32>,
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub created_at_unix_ms: Option<u64>,
}

impl ProcessHandle {
    pub fn uptime_ms(&self, now_unix_ms: u64) -> Option<u64> {
        self.created_at_unix_ms
            .map(|created| now_unix_ms.saturating_sub(created))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    NotRunning,
    Timeout,
    Error,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthState::Healthy)
    }

    /// Something answered on the port, even if it is not healthy yet.
    pub fn is_responsive(self) -> bool {
        matches!(
            self,
            HealthState::Healthy | HealthState::Starting | HealthState::Unhealthy
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct HealthStatus {
    pub state: HealthState,
    pub response_time_ms: Option<u64>,
    pub version: Option<String>,
    pub last_error: Option<String>,
    pub endpoint: Option<String>,
    pub ready: Option<bool>,
    pub checked_at_unix_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub version: Option<String>,
    pub checks: BTreeMap<String, serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Starting,
    Healthy,
    Unhealthy,
    Failed,
    Stopped,
    DryRun,
}

/// Classification of a launch that died early, derived from the tail of its own log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingDependency,
    PermissionDenied,
    PortInUse,
    Configuration,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct LaunchOutcome {
    pub component_id: ComponentId,
    pub success: bool,
    pub state: ComponentState,
    pub pid: Option<u32>,
    pub port: u16,
    pub message: Option<String>,
    pub startup_time_ms: u64,
    pub health_check_time_ms: u64,
    pub log_path: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl LaunchOutcome {
    pub fn failed(spec: &ComponentSpec, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            component_id: spec.id.clone(),
            success: false,
            state: ComponentState::Failed,
            pid: None,
            port: spec.port,
            message: None,
            startup_time_ms: 0,
            health_check_time_ms: 0,
            log_path: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum TerminationResult {
    Success,
    ForceKilled,
    NotRunning,
    Failed,
    Timeout,
}

impl TerminationResult {
    pub fn is_failure(self) -> bool {
        matches!(self, TerminationResult::Failed | TerminationResult::Timeout)
    }
}

/// Escalation ladder steps, ordered from least to most forceful.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMethod {
    GracefulHttp,
    GracefulSignal,
    ForceKill,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct TerminationOutcome {
    pub component_id: ComponentId,
    pub port: u16,
    pub result: TerminationResult,
    pub method: Option<TerminationMethod>,
    pub pid: Option<u32>,
    pub elapsed_ms: u64,
    pub cleanup_performed: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct ComponentReport {
    pub component_id: ComponentId,
    pub display_name: String,
    pub port: u16,
    pub tier: Tier,
    pub health: HealthStatus,
    pub process: Option<ProcessHandle>,
    pub readiness: Option<ReadinessStatus>,
    pub registered: Option<bool>,
    pub capabilities: Option<Vec<String>>,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct SystemHealthSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub running: usize,
    pub registered: usize,
    pub mean_response_time_ms: Option<f64>,
    pub mean_health_score: f64,
    pub hub_connected: bool,
    pub timestamp: String,
    pub components: Vec<ComponentReport>,
}
