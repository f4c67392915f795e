use std::{path::PathBuf, time::Duration};

use crate::safety::SafetyPolicy;
use crate::support::{env_bool, env_duration_ms, env_list, env_string, env_u64, env_usize};

const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub const DEFAULT_CORE_HIERARCHY: [&str; 3] = ["message-bus", "memory-store", "orchestrator"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    Concurrent,
    Sequential,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub paths: Vec<String>,
    pub readiness_path: String,
    pub capabilities_path: String,
    pub attempts: u32,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Overall budget for one `check_health` call, retries included.
    pub budget: Duration,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            paths: vec![
                "/health".to_string(),
                "/healthz".to_string(),
                "/status".to_string(),
                "/api/health".to_string(),
            ],
            readiness_path: "/ready".to_string(),
            capabilities_path: "/capabilities".to_string(),
            attempts: 3,
            request_timeout: Duration::from_secs(3),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(4),
            budget: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            progress_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub components_root: PathBuf,
    pub log_dir: PathBuf,
    pub run_dir: PathBuf,
    pub python: String,
    pub port_env: String,
    pub fast_fail_grace: Duration,
    pub core_health_timeout: Duration,
    pub leaf_health_timeout: Duration,
    pub port_release_timeout: Duration,
    pub log_max_bytes: u64,
    pub log_max_files: usize,
    /// Redirect console output straight into the log file instead of piping it through
    /// reader tasks, so components outlive this process.
    pub detach: bool,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            components_root: PathBuf::from("components"),
            log_dir: PathBuf::from("logs"),
            run_dir: PathBuf::from("run"),
            python: "python3".to_string(),
            port_env: "PORT".to_string(),
            fast_fail_grace: Duration::from_secs(2),
            core_health_timeout: Duration::from_secs(60),
            leaf_health_timeout: Duration::from_secs(30),
            port_release_timeout: Duration::from_secs(10),
            log_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            detach: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TerminateSettings {
    pub shutdown_paths: Vec<String>,
    pub http_timeout: Duration,
    pub http_grace: Duration,
    pub signal_timeout: Duration,
    pub kill_wait: Duration,
    pub recheck_interval: Duration,
    pub port_release_timeout: Duration,
    pub marker_dirs: Vec<PathBuf>,
}

impl Default for TerminateSettings {
    fn default() -> Self {
        Self {
            shutdown_paths: vec![
                "/shutdown".to_string(),
                "/api/shutdown".to_string(),
                "/admin/shutdown".to_string(),
            ],
            http_timeout: Duration::from_secs(2),
            http_grace: Duration::from_secs(3),
            signal_timeout: Duration::from_secs(10),
            kill_wait: Duration::from_secs(3),
            recheck_interval: Duration::from_millis(250),
            port_release_timeout: Duration::from_secs(5),
            marker_dirs: vec![PathBuf::from("run"), std::env::temp_dir()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub core_hierarchy: Vec<String>,
    pub settle: Duration,
    pub core_stop_pause: Duration,
    pub mode: BatchMode,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            core_hierarchy: DEFAULT_CORE_HIERARCHY
                .iter()
                .map(|s| s.to_string())
                .collect(),
            settle: Duration::from_secs(2),
            core_stop_pause: Duration::from_secs(1),
            mode: BatchMode::Concurrent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Base URL of the routing hub, e.g. `http://127.0.0.1:8100`.
    pub url: Option<String>,
    pub registry_path: String,
    /// Persistent-socket side channel used to announce shutdowns.
    pub ws_url: Option<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            url: None,
            registry_path: "/components".to_string(),
            ws_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub parallelism: usize,
    pub enrich: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            parallelism: 8,
            enrich: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub health: HealthSettings,
    pub launch: LaunchSettings,
    pub terminate: TerminateSettings,
    pub schedule: ScheduleSettings,
    pub hub: HubSettings,
    pub monitor: MonitorSettings,
    pub safety: SafetyPolicy,
}

impl Settings {
    /// Defaults overridden by `WARDEN_*` environment variables. Out-of-range values are clamped.
    pub fn from_env() -> Self {
        let mut s = Settings::default();

        if let Some(paths) = env_list("WARDEN_HEALTH_PATHS") {
            s.health.paths = paths;
        }
        if let Some(p) = env_string("WARDEN_READINESS_PATH") {
            s.health.readiness_path = p;
        }
        s.health.attempts = env_u64("WARDEN_HEALTH_ATTEMPTS")
            .map(|v| v.clamp(1, 10) as u32)
            .unwrap_or(s.health.attempts);
        s.health.request_timeout =
            env_duration_ms("WARDEN_HEALTH_REQUEST_TIMEOUT_MS", 3000, 100, 60_000);
        s.health.budget = env_duration_ms("WARDEN_HEALTH_BUDGET_MS", 15_000, 500, 10 * 60 * 1000);
        s.health.poll_interval = env_duration_ms("WARDEN_HEALTH_POLL_MS", 500, 50, 10_000);

        if let Some(dir) = env_string("WARDEN_COMPONENTS_ROOT") {
            s.launch.components_root = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("WARDEN_LOG_DIR") {
            s.launch.log_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("WARDEN_RUN_DIR") {
            s.launch.run_dir = PathBuf::from(dir);
        }
        if let Some(py) = env_string("WARDEN_PYTHON") {
            s.launch.python = py;
        }
        if let Some(name) = env_string("WARDEN_PORT_ENV") {
            s.launch.port_env = name;
        }
        s.launch.fast_fail_grace = env_duration_ms("WARDEN_FAST_FAIL_GRACE_MS", 2000, 100, 60_000);
        s.launch.core_health_timeout =
            env_duration_ms("WARDEN_CORE_HEALTH_TIMEOUT_MS", 60_000, 1000, 10 * 60 * 1000);
        s.launch.leaf_health_timeout =
            env_duration_ms("WARDEN_LEAF_HEALTH_TIMEOUT_MS", 30_000, 1000, 10 * 60 * 1000);
        s.launch.log_max_bytes = env_u64("WARDEN_LOG_FILE_MAX_BYTES")
            .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
        s.launch.log_max_files = env_usize("WARDEN_LOG_FILE_MAX_FILES")
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
        s.launch.detach = env_bool("WARDEN_DETACH", false);

        if let Some(paths) = env_list("WARDEN_SHUTDOWN_PATHS") {
            s.terminate.shutdown_paths = paths;
        }
        s.terminate.http_grace = env_duration_ms("WARDEN_HTTP_GRACE_MS", 3000, 0, 60_000);
        s.terminate.signal_timeout =
            env_duration_ms("WARDEN_SIGNAL_TIMEOUT_MS", 10_000, 500, 5 * 60 * 1000);
        s.terminate.kill_wait = env_duration_ms("WARDEN_KILL_WAIT_MS", 3000, 100, 60_000);
        s.terminate.marker_dirs = vec![s.launch.run_dir.clone(), std::env::temp_dir()];

        if let Some(core) = env_list("WARDEN_CORE_COMPONENTS") {
            s.schedule.core_hierarchy = core;
        }
        s.schedule.settle = env_duration_ms("WARDEN_SETTLE_MS", 2000, 0, 60_000);
        s.schedule.core_stop_pause = env_duration_ms("WARDEN_CORE_STOP_PAUSE_MS", 1000, 0, 60_000);

        s.hub.url = env_string("WARDEN_HUB_URL");
        if let Some(p) = env_string("WARDEN_HUB_REGISTRY_PATH") {
            s.hub.registry_path = p;
        }
        s.hub.ws_url = env_string("WARDEN_HUB_WS_URL");

        s.monitor.interval = env_duration_ms("WARDEN_MONITOR_INTERVAL_MS", 30_000, 1000, 60 * 60 * 1000);
        s.monitor.parallelism = env_usize("WARDEN_MONITOR_PARALLELISM")
            .map(|v| v.clamp(1, 64))
            .unwrap_or(s.monitor.parallelism);
        s.monitor.enrich = env_bool("WARDEN_MONITOR_ENRICH", true);

        s.safety = SafetyPolicy::from_env();
        s
    }

    pub fn health_timeout_for(&self, core: bool, override_secs: Option<u64>) -> Duration {
        if let Some(secs) = override_secs {
            return Duration::from_secs(secs.clamp(1, 3600));
        }
        if core {
            self.launch.core_health_timeout
        } else {
            self.launch.leaf_health_timeout
        }
    }
}
