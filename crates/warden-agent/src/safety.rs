use std::time::Duration;

use warden_process::{ComponentId, ProcessHandle};

use crate::support::{env_list, env_u64};

const DEFAULT_MIN_PID: u32 = 100;
const DEFAULT_MAX_UPTIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Heuristic guard evaluated before any signal is sent. Thresholds are policy, not truth.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    pub protected_names: Vec<String>,
    pub min_pid: u32,
    pub max_uptime: Duration,
    pub dangerous_keywords: Vec<String>,
    /// Command-line fragments that mark a process as ours even when it trips a dangerous keyword.
    pub platform_markers: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        let names = [
            "init",
            "systemd",
            "launchd",
            "kthreadd",
            "sshd",
            "dockerd",
            "containerd",
            "kernel_task",
            "WindowServer",
            "loginwindow",
            "Xorg",
            "dbus-daemon",
        ];
        let keywords = [
            "/sbin/",
            "/usr/sbin/",
            "/usr/libexec/",
            "/System/Library/",
            "systemd",
            "kworker",
        ];
        Self {
            protected_names: names.iter().map(|s| s.to_string()).collect(),
            min_pid: DEFAULT_MIN_PID,
            max_uptime: DEFAULT_MAX_UPTIME,
            dangerous_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            platform_markers: vec!["warden".to_string()],
        }
    }
}

impl SafetyPolicy {
    pub fn from_env() -> Self {
        let mut p = SafetyPolicy::default();
        if let Some(v) = env_list("WARDEN_SAFETY_PROTECTED_NAMES") {
            p.protected_names = v;
        }
        if let Some(v) = env_u64("WARDEN_SAFETY_MIN_PID") {
            p.min_pid = v.clamp(2, 100_000) as u32;
        }
        if let Some(v) = env_u64("WARDEN_SAFETY_MAX_UPTIME_HOURS") {
            p.max_uptime = Duration::from_secs(v.clamp(1, 24 * 3650) * 3600);
        }
        if let Some(v) = env_list("WARDEN_SAFETY_DANGEROUS_KEYWORDS") {
            p.dangerous_keywords = v;
        }
        if let Some(v) = env_list("WARDEN_SAFETY_PLATFORM_MARKERS") {
            p.platform_markers.extend(v);
        }
        p
    }

    /// Returns the specific reason the target must not be signalled, if any.
    pub fn check(
        &self,
        handle: &ProcessHandle,
        component: &ComponentId,
        self_pid: u32,
        now_unix_ms: u64,
    ) -> Result<(), String> {
        if handle.pid == self_pid {
            return Err(format!("pid {} is the orchestrator itself", handle.pid));
        }

        if handle.pid < self.min_pid {
            return Err(format!(
                "pid {} is below the minimum of {}",
                handle.pid, self.min_pid
            ));
        }

        let name = handle.name.trim();
        if self
            .protected_names
            .iter()
            .any(|p| p.eq_ignore_ascii_case(name))
        {
            return Err(format!("process name {name:?} is protected"));
        }

        if let Some(uptime_ms) = handle.uptime_ms(now_unix_ms)
            && uptime_ms > self.max_uptime.as_millis() as u64
        {
            return Err(format!(
                "uptime {}h exceeds the {}h ceiling",
                uptime_ms / 3_600_000,
                self.max_uptime.as_secs() / 3600
            ));
        }

        let cmdline = handle.cmdline.to_ascii_lowercase();
        if let Some(keyword) = self
            .dangerous_keywords
            .iter()
            .find(|k| cmdline.contains(&k.to_ascii_lowercase()))
        {
            let ours = cmdline.contains(&component.as_str().to_ascii_lowercase())
                || self
                    .platform_markers
                    .iter()
                    .any(|m| cmdline.contains(&m.to_ascii_lowercase()));
            if !ours {
                return Err(format!(
                    "command line matches system keyword {keyword:?} and does not belong to this platform"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn handle(pid: u32, name: &str, cmdline: &str) -> ProcessHandle {
        ProcessHandle {
            pid,
            port: 8300,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            child_pids: Vec::new(),
            cpu_percent: None,
            memory_bytes: None,
            created_at_unix_ms: Some(NOW - 60_000),
        }
    }

    fn id() -> ComponentId {
        ComponentId::from("vector-store")
    }

    #[test]
    fn accepts_an_ordinary_component() {
        let p = SafetyPolicy::default();
        let h = handle(4321, "python3", "python3 components/vector-store/main.py");
        assert!(p.check(&h, &id(), 1, NOW).is_ok());
    }

    #[test]
    fn rejects_low_pid() {
        let p = SafetyPolicy::default();
        let err = p.check(&handle(1, "python3", ""), &id(), 99_999, NOW).unwrap_err();
        assert!(err.contains("below the minimum"));
    }

    #[test]
    fn rejects_self() {
        let p = SafetyPolicy::default();
        let err = p.check(&handle(5000, "warden", ""), &id(), 5000, NOW).unwrap_err();
        assert!(err.contains("orchestrator itself"));
    }

    #[test]
    fn rejects_protected_name_case_insensitively() {
        let p = SafetyPolicy::default();
        let err = p.check(&handle(4321, "SSHD", ""), &id(), 1, NOW).unwrap_err();
        assert!(err.contains("protected"));
    }

    #[test]
    fn rejects_implausibly_long_uptime() {
        let p = SafetyPolicy::default();
        let mut h = handle(4321, "python3", "python3 main.py");
        h.created_at_unix_ms = Some(NOW - 40 * 24 * 3_600_000);
        let err = p.check(&h, &id(), 1, NOW).unwrap_err();
        assert!(err.contains("ceiling"));
    }

    #[test]
    fn unknown_creation_time_does_not_trip_uptime() {
        let p = SafetyPolicy::default();
        let mut h = handle(4321, "python3", "python3 main.py");
        h.created_at_unix_ms = None;
        assert!(p.check(&h, &id(), 1, NOW).is_ok());
    }

    #[test]
    fn dangerous_cmdline_is_allowed_only_with_platform_marker() {
        let p = SafetyPolicy::default();
        let foreign = handle(4321, "daemon", "/usr/sbin/cupsd -l");
        assert!(p.check(&foreign, &id(), 1, NOW).unwrap_err().contains("system keyword"));

        let ours = handle(4321, "daemon", "/usr/sbin/python3 /opt/warden/vector-store/main.py");
        assert!(p.check(&ours, &id(), 1, NOW).is_ok());
    }
}
