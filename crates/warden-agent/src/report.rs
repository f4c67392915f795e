use std::fmt::Write as _;

use serde::Serialize;
use warden_process::{
    ComponentState, LaunchOutcome, RunId, SystemHealthSnapshot, TerminationOutcome,
    TerminationResult,
};

use crate::error::OrchestratorError;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Status,
}

/// Everything one invocation did, for the CLI and `--json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub action: Action,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: u64,
    pub launches: Vec<LaunchOutcome>,
    pub terminations: Vec<TerminationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SystemHealthSnapshot>,
    #[serde(skip)]
    started: std::time::Instant,
}

impl RunReport {
    pub fn new(run_id: RunId, action: Action, dry_run: bool) -> Self {
        Self {
            run_id,
            action,
            dry_run,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            duration_ms: 0,
            launches: Vec::new(),
            terminations: Vec::new(),
            status: None,
            started: std::time::Instant::now(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
        self.duration_ms = self.started.elapsed().as_millis() as u64;
        self
    }

    pub fn total(&self) -> usize {
        self.launches.len() + self.terminations.len()
    }

    pub fn failed_count(&self) -> usize {
        self.launches.iter().filter(|l| !l.success).count()
            + self
                .terminations
                .iter()
                .filter(|t| t.result.is_failure())
                .count()
    }

    /// `PartialFailure` when anything failed.
    pub fn error(&self) -> Option<OrchestratorError> {
        let failed = self.failed_count();
        (failed > 0).then(|| OrchestratorError::PartialFailure {
            failed,
            total: self.total(),
        })
    }

    pub fn exit_code(&self) -> u8 {
        if self.failed_count() > 0 {
            EXIT_FAILURE
        } else {
            EXIT_OK
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let prefix = if self.dry_run { "[dry run] " } else { "" };

        for l in &self.launches {
            let mark = match (l.success, l.state) {
                (true, ComponentState::Healthy) => "ok",
                (true, ComponentState::DryRun) => "plan",
                (true, _) => "warn",
                (false, _) => "FAIL",
            };
            let _ = write!(
                out,
                "{prefix}{mark:<4} start {:<24} port {:<5} {:?}",
                l.component_id, l.port, l.state
            );
            if let Some(pid) = l.pid {
                let _ = write!(out, " pid {pid}");
            }
            if l.startup_time_ms > 0 {
                let _ = write!(out, " in {}ms", l.startup_time_ms);
            }
            if let Some(m) = &l.message {
                let _ = write!(out, " ({m})");
            }
            if let Some(e) = &l.error {
                let _ = write!(out, " error: {e}");
            }
            if let Some(kind) = l.failure_kind {
                let _ = write!(out, " [{kind:?}]");
            }
            if !l.success
                && let Some(path) = &l.log_path
            {
                let _ = write!(out, " see {path}");
            }
            out.push('\n');
        }

        for t in &self.terminations {
            let mark = match t.result {
                TerminationResult::Success | TerminationResult::NotRunning => "ok",
                TerminationResult::ForceKilled => "warn",
                TerminationResult::Failed | TerminationResult::Timeout => "FAIL",
            };
            let _ = write!(
                out,
                "{prefix}{mark:<4} stop  {:<24} port {:<5} {:?}",
                t.component_id, t.port, t.result
            );
            if let Some(method) = t.method {
                let _ = write!(out, " via {method:?}");
            }
            if let Some(pid) = t.pid {
                let _ = write!(out, " pid {pid}");
            }
            let _ = write!(out, " in {}ms", t.elapsed_ms);
            if let Some(m) = &t.message {
                let _ = write!(out, " ({m})");
            }
            if let Some(e) = &t.error {
                let _ = write!(out, " error: {e}");
            }
            out.push('\n');
        }

        if let Some(s) = &self.status {
            out.push_str(&render_snapshot(s));
        }

        let failed = self.failed_count();
        if failed > 0 {
            let _ = writeln!(out, "{failed} of {} operations failed", self.total());
        } else if self.total() > 0 {
            let _ = writeln!(out, "{} operations succeeded in {}ms", self.total(), self.duration_ms);
        }
        out
    }
}

pub fn render_snapshot(s: &SystemHealthSnapshot) -> String {
    let mut out = String::new();
    for c in &s.components {
        let _ = write!(
            out,
            "{:<24} port {:<5} {:<11} score {:>3}",
            c.component_id,
            c.port,
            format!("{:?}", c.health.state),
            c.score
        );
        if let Some(ms) = c.health.response_time_ms {
            let _ = write!(out, " {ms}ms");
        }
        if let Some(p) = &c.process {
            let _ = write!(out, " pid {}", p.pid);
            if let Some(mem) = p.memory_bytes {
                let _ = write!(out, " rss {}MiB", mem / (1024 * 1024));
            }
            if let Some(cpu) = p.cpu_percent {
                let _ = write!(out, " cpu {cpu:.1}%");
            }
        }
        if let Some(reg) = c.registered {
            let _ = write!(out, " {}", if reg { "registered" } else { "unregistered" });
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "{}/{} healthy, {} running, {} registered, mean score {:.0}{}{}",
        s.healthy,
        s.total,
        s.running,
        s.registered,
        s.mean_health_score,
        s.mean_response_time_ms
            .map(|ms| format!(", mean response {ms:.0}ms"))
            .unwrap_or_default(),
        if s.hub_connected { ", hub connected" } else { "" }
    );
    out
}

#[cfg(test)]
mod tests {
    use warden_process::{ComponentSpec, FailureKind, TerminationMethod};

    use super::*;

    fn stopped(id: &str, result: TerminationResult) -> TerminationOutcome {
        TerminationOutcome {
            component_id: id.into(),
            port: 8100,
            result,
            method: Some(TerminationMethod::GracefulSignal),
            pid: Some(4242),
            elapsed_ms: 12,
            cleanup_performed: true,
            message: None,
            error: None,
        }
    }

    #[test]
    fn not_running_is_not_a_failure() {
        let mut r = RunReport::new(RunId::new(), Action::Stop, false);
        r.terminations.push(stopped("a", TerminationResult::NotRunning));
        r.terminations.push(stopped("b", TerminationResult::Success));
        let r = r.finish();
        assert_eq!(r.exit_code(), EXIT_OK);
        assert!(r.error().is_none());
        assert!(r.finished_at.is_some());
    }

    #[test]
    fn any_failure_is_a_partial_failure() {
        let mut r = RunReport::new(RunId::new(), Action::Restart, false);
        r.terminations.push(stopped("a", TerminationResult::Timeout));
        r.launches.push(LaunchOutcome::failed(
            &ComponentSpec::new("b", 8101),
            FailureKind::PortInUse,
            "port 8101 still in use",
        ));
        assert_eq!(r.exit_code(), EXIT_FAILURE);
        match r.error() {
            Some(OrchestratorError::PartialFailure { failed, total }) => {
                assert_eq!((failed, total), (2, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
        let text = r.render_text();
        assert!(text.contains("FAIL start b"));
        assert!(text.contains("[PortInUse]"));
        assert!(text.contains("2 of 2 operations failed"));
    }

    #[test]
    fn json_uses_snake_case_and_skips_internal_clock() {
        let r = RunReport::new(RunId::new(), Action::Start, true).finish();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["action"], "start");
        assert_eq!(v["dry_run"], true);
        assert!(v.get("started").is_none());
        assert!(v.get("status").is_none());
    }
}
