use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use warden_process::ProcessHandle;

use crate::error::{OrchestratorError, Result};
use crate::locator::PortLocator;
use crate::process_control::{ProcessControl, StopSignal};
use crate::settings::Settings;
use crate::support::now_unix_ms;

/// Serves `app` on an ephemeral loopback port.
pub(crate) async fn serve(app: axum::Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// A loopback port with nothing listening on it.
pub(crate) async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Settings with every wait shrunk so ladder and scheduler tests run in milliseconds.
pub(crate) fn fast_settings() -> Settings {
    let mut s = Settings::default();
    s.health.attempts = 3;
    s.health.request_timeout = Duration::from_millis(500);
    s.health.backoff_base = Duration::from_millis(20);
    s.health.backoff_max = Duration::from_millis(80);
    s.health.budget = Duration::from_secs(5);
    s.health.poll_interval = Duration::from_millis(50);
    s.health.progress_interval = Duration::from_millis(100);

    s.launch.fast_fail_grace = Duration::from_millis(300);
    s.launch.core_health_timeout = Duration::from_millis(800);
    s.launch.leaf_health_timeout = Duration::from_millis(500);
    s.launch.port_release_timeout = Duration::from_millis(500);

    s.terminate.http_timeout = Duration::from_millis(500);
    s.terminate.http_grace = Duration::from_millis(300);
    s.terminate.signal_timeout = Duration::from_millis(300);
    s.terminate.kill_wait = Duration::from_millis(300);
    s.terminate.recheck_interval = Duration::from_millis(20);
    s.terminate.port_release_timeout = Duration::from_millis(200);
    s.terminate.marker_dirs = Vec::new();

    s.schedule.settle = Duration::from_millis(30);
    s.schedule.core_stop_pause = Duration::from_millis(10);
    s
}

/// How a fake process reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Obeys {
    Term,
    KillOnly,
    Nothing,
    /// Signals bounce with EPERM.
    Refuses,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeProcess {
    pub port: Option<u16>,
    pub name: String,
    pub cmdline: String,
    pub parent: Option<u32>,
    pub obeys: Obeys,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct WorldState {
    pub processes: HashMap<u32, FakeProcess>,
    pub signals: Vec<(u32, StopSignal)>,
}

/// In-memory process table standing in for both the locator and process control.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeWorld {
    pub state: Arc<Mutex<WorldState>>,
}

impl FakeWorld {
    pub fn add(&self, pid: u32, port: Option<u16>, obeys: Obeys) {
        self.add_full(pid, port, obeys, None, "python3", "python3 main.py");
    }

    pub fn add_full(
        &self,
        pid: u32,
        port: Option<u16>,
        obeys: Obeys,
        parent: Option<u32>,
        name: &str,
        cmdline: &str,
    ) {
        self.state.lock().unwrap().processes.insert(
            pid,
            FakeProcess {
                port,
                name: name.to_string(),
                cmdline: cmdline.to_string(),
                parent,
                obeys,
                created_at_unix_ms: now_unix_ms().saturating_sub(60_000),
            },
        );
    }

    pub fn remove(&self, pid: u32) {
        self.state.lock().unwrap().processes.remove(&pid);
    }

    pub fn remove_port(&self, port: u16) {
        self.state
            .lock()
            .unwrap()
            .processes
            .retain(|_, p| p.port != Some(port));
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.state.lock().unwrap().signals.clone()
    }
}

impl PortLocator for FakeWorld {
    fn find_process(&self, port: u16) -> Option<ProcessHandle> {
        let state = self.state.lock().unwrap();
        let (pid, p) = state
            .processes
            .iter()
            .find(|(_, p)| p.port == Some(port))?;
        let child_pids = state
            .processes
            .iter()
            .filter(|(_, c)| c.parent == Some(*pid))
            .map(|(cpid, _)| *cpid)
            .collect();
        Some(ProcessHandle {
            pid: *pid,
            port,
            name: p.name.clone(),
            cmdline: p.cmdline.clone(),
            child_pids,
            cpu_percent: Some(1.0),
            memory_bytes: Some(64 * 1024 * 1024),
            created_at_unix_ms: Some(p.created_at_unix_ms),
        })
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .processes
            .iter()
            .filter(|(_, c)| c.parent == Some(pid))
            .map(|(cpid, _)| *cpid)
            .collect()
    }
}

impl ProcessControl for FakeWorld {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.signals.push((pid, signal));
        let dies = match state.processes.get(&pid).map(|p| p.obeys) {
            Some(Obeys::Term) => true,
            Some(Obeys::KillOnly) => signal == StopSignal::Kill,
            Some(Obeys::Refuses) => {
                return Err(OrchestratorError::process(
                    format!("send {} to pid {pid}", signal.name()),
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ));
            }
            Some(Obeys::Nothing) | None => false,
        };
        if dies {
            state.processes.remove(&pid);
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.contains(pid)
    }
}
