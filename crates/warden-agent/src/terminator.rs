use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::Instrument;
use warden_process::{
    ComponentId, ComponentSpec, ProcessHandle, TerminationMethod, TerminationOutcome,
    TerminationResult,
};

use crate::context::RunContext;
use crate::error::OrchestratorError;
use crate::process_control::StopSignal;
use crate::support::now_unix_ms;

const MARKER_SUFFIXES: [&str; 3] = ["pid", "sock", "lock"];

/// Stops whatever listens on a component's port, escalating from a polite HTTP request to
/// SIGKILL of the whole tree.
#[derive(Debug, Clone)]
pub struct Terminator {
    ctx: Arc<RunContext>,
}

impl Terminator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub async fn terminate(&self, spec: &ComponentSpec) -> TerminationOutcome {
        self.terminate_port(&spec.id, spec.port).await
    }

    pub async fn terminate_port(&self, id: &ComponentId, port: u16) -> TerminationOutcome {
        let span = tracing::info_span!("terminate", component = %id, port);
        let started = Instant::now();
        let mut outcome = self.run_ladder(id, port, started).instrument(span).await;
        outcome.elapsed_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    async fn run_ladder(&self, id: &ComponentId, port: u16, started: Instant) -> TerminationOutcome {
        let mut outcome = TerminationOutcome {
            component_id: id.clone(),
            port,
            result: TerminationResult::NotRunning,
            method: None,
            pid: None,
            elapsed_ms: 0,
            cleanup_performed: false,
            message: None,
            error: None,
        };

        let Some(handle) = self.ctx.find_process(port).await else {
            tracing::debug!("nothing listening");
            outcome.message = Some(format!(
                "{}; nothing listening on port {port}",
                OrchestratorError::NotRunning(id.clone())
            ));
            return outcome;
        };
        outcome.pid = Some(handle.pid);

        if let Err(reason) = self.ctx.settings.safety.check(
            &handle,
            id,
            std::process::id(),
            now_unix_ms(),
        ) {
            let err = OrchestratorError::SafetyRejected {
                pid: handle.pid,
                reason,
            };
            tracing::warn!(pid = handle.pid, name = %handle.name, error = %err, "refusing to stop process");
            outcome.result = TerminationResult::Failed;
            outcome.error = Some(err.to_string());
            return outcome;
        }

        if self.ctx.dry_run {
            let descendants = self.ctx.descendants(handle.pid).await;
            tracing::info!(
                pid = handle.pid,
                name = %handle.name,
                descendants = descendants.len(),
                "dry run: would request shutdown, then SIGTERM, then SIGKILL"
            );
            outcome.result = TerminationResult::Success;
            outcome.message = Some(format!(
                "dry run: would stop pid {} ({}) and {} descendant(s)",
                handle.pid,
                handle.name,
                descendants.len()
            ));
            return outcome;
        }

        let (result, method) = self.escalate(id, port, &handle, started, &mut outcome).await;
        outcome.result = result;
        outcome.method = method;

        if !result.is_failure() {
            outcome.cleanup_performed = self.cleanup_markers(id).await;
            if !self.wait_for_port_release(port).await {
                tracing::warn!("process gone but port still bound");
                outcome.message = Some(format!("port {port} still bound after stop"));
            }
        }
        outcome
    }

    async fn escalate(
        &self,
        id: &ComponentId,
        port: u16,
        handle: &ProcessHandle,
        started: Instant,
        outcome: &mut TerminationOutcome,
    ) -> (TerminationResult, Option<TerminationMethod>) {
        let settings = &self.ctx.settings.terminate;
        let pid = handle.pid;

        if self.request_shutdown(id, port).await {
            if self.wait_until_released(pid, port, settings.http_grace).await {
                tracing::info!(pid, "stopped after shutdown request");
                return (TerminationResult::Success, Some(TerminationMethod::GracefulHttp));
            }
            tracing::debug!(pid, "shutdown acknowledged but port still held");
        }

        match self.ctx.control.signal(pid, StopSignal::Terminate) {
            Ok(()) => {
                if self.wait_for_exit(pid, settings.signal_timeout).await {
                    tracing::info!(pid, "stopped after SIGTERM");
                    return (TerminationResult::Success, Some(TerminationMethod::GracefulSignal));
                }
                tracing::warn!(
                    pid,
                    timeout_ms = settings.signal_timeout.as_millis() as u64,
                    "SIGTERM ignored; escalating"
                );
            }
            Err(e) => {
                // A vanished pid already reads as Ok; anything else (EPERM) SIGKILL would hit too.
                tracing::error!(pid, error = %e, "SIGTERM failed");
                outcome.error = Some(e.to_string());
                return (TerminationResult::Failed, Some(TerminationMethod::GracefulSignal));
            }
        }

        // Children first so nothing is reparented mid-kill.
        let descendants = self.ctx.descendants(pid).await;
        for child in &descendants {
            if let Err(e) = self.ctx.control.signal(*child, StopSignal::Kill) {
                tracing::debug!(pid = *child, error = %e, "SIGKILL of descendant failed");
            }
        }
        if let Err(e) = self.ctx.control.signal(pid, StopSignal::Kill) {
            tracing::error!(pid, error = %e, "SIGKILL failed");
            outcome.error = Some(e.to_string());
            return (TerminationResult::Failed, Some(TerminationMethod::ForceKill));
        }

        if self.wait_for_exit(pid, settings.kill_wait).await {
            tracing::warn!(pid, descendants = descendants.len(), "force killed");
            outcome.error = None;
            return (TerminationResult::ForceKilled, Some(TerminationMethod::ForceKill));
        }

        let err = OrchestratorError::Timeout {
            what: format!("stopping pid {pid}"),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::error!(pid, error = %err, "process survived SIGKILL");
        outcome.error = Some(err.to_string());
        (TerminationResult::Timeout, Some(TerminationMethod::ForceKill))
    }

    /// POSTs to each shutdown endpoint until one acknowledges, and announces the shutdown on
    /// the hub socket when one is configured.
    async fn request_shutdown(&self, id: &ComponentId, port: u16) -> bool {
        let settings = &self.ctx.settings.terminate;
        let mut acked = false;

        for path in &settings.shutdown_paths {
            let url = self.ctx.health.url(port, path);
            let resp = self
                .ctx
                .health
                .client()
                .post(&url)
                .timeout(settings.http_timeout)
                .send()
                .await;
            match resp {
                Ok(r) if r.status().is_success() => {
                    tracing::debug!(path = %path, status = %r.status(), "shutdown acknowledged");
                    acked = true;
                    break;
                }
                Ok(r) => {
                    tracing::debug!(path = %path, status = %r.status(), "shutdown endpoint declined");
                }
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "shutdown request failed");
                    break;
                }
            }
        }

        if let Some(ws_url) = &self.ctx.settings.hub.ws_url {
            match crate::hub::announce_shutdown(
                ws_url,
                id,
                port,
                &self.ctx.run_id,
                settings.http_timeout,
            )
            .await
            {
                Ok(true) => acked = true,
                Ok(false) => tracing::debug!("hub did not acknowledge shutdown"),
                Err(e) => tracing::debug!(error = %e, "hub shutdown announcement failed"),
            }
        }
        acked
    }

    /// True once `pid` no longer holds `port` or has exited.
    async fn wait_until_released(&self, pid: u32, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let held = self
                .ctx
                .find_process(port)
                .await
                .is_some_and(|h| h.pid == pid);
            if !held || !self.ctx.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.settings.terminate.recheck_interval).await;
        }
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.ctx.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.settings.terminate.recheck_interval).await;
        }
    }

    async fn wait_for_port_release(&self, port: u16) -> bool {
        let deadline = Instant::now() + self.ctx.settings.terminate.port_release_timeout;
        loop {
            if self.ctx.find_process(port).await.is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.settings.terminate.recheck_interval).await;
        }
    }

    /// Removes `<id>.pid`, `<id>.sock` and `<id>.lock` from every marker directory.
    async fn cleanup_markers(&self, id: &ComponentId) -> bool {
        let mut removed = false;
        for dir in &self.ctx.settings.terminate.marker_dirs {
            for suffix in MARKER_SUFFIXES {
                let path = dir.join(format!("{id}.{suffix}"));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), "removed marker");
                        removed = true;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "could not remove marker");
                    }
                }
            }
        }
        self.ctx.launched.remove(id).await;
        removed
    }
}
