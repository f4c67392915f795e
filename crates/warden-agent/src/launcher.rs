use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::Instrument;
use warden_process::{ComponentSpec, ComponentState, FailureKind, LaunchOutcome};

use crate::console_log::{ConsoleLog, Stream, classify_failure, log_file_path, read_tail};
use crate::context::{LaunchedComponent, RunContext};
use crate::error::OrchestratorError;
use crate::health::HealthProgress;
use crate::settings::LaunchSettings;
use crate::support::{format_error_chain, now_unix_ms, truncate_utf8};
use crate::terminator::Terminator;

const FAILURE_TAIL_LINES: usize = 40;
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

/// Resolved program and arguments for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl EntryPoint {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|a| a.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Finds how to start `spec`: an explicit registry command, then well-known files under the
/// components root.
pub fn resolve_entry_point(spec: &ComponentSpec, launch: &LaunchSettings) -> crate::error::Result<EntryPoint> {
    let id = spec.id.as_str();
    let component_dir = launch.components_root.join(id);
    let default_dir = if component_dir.is_dir() {
        component_dir.clone()
    } else {
        launch.components_root.clone()
    };
    let working_dir = spec
        .working_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| default_dir.clone());

    if let Some(cmd) = &spec.command {
        let Some((program, args)) = cmd.split_first() else {
            return Err(OrchestratorError::config(format!("{id} has an empty command")));
        };
        return Ok(EntryPoint {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
        });
    }

    let candidates: [(PathBuf, Option<&str>); 5] = [
        (component_dir.join("run.sh"), Some("sh")),
        (component_dir.join("start.sh"), Some("sh")),
        (component_dir.join("bin").join(id), None),
        (component_dir.join("main.py"), Some(launch.python.as_str())),
        (launch.components_root.join("bin").join(id), None),
    ];
    for (path, interpreter) in candidates {
        if !path.is_file() {
            continue;
        }
        let path = std::path::absolute(&path).unwrap_or(path);
        let entry = match interpreter {
            Some(interp) => EntryPoint {
                program: interp.to_string(),
                args: vec![path_arg(&path)],
                working_dir,
            },
            None => EntryPoint {
                program: path_arg(&path),
                args: Vec::new(),
                working_dir,
            },
        };
        return Ok(entry);
    }

    Err(OrchestratorError::config(format!(
        "no entry point for {id} under {} (tried run.sh, start.sh, bin/{id}, main.py, ../bin/{id})",
        component_dir.display()
    )))
}

async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_CONNECT_TIMEOUT, tokio::net::TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn spawn_failure_kind(err: &std::io::Error) -> FailureKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => FailureKind::MissingDependency,
        std::io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
        std::io::ErrorKind::AddrInUse => FailureKind::PortInUse,
        _ => FailureKind::Unknown,
    }
}

enum Capture {
    Piped(ConsoleLog),
    Direct,
}

enum Gate {
    Health(warden_process::HealthStatus),
    Exited(Option<i32>),
}

/// Starts components and gates them on health.
#[derive(Debug, Clone)]
pub struct Launcher {
    ctx: Arc<RunContext>,
    terminator: Terminator,
}

impl Launcher {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        let terminator = Terminator::new(ctx.clone());
        Self { ctx, terminator }
    }

    pub async fn launch(&self, spec: &ComponentSpec) -> LaunchOutcome {
        let span = tracing::info_span!("launch", component = %spec.id, port = spec.port);
        self.launch_inner(spec).instrument(span).await
    }

    async fn launch_inner(&self, spec: &ComponentSpec) -> LaunchOutcome {
        let settings = &self.ctx.settings;
        let paths = spec
            .health_paths
            .clone()
            .unwrap_or_else(|| settings.health.paths.clone());

        if let Some(outcome) = self.precheck(spec, &paths).await {
            return outcome;
        }

        let entry = match resolve_entry_point(spec, &settings.launch) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "cannot start");
                return LaunchOutcome::failed(spec, FailureKind::Configuration, e.to_string());
            }
        };

        if self.ctx.dry_run {
            tracing::info!(command = %entry.display(), cwd = %entry.working_dir.display(), "dry run: would spawn");
            return LaunchOutcome {
                component_id: spec.id.clone(),
                success: true,
                state: ComponentState::DryRun,
                pid: None,
                port: spec.port,
                message: Some(format!("dry run: would run `{}`", entry.display())),
                startup_time_ms: 0,
                health_check_time_ms: 0,
                log_path: None,
                error: None,
                failure_kind: None,
            };
        }

        self.spawn_and_gate(spec, &entry, &paths).await
    }

    /// Deals with whatever already holds the port. `Some` ends the launch early.
    async fn precheck(&self, spec: &ComponentSpec, paths: &[String]) -> Option<LaunchOutcome> {
        let occupant = self.ctx.find_process(spec.port).await;
        if occupant.is_none() && !port_accepts(spec.port).await {
            return None;
        }

        let status = self
            .ctx
            .health
            .check_health_with(&spec.id, spec.port, paths, self.ctx.settings.health.attempts)
            .await;
        let pid = occupant.as_ref().map(|h| h.pid);

        if status.state.is_healthy() && !self.ctx.force {
            tracing::info!(pid = ?pid, "already running and healthy");
            return Some(LaunchOutcome {
                component_id: spec.id.clone(),
                success: true,
                state: ComponentState::Healthy,
                pid,
                port: spec.port,
                message: Some("already running".to_string()),
                startup_time_ms: 0,
                health_check_time_ms: status.response_time_ms.unwrap_or(0),
                log_path: None,
                error: None,
                failure_kind: None,
            });
        }

        if self.ctx.dry_run {
            tracing::info!(pid = ?pid, state = ?status.state, "dry run: would stop the current occupant");
            return None;
        }

        tracing::warn!(pid = ?pid, state = ?status.state, force = self.ctx.force, "port occupied; stopping occupant");
        let stop = self.terminator.terminate_port(&spec.id, spec.port).await;
        if stop.result.is_failure() {
            let mut out = LaunchOutcome::failed(
                spec,
                FailureKind::PortInUse,
                format!(
                    "port {} is held by pid {} and could not be freed: {}",
                    spec.port,
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string()),
                    stop.error.unwrap_or_default()
                ),
            );
            out.pid = pid;
            return Some(out);
        }

        if !self.wait_for_port_free(spec.port).await {
            return Some(LaunchOutcome::failed(
                spec,
                FailureKind::PortInUse,
                format!(
                    "port {} still in use after {}ms",
                    spec.port,
                    self.ctx.settings.launch.port_release_timeout.as_millis()
                ),
            ));
        }
        None
    }

    async fn wait_for_port_free(&self, port: u16) -> bool {
        let deadline = Instant::now() + self.ctx.settings.launch.port_release_timeout;
        loop {
            if self.ctx.find_process(port).await.is_none() && !port_accepts(port).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.ctx.settings.terminate.recheck_interval).await;
        }
    }

    async fn open_capture(&self, log_path: &Path, entry: &EntryPoint) -> anyhow::Result<(Capture, Option<std::fs::File>)> {
        let launch = &self.ctx.settings.launch;
        let header = format!(
            "run {} starting `{}` in {}",
            self.ctx.run_id.0,
            entry.display(),
            entry.working_dir.display()
        );
        if launch.detach {
            if let Some(parent) = log_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .await
                .with_context(|| format!("open {}", log_path.display()))?;
            file.write_all(format!("{}\n", crate::console_log::format_line("warden", &header)).as_bytes())
                .await?;
            file.flush().await?;
            return Ok((Capture::Direct, Some(file.into_std().await)));
        }

        let log = ConsoleLog::open(log_path.to_path_buf(), launch.log_max_bytes, launch.log_max_files)
            .await
            .with_context(|| format!("open {}", log_path.display()))?;
        log.note(header);
        Ok((Capture::Piped(log), None))
    }

    async fn spawn_and_gate(&self, spec: &ComponentSpec, entry: &EntryPoint, paths: &[String]) -> LaunchOutcome {
        let settings = &self.ctx.settings;
        let log_path = log_file_path(&settings.launch.log_dir, spec.id.as_str());
        let log_path_str = log_path.to_string_lossy().into_owned();

        let (capture, direct_file) = match self.open_capture(&log_path, entry).await {
            Ok(c) => c,
            Err(e) => {
                let msg = format_error_chain(&e);
                tracing::error!(error = %msg, "cannot open console log");
                return LaunchOutcome::failed(spec, FailureKind::PermissionDenied, msg);
            }
        };

        let mut cmd = tokio::process::Command::new(&entry.program);
        cmd.args(&entry.args)
            .current_dir(&entry.working_dir)
            .env(&settings.launch.port_env, spec.port.to_string())
            .env("WARDEN_COMPONENT_ID", spec.id.as_str())
            .env("WARDEN_RUN_ID", &self.ctx.run_id.0)
            .envs(&spec.env)
            .stdin(std::process::Stdio::null());
        match &direct_file {
            Some(file) => match (file.try_clone(), file.try_clone()) {
                (Ok(out), Ok(err)) => {
                    cmd.stdout(out).stderr(err);
                }
                (Err(e), _) | (_, Err(e)) => {
                    return LaunchOutcome::failed(spec, FailureKind::PermissionDenied, format!("duplicate log handle: {e}"));
                }
            },
            None => {
                cmd.stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped());
            }
        }

        // Own session: signals reach the whole tree, and the component outlives us.
        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(command = %entry.display(), cwd = %entry.working_dir.display(), log = %log_path_str, "spawning");
        let spawned_at = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let kind = spawn_failure_kind(&e);
                let err = OrchestratorError::process(format!("spawn `{}`", entry.display()), e);
                tracing::error!(error = %err, source = ?std::error::Error::source(&err), "spawn failed");
                if let Capture::Piped(log) = &capture {
                    log.note(format!("spawn failed: {err}"));
                    log.flush().await;
                }
                let mut out = LaunchOutcome::failed(
                    spec,
                    kind,
                    format!("{err}: {}", std::error::Error::source(&err).map(|s| s.to_string()).unwrap_or_default()),
                );
                out.log_path = Some(log_path_str);
                return out;
            }
        };
        let Some(pid) = child.id() else {
            return LaunchOutcome::failed(spec, FailureKind::Unknown, "child exited before its pid was read");
        };

        let mut readers = Vec::new();
        if let Capture::Piped(log) = &capture {
            if let Some(out) = child.stdout.take() {
                readers.push(log.attach(Stream::Stdout, out));
            }
            if let Some(err) = child.stderr.take() {
                readers.push(log.attach(Stream::Stderr, err));
            }
        }

        self.write_pid_marker(spec, pid).await;
        self.ctx
            .launched
            .insert(LaunchedComponent {
                spec: spec.clone(),
                pid: Some(pid),
                log_path: Some(log_path_str.clone()),
                started_at_unix_ms: now_unix_ms(),
                state: ComponentState::Starting,
                exit_code: None,
                adopted: false,
            })
            .await;

        // Reaper: owns the child from here on.
        let (exit_tx, mut exit_rx) = oneshot::channel::<Option<i32>>();
        {
            let launched = self.ctx.launched.clone();
            let id = spec.id.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::warn!(component = %id, pid, error = %e, "wait failed");
                        None
                    }
                };
                tracing::info!(component = %id, pid, exit_code = ?code, "component exited");
                launched.mark_exited(&id, pid, code).await;
                let _ = exit_tx.send(code);
            });
        }

        let grace = settings.launch.fast_fail_grace;
        let early_exit = tokio::select! {
            code = &mut exit_rx => Some(code.ok().flatten()),
            _ = tokio::time::sleep(grace) => None,
        };
        if let Some(code) = early_exit {
            return self
                .failed_during_startup(spec, pid, code, &capture, readers, &log_path, spawned_at)
                .await;
        }

        let core = self.ctx.is_core(spec);
        let timeout = settings
            .health_timeout_for(core, spec.health_timeout_secs)
            .saturating_sub(spawned_at.elapsed());

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<HealthProgress>();
        let progress_log = match &capture {
            Capture::Piped(log) => Some(log),
            Capture::Direct => None,
        };

        let health_started = Instant::now();
        let gate = {
            let wait = self
                .ctx
                .health
                .wait_for_healthy(&spec.id, spec.port, paths, timeout, Some(&progress_tx));
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    st = &mut wait => break Gate::Health(st),
                    code = &mut exit_rx => break Gate::Exited(code.ok().flatten()),
                    Some(p) = progress_rx.recv() => {
                        if let Some(log) = progress_log {
                            log.note(format!(
                                "waiting for health ({}s of {}s, {:?})",
                                p.elapsed.as_secs(),
                                p.timeout.as_secs(),
                                p.state
                            ));
                        }
                    }
                }
            }
        };
        let health_check_time_ms = health_started.elapsed().as_millis() as u64;

        let status = match gate {
            Gate::Exited(code) => {
                return self
                    .failed_during_startup(spec, pid, code, &capture, readers, &log_path, spawned_at)
                    .await;
            }
            Gate::Health(status) => status,
        };

        let startup_time_ms = spawned_at.elapsed().as_millis() as u64;
        let healthy = status.state.is_healthy();
        let state = if healthy {
            ComponentState::Healthy
        } else {
            ComponentState::Unhealthy
        };
        self.ctx.launched.set_state(&spec.id, state).await;

        let message = if healthy {
            tracing::info!(pid, startup_ms = startup_time_ms, endpoint = ?status.endpoint, "healthy");
            None
        } else {
            let reason = status
                .last_error
                .clone()
                .unwrap_or_else(|| format!("{:?}", status.state));
            tracing::warn!(pid, state = ?status.state, reason = %reason, "running but never reported healthy");
            Some(format!("process is running but not healthy: {reason}"))
        };
        if let Capture::Piped(log) = &capture {
            log.note(match &message {
                None => format!("healthy after {startup_time_ms}ms"),
                Some(m) => m.clone(),
            });
        }

        LaunchOutcome {
            component_id: spec.id.clone(),
            success: true,
            state,
            pid: Some(pid),
            port: spec.port,
            message,
            startup_time_ms,
            health_check_time_ms,
            log_path: Some(log_path_str),
            error: None,
            failure_kind: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn failed_during_startup(
        &self,
        spec: &ComponentSpec,
        pid: u32,
        code: Option<i32>,
        capture: &Capture,
        readers: Vec<tokio::task::JoinHandle<u64>>,
        log_path: &Path,
        spawned_at: Instant,
    ) -> LaunchOutcome {
        // Pipes close on exit; drain them before reading the tail.
        for reader in readers {
            let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
        }
        if let Capture::Piped(log) = capture {
            log.note(format!("exited during startup with code {code:?}"));
            log.flush().await;
        }

        let tail = read_tail(log_path, FAILURE_TAIL_LINES).await;
        let kind = classify_failure(&tail);
        let last = tail
            .iter()
            .rev()
            .find(|l| !l.contains("[warden]"))
            .map(|l| truncate_utf8(l, 300))
            .unwrap_or_default();
        tracing::error!(pid, exit_code = ?code, kind = ?kind, last_line = %last, "exited during startup");

        self.remove_pid_marker(spec).await;
        LaunchOutcome {
            component_id: spec.id.clone(),
            success: false,
            state: ComponentState::Failed,
            pid: Some(pid),
            port: spec.port,
            message: None,
            startup_time_ms: spawned_at.elapsed().as_millis() as u64,
            health_check_time_ms: 0,
            log_path: Some(log_path.to_string_lossy().into_owned()),
            error: Some(format!(
                "exited with code {} during startup{}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "none (signalled)".to_string()),
                if last.is_empty() { String::new() } else { format!(": {last}") }
            )),
            failure_kind: Some(kind),
        }
    }

    fn pid_marker_path(&self, spec: &ComponentSpec) -> PathBuf {
        self.ctx
            .settings
            .launch
            .run_dir
            .join(format!("{}.pid", spec.id))
    }

    async fn write_pid_marker(&self, spec: &ComponentSpec, pid: u32) {
        let path = self.pid_marker_path(spec);
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %e, "cannot create run dir");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, format!("{pid}\n")).await {
            tracing::warn!(path = %path.display(), error = %e, "cannot write pid marker");
        }
    }

    async fn remove_pid_marker(&self, spec: &ComponentSpec) {
        let _ = tokio::fs::remove_file(self.pid_marker_path(spec)).await;
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, routing::get};

    use super::*;
    use crate::process_control::{OsProcessControl, ProcessControl, StopSignal};
    use crate::registry::FileRegistry;
    use crate::settings::Settings;
    use crate::test_support::{FakeWorld, Obeys, closed_port, fast_settings, serve};

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Arc<RunContext>,
        world: FakeWorld,
    }

    fn fixture(dry_run: bool, tweak: impl FnOnce(&mut Settings)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fast_settings();
        settings.launch.components_root = dir.path().join("components");
        settings.launch.log_dir = dir.path().join("logs");
        settings.launch.run_dir = dir.path().join("run");
        settings.terminate.marker_dirs = vec![settings.launch.run_dir.clone()];
        tweak(&mut settings);
        let world = FakeWorld::default();
        let registry = Arc::new(FileRegistry::from_specs(Vec::new(), None).unwrap());
        let ctx = Arc::new(
            RunContext::new(settings, registry)
                .unwrap()
                .with_locator(Arc::new(world.clone()))
                .with_control(Arc::new(world.clone()))
                .with_dry_run(dry_run),
        );
        Fixture { _dir: dir, ctx, world }
    }

    fn spec_with(id: &str, port: u16, cmd: &[&str]) -> ComponentSpec {
        let mut spec = ComponentSpec::new(id, port);
        spec.command = Some(cmd.iter().map(|s| s.to_string()).collect());
        spec
    }

    fn kill(pid: Option<u32>) {
        if let Some(pid) = pid {
            let _ = OsProcessControl.signal(pid, StopSignal::Kill);
        }
    }

    #[test]
    fn entry_point_discovery_order() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSettings {
            components_root: dir.path().to_path_buf(),
            ..LaunchSettings::default()
        };
        let spec = ComponentSpec::new("svc", 9000);

        assert_eq!(
            resolve_entry_point(&spec, &launch).unwrap_err().code(),
            "configuration_error"
        );

        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin").join("svc"), "").unwrap();
        let e = resolve_entry_point(&spec, &launch).unwrap();
        assert!(e.program.ends_with("bin/svc"));

        std::fs::create_dir_all(dir.path().join("svc")).unwrap();
        std::fs::write(dir.path().join("svc").join("main.py"), "").unwrap();
        let e = resolve_entry_point(&spec, &launch).unwrap();
        assert_eq!(e.program, "python3");
        assert!(e.args[0].ends_with("svc/main.py"));
        assert_eq!(e.working_dir, dir.path().join("svc"));

        std::fs::write(dir.path().join("svc").join("run.sh"), "").unwrap();
        let e = resolve_entry_point(&spec, &launch).unwrap();
        assert_eq!(e.program, "sh");
        assert!(e.args[0].ends_with("svc/run.sh"));

        let explicit = spec_with("svc", 9000, &["uvicorn", "app:app"]);
        let e = resolve_entry_point(&explicit, &launch).unwrap();
        assert_eq!(e.display(), "uvicorn app:app");
    }

    #[tokio::test]
    async fn healthy_occupant_short_circuits() {
        let app = Router::new().route("/health", get(|| async { "ok" }));
        let port = serve(app).await;
        let fx = fixture(false, |_| {});
        fx.world.add(7000, Some(port), Obeys::Term);

        let spec = spec_with("message-bus", port, &["/nonexistent/warden-test-binary"]);
        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(out.success);
        assert_eq!(out.state, ComponentState::Healthy);
        assert_eq!(out.startup_time_ms, 0);
        assert_eq!(out.pid, Some(7000));
        assert_eq!(out.message.as_deref(), Some("already running"));
        assert!(fx.world.signals().is_empty());
        assert!(fx.ctx.launched.is_empty().await);
    }

    #[tokio::test]
    async fn unhealthy_occupant_is_replaced() {
        let port = closed_port().await;
        let fx = fixture(false, |s| {
            s.launch.core_health_timeout = Duration::from_secs(5);
            s.launch.leaf_health_timeout = Duration::from_secs(5);
        });
        fx.world.add(7001, Some(port), Obeys::Term);

        // The replacement starts answering once it has been spawned.
        let marker = fx.ctx.settings.launch.run_dir.join("memory-store.pid");
        tokio::spawn(async move {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let app = Router::new().route("/health", get(|| async { "ok" }));
            axum::serve(listener, app).await.unwrap();
        });

        let spec = spec_with("memory-store", port, &["sleep", "30"]);
        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        kill(out.pid);

        assert!(out.success, "{out:?}");
        assert_eq!(out.state, ComponentState::Healthy);
        assert_eq!(fx.world.signals(), vec![(7001, StopSignal::Terminate)]);
        assert_ne!(out.pid, Some(7001));
        assert!(out.log_path.is_some());
    }

    #[tokio::test]
    async fn early_exit_is_classified_from_the_log() {
        let port = closed_port().await;
        let fx = fixture(false, |_| {});
        let spec = spec_with(
            "vector-store",
            port,
            &["sh", "-c", "echo starting; echo \"ModuleNotFoundError: No module named 'fastapi'\" >&2; exit 3"],
        );

        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(!out.success);
        assert_eq!(out.state, ComponentState::Failed);
        assert_eq!(out.failure_kind, Some(FailureKind::MissingDependency));
        assert!(out.error.as_deref().unwrap().contains("code 3"));

        let log = std::fs::read_to_string(out.log_path.unwrap()).unwrap();
        assert!(log.contains("[stdout] starting"));
        assert!(log.contains("[stderr] ModuleNotFoundError"));
        assert!(!fx.ctx.settings.launch.run_dir.join("vector-store.pid").exists());
    }

    #[tokio::test]
    async fn live_but_silent_process_counts_as_started_but_unhealthy() {
        let port = closed_port().await;
        let fx = fixture(false, |_| {});
        let spec = spec_with("search", port, &["sh", "-c", "echo booting; exec sleep 30"]);

        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        kill(out.pid);

        assert!(out.success);
        assert_eq!(out.state, ComponentState::Unhealthy);
        assert!(out.message.unwrap().contains("not healthy"));
        let pid = out.pid.unwrap();
        let marker = std::fs::read_to_string(fx.ctx.settings.launch.run_dir.join("search.pid")).unwrap();
        assert_eq!(marker.trim(), pid.to_string());
        let entry = fx.ctx.launched.get(&spec.id).await.unwrap();
        assert_eq!(entry.pid, Some(pid));
    }

    #[tokio::test]
    async fn injected_environment_reaches_the_component() {
        let port = closed_port().await;
        let fx = fixture(false, |_| {});
        let mut spec = spec_with(
            "env-probe",
            port,
            &["sh", "-c", "echo port=$PORT id=$WARDEN_COMPONENT_ID model=$EMBED_MODEL; exit 1"],
        );
        spec.env.insert("EMBED_MODEL".to_string(), "small".to_string());

        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(!out.success);
        let log = std::fs::read_to_string(out.log_path.unwrap()).unwrap();
        assert!(log.contains(&format!("port={port} id=env-probe model=small")));
    }

    #[tokio::test]
    async fn dry_run_spawns_nothing() {
        let port = closed_port().await;
        let fx = fixture(true, |_| {});
        let spec = spec_with("search", port, &["/nonexistent/warden-test-binary", "--flag"]);

        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(out.success);
        assert_eq!(out.state, ComponentState::DryRun);
        assert!(out.pid.is_none());
        assert!(out.message.unwrap().contains("--flag"));
        assert!(fx.ctx.launched.is_empty().await);
        assert!(!fx.ctx.settings.launch.log_dir.exists());
    }

    #[tokio::test]
    async fn missing_entry_point_is_a_configuration_failure() {
        let port = closed_port().await;
        let fx = fixture(false, |_| {});
        let out = Launcher::new(fx.ctx.clone())
            .launch(&ComponentSpec::new("ghost", port))
            .await;
        assert!(!out.success);
        assert_eq!(out.failure_kind, Some(FailureKind::Configuration));
    }

    #[tokio::test]
    async fn missing_binary_is_a_missing_dependency() {
        let port = closed_port().await;
        let fx = fixture(false, |_| {});
        let spec = spec_with("ghost", port, &["/nonexistent/warden-test-binary"]);
        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(!out.success);
        assert_eq!(out.failure_kind, Some(FailureKind::MissingDependency));
    }

    #[tokio::test]
    async fn detached_capture_writes_straight_to_the_log() {
        let port = closed_port().await;
        let fx = fixture(false, |s| s.launch.detach = true);
        let spec = spec_with("detached", port, &["sh", "-c", "echo direct-output; exit 2"]);

        let out = Launcher::new(fx.ctx.clone()).launch(&spec).await;
        assert!(!out.success);
        let log = std::fs::read_to_string(out.log_path.unwrap()).unwrap();
        assert!(log.contains("[warden] run "));
        // Raw child output: no timestamp or stream tag once the CLI is out of the path.
        assert!(log.lines().any(|l| l == "direct-output"));
        assert!(!log.contains("[stdout]"));
    }
}
