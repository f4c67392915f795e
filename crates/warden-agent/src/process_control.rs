use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl StopSignal {
    pub fn name(self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Mutating half of process control. Every signal the orchestrator sends goes through here.
pub trait ProcessControl: Send + Sync {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct OsProcessControl;

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| crate::resources::parse_stat_fields(&s))
        .and_then(|f| f.first().cloned())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
impl ProcessControl for OsProcessControl {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        let sig = match signal {
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Kill => libc::SIGKILL,
        };
        let pid_i = i32::try_from(pid)
            .map_err(|_| OrchestratorError::config(format!("pid out of range: {pid}")))?;

        // Components run in their own session; signal the whole group when the pid leads one.
        let pgid = unsafe { libc::getpgid(pid_i) };
        let target = if pgid == pid_i { -pid_i } else { pid_i };

        let rc = unsafe { libc::kill(target, sig) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(OrchestratorError::process(
                format!("send {} to pid {pid}", signal.name()),
                err,
            ));
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid_i) = i32::try_from(pid) else {
            return false;
        };
        let rc = unsafe { libc::kill(pid_i, 0) };
        let alive = rc == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        alive && !is_zombie(pid)
    }
}

#[cfg(not(unix))]
impl ProcessControl for OsProcessControl {
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        Err(OrchestratorError::process(
            format!("send {} to pid {pid}", signal.name()),
            std::io::Error::from(std::io::ErrorKind::Unsupported),
        ))
    }

    fn is_alive(&self, _pid: u32) -> bool {
        false
    }
}
