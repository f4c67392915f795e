use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use warden_process::ProcessHandle;

use crate::resources;
use crate::support::now_unix_ms;

/// TCP state code for LISTEN in `/proc/net/tcp*`. TIME_WAIT (`06`) is deliberately ignored.
const TCP_LISTEN: &str = "0A";

/// Answers "which process, if any, is listening on this port". Read-only.
pub trait PortLocator: Send + Sync {
    fn find_process(&self, port: u16) -> Option<ProcessHandle>;

    /// Direct children of `pid`.
    fn children(&self, pid: u32) -> Vec<u32>;

    /// All descendants of `pid`, deepest first.
    fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        collect_descendants(self, pid, &mut out, &mut seen);
        out
    }
}

fn collect_descendants<L: PortLocator + ?Sized>(
    locator: &L,
    pid: u32,
    out: &mut Vec<u32>,
    seen: &mut HashSet<u32>,
) {
    for child in locator.children(pid) {
        if !seen.insert(child) {
            continue;
        }
        collect_descendants(locator, child, out, seen);
        out.push(child);
    }
}

/// Locator chosen once per platform at startup.
#[derive(Debug, Clone)]
pub enum PlatformLocator {
    ProcNet(ProcNetLocator),
    Lsof(LsofLocator),
}

impl PlatformLocator {
    pub fn detect() -> Self {
        let proc_root = PathBuf::from("/proc");
        if cfg!(target_os = "linux") && proc_root.join("net/tcp").exists() {
            tracing::debug!("process locator: /proc/net enumeration");
            PlatformLocator::ProcNet(ProcNetLocator { proc_root })
        } else {
            tracing::debug!("process locator: lsof");
            PlatformLocator::Lsof(LsofLocator)
        }
    }
}

impl PortLocator for PlatformLocator {
    fn find_process(&self, port: u16) -> Option<ProcessHandle> {
        match self {
            PlatformLocator::ProcNet(l) => l.find_process(port),
            PlatformLocator::Lsof(l) => l.find_process(port),
        }
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        match self {
            PlatformLocator::ProcNet(l) => l.children(pid),
            PlatformLocator::Lsof(l) => l.children(pid),
        }
    }
}

/// Parses one `/proc/net/tcp{,6}` table and returns socket inodes listening on `port`.
pub(crate) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    let mut out = Vec::new();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let (Some(local), Some(state), Some(inode)) = (cols.get(1), cols.get(3), cols.get(9))
        else {
            continue;
        };
        if *state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if u16::from_str_radix(port_hex, 16).ok() != Some(port) {
            continue;
        }
        if let Ok(inode) = inode.parse::<u64>()
            && inode != 0
        {
            out.push(inode);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ProcNetLocator {
    proc_root: PathBuf,
}

impl ProcNetLocator {
    fn inodes_for_port(&self, port: u16) -> HashSet<u64> {
        let mut inodes = HashSet::new();
        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(text) = std::fs::read_to_string(self.proc_root.join(table)) {
                inodes.extend(listening_inodes(&text, port));
            }
        }
        inodes
    }

    fn pid_owning_inode(&self, inodes: &HashSet<u64>) -> Option<u32> {
        let mut denied = 0usize;
        for pid in resources::list_pids() {
            let fd_dir = self.proc_root.join(pid.to_string()).join("fd");
            let rd = match std::fs::read_dir(&fd_dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    denied += 1;
                    continue;
                }
                Err(_) => continue,
            };
            for entry in rd.flatten() {
                let Ok(target) = std::fs::read_link(entry.path()) else {
                    continue;
                };
                if let Some(inode) = socket_inode(&target)
                    && inodes.contains(&inode)
                {
                    return Some(pid);
                }
            }
        }
        if denied > 0 {
            tracing::warn!(
                denied,
                "listening socket found but its owner is not visible; insufficient permissions"
            );
        }
        None
    }

    fn describe(&self, pid: u32, port: u16) -> ProcessHandle {
        ProcessHandle {
            pid,
            port,
            name: resources::read_proc_comm(pid).unwrap_or_default(),
            cmdline: resources::read_proc_cmdline(pid).unwrap_or_default(),
            child_pids: self.children(pid),
            cpu_percent: None,
            memory_bytes: resources::read_proc_rss_bytes(pid),
            created_at_unix_ms: resources::read_proc_start_unix_ms(pid),
        }
    }
}

fn socket_inode(link: &Path) -> Option<u64> {
    let s = link.to_str()?;
    s.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

impl PortLocator for ProcNetLocator {
    fn find_process(&self, port: u16) -> Option<ProcessHandle> {
        let inodes = self.inodes_for_port(port);
        if inodes.is_empty() {
            return None;
        }
        let pid = self.pid_owning_inode(&inodes)?;
        Some(self.describe(pid, port))
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        resources::list_pids()
            .into_iter()
            .filter(|p| *p != pid && resources::read_proc_ppid(*p) == Some(pid))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LsofLocator;

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match std::process::Command::new(program).args(args).output() {
        Ok(out) => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Err(e) => {
            tracing::warn!(program, error = %e, "process lookup utility unavailable");
            None
        }
    }
}

/// Parses `ps` elapsed time: `[[dd-]hh:]mm:ss`.
pub(crate) fn parse_etime_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (days, rest) = match raw.split_once('-') {
        Some((d, r)) => (d.parse::<u64>().ok()?, r),
        None => (0, raw),
    };
    let parts: Vec<u64> = rest
        .split(':')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let secs = match parts.as_slice() {
        [m, s] => m * 60 + s,
        [h, m, s] => h * 3600 + m * 60 + s,
        _ => return None,
    };
    Some(days * 86_400 + secs)
}

fn parse_pid_lines(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .collect()
}

impl LsofLocator {
    fn describe(&self, pid: u32, port: u16) -> ProcessHandle {
        let pid_s = pid.to_string();
        let stats = run_tool("ps", &["-o", "rss=,etime=,comm=", "-p", &pid_s]).unwrap_or_default();
        let mut fields = stats.split_whitespace();
        let rss_kib = fields.next().and_then(|v| v.parse::<u64>().ok());
        let etime = fields.next().and_then(parse_etime_secs);
        let name = fields
            .next()
            .map(|c| c.rsplit('/').next().unwrap_or(c).to_string())
            .unwrap_or_default();
        let cmdline = run_tool("ps", &["-o", "args=", "-p", &pid_s])
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        ProcessHandle {
            pid,
            port,
            name,
            cmdline,
            child_pids: self.children(pid),
            cpu_percent: None,
            memory_bytes: rss_kib.map(|k| k.saturating_mul(1024)),
            created_at_unix_ms: etime.map(|s| now_unix_ms().saturating_sub(s * 1000)),
        }
    }
}

impl PortLocator for LsofLocator {
    fn find_process(&self, port: u16) -> Option<ProcessHandle> {
        let filter = format!("-iTCP:{port}");
        let out = run_tool("lsof", &["-nP", &filter, "-sTCP:LISTEN", "-t"])?;
        let pid = parse_pid_lines(&out).into_iter().next()?;
        Some(self.describe(pid, port))
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        run_tool("pgrep", &["-P", &pid.to_string()])
            .map(|s| parse_pid_lines(&s))
            .unwrap_or_default()
    }
}
