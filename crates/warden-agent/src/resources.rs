//! Per-process resource readers. Linux reads `/proc`; elsewhere every reader returns `None`
//! and the locator falls back to `ps`.

#[cfg(target_os = "linux")]
use std::sync::OnceLock;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub(crate) fn ticks_per_sec() -> u64 {
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

/// Fields of `/proc/<pid>/stat` after the parenthesised command name; index 0 is `state`.
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_fields(&s)
}

pub(crate) fn parse_stat_fields(stat: &str) -> Option<Vec<String>> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    Some(rest.split_whitespace().map(|s| s.to_string()).collect())
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let parts = stat_fields(pid)?;
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_ppid(pid: u32) -> Option<u32> {
    stat_fields(pid)?.get(1)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_ppid(_pid: u32) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn boot_time_unix_secs() -> Option<u64> {
    static BOOT: OnceLock<Option<u64>> = OnceLock::new();
    *BOOT.get_or_init(|| {
        let s = std::fs::read_to_string("/proc/stat").ok()?;
        s.lines()
            .find_map(|l| l.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
    })
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_start_unix_ms(pid: u32) -> Option<u64> {
    let start_ticks: u64 = stat_fields(pid)?.get(19)?.parse().ok()?;
    let boot = boot_time_unix_secs()?;
    Some(boot.saturating_mul(1000) + start_ticks.saturating_mul(1000) / ticks_per_sec())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_start_unix_ms(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_comm(_pid: u32) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn read_proc_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let parts: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    Some(parts.join(" "))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn read_proc_cmdline(_pid: u32) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
pub(crate) fn list_pids() -> Vec<u32> {
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    rd.flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn list_pids() -> Vec<u32> {
    Vec::new()
}

/// CPU usage over the window between two tick samples, in percent of one core.
pub(crate) fn cpu_percent(prev_ticks: u64, ticks: u64, elapsed: Duration, ticks_per_sec: u64) -> f64 {
    let dt = elapsed.as_secs_f64();
    if dt <= 0.0 || ticks_per_sec == 0 {
        return 0.0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec as f64) / dt * 100.0;
    if cpu.is_finite() { cpu.max(0.0) } else { 0.0 }
}

/// Samples CPU usage of `pid` across `window`. `None` when the process vanished or the
/// platform has no `/proc`.
pub async fn sample_cpu_percent(pid: u32, window: Duration) -> Option<f64> {
    let before = read_proc_cpu_ticks(pid)?;
    let started = tokio::time::Instant::now();
    tokio::time::sleep(window).await;
    let after = read_proc_cpu_ticks(pid)?;
    Some(cpu_percent(before, after, started.elapsed(), ticks_per_sec()))
}
