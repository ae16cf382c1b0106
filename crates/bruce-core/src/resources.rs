//! Best-effort process resource sampling. Informational only.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_mb: Option<f64>,
    pub cpu_seconds: Option<f64>,
}

#[cfg(target_os = "linux")]
pub fn sample() -> ResourceSample {
    let status = std::fs::read_to_string("/proc/self/status").ok();
    let stat = std::fs::read_to_string("/proc/self/stat").ok();
    ResourceSample {
        memory_mb: status.as_deref().and_then(|text| status_kb(text, "VmRSS:")).map(kb_to_mb),
        cpu_seconds: stat.as_deref().and_then(cpu_seconds_from_stat),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sample() -> ResourceSample {
    ResourceSample::default()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line[key.len()..].split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// utime + stime from `/proc/<pid>/stat`, in seconds. USER_HZ is 100 on Linux.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn cpu_seconds_from_stat(stat: &str) -> Option<f64> {
    // The command name may contain spaces; fields are counted after its closing paren.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / 100.0)
}
