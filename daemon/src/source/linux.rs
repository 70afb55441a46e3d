use super::ProcessInfoSource;
use crate::error::AcquisitionError;
use crate::sample::{ProcessIdentity, ProcessSample, ProcessStatus, SystemSample};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Clone)]
struct CpuSample {
    total_ticks: u64, // utime + stime
    timestamp: Instant,
}

/// Fields of `/proc/<pid>/stat` we care about, already split at the
/// closing paren of the command name.
struct StatLine {
    name: String,
    state: char,
    utime: u64,
    stime: u64,
    nice: i32,
    start_ticks: u64,
    rss_pages: u64,
}

impl StatLine {
    fn parse(content: &str) -> Option<Self> {
        // The command name may contain spaces and parens; it ends at the last ')'.
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let name = content.get(open + 1..close)?.to_string();
        let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
        // rest[0] is field 3 (state) of proc(5)
        if rest.len() < 22 {
            return None;
        }
        Some(Self {
            name,
            state: rest[0].chars().next().unwrap_or('?'),
            utime: rest[11].parse().unwrap_or(0),
            stime: rest[12].parse().unwrap_or(0),
            nice: rest[16].parse().unwrap_or(0),
            start_ticks: rest[19].parse().unwrap_or(0),
            rss_pages: rest[21].parse().unwrap_or(0),
        })
    }
}

/// Aggregate `cpu` line of `/proc/stat`, in ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|v| v.parse().unwrap_or(0))
            .collect();
        if fields.len() < 4 {
            return None;
        }
        // user nice system idle iowait irq softirq steal; guest time is
        // already counted in user.
        let total = fields.iter().take(8).sum();
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Some(Self { total, idle })
    }

    /// Busy percentage between two reads; 0 when no ticks elapsed.
    fn busy_percent_since(&self, prev: &CpuTimes) -> f64 {
        let total = self.total.saturating_sub(prev.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(prev.idle).min(total);
        (total - idle) as f64 * 100.0 / total as f64
    }
}

/// `(MemTotal, MemAvailable)` in bytes. Kernels without `MemAvailable`
/// fall back to `MemFree`.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |key: &str| {
        content.lines().find_map(|line| {
            let value = line.strip_prefix(key)?.strip_prefix(':')?;
            value.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total * 1024, available.min(total) * 1024))
}

/// Reads process state straight from procfs.
pub struct LinuxProcessSource {
    proc_root: PathBuf,
    page_size: u64,
    clock_ticks: u64,
    boot_time_ms: u64,
    cpu_samples: Mutex<HashMap<ProcessIdentity, CpuSample>>,
    system_cpu: Mutex<Option<CpuTimes>>,
}

impl LinuxProcessSource {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Use an alternative procfs mount, e.g. a container's.
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(1) as u64;
        let clock_ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
        let proc_root = proc_root.into();
        let boot_time_ms = Self::read_boot_time(&proc_root) * 1000;
        Self {
            proc_root,
            page_size,
            clock_ticks,
            boot_time_ms,
            cpu_samples: Mutex::new(HashMap::new()),
            system_cpu: Mutex::new(None),
        }
    }

    fn read_boot_time(proc_root: &Path) -> u64 {
        let stat = fs::read_to_string(proc_root.join("stat")).unwrap_or_default();
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// `update_baseline` is false for one-off reads, so they do not shorten
    /// the window the next snapshot measures CPU over.
    fn parse_process(&self, pid: u32, update_baseline: bool) -> Option<ProcessSample> {
        let proc_dir = self.proc_root.join(pid.to_string());
        let stat_content = fs::read_to_string(proc_dir.join("stat")).ok()?;
        let stat = StatLine::parse(&stat_content)?;

        let start_time = self.boot_time_ms + stat.start_ticks * 1000 / self.clock_ticks;
        let identity = ProcessIdentity::new(pid, start_time);
        let total_ticks = stat.utime + stat.stime;
        let now = Instant::now();

        // CPU percentage since the previous read of the same identity
        let cpu_percent = {
            let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
            let percent = match samples.get(&identity) {
                Some(prev) => {
                    let tick_delta = total_ticks.saturating_sub(prev.total_ticks);
                    let time_delta = now.duration_since(prev.timestamp).as_secs_f64();
                    if time_delta > 0.0 {
                        let cpu_seconds = tick_delta as f64 / self.clock_ticks as f64;
                        (cpu_seconds / time_delta) * 100.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            if update_baseline {
                samples.insert(identity, CpuSample { total_ticks, timestamp: now });
            }
            percent
        };

        Some(ProcessSample {
            pid,
            start_time,
            name: stat.name,
            cpu_percent,
            resident_memory_bytes: stat.rss_pages * self.page_size,
            status: ProcessStatus::from_state_char(stat.state),
            priority: stat.nice,
        })
    }

    /// Drop CPU baselines for identities that are gone.
    fn cleanup_stale(&self, active: &HashSet<ProcessIdentity>) {
        let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.retain(|identity, _| active.contains(identity));
    }
}

impl Default for LinuxProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInfoSource for LinuxProcessSource {
    fn snapshot(&self) -> Result<Vec<ProcessSample>, AcquisitionError> {
        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.proc_root)?.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Ok(pid) = name.parse::<u32>() {
                // Processes exiting mid-enumeration are simply skipped
                if let Some(sample) = self.parse_process(pid, true) {
                    processes.push(sample);
                }
            }
        }
        if processes.is_empty() {
            return Err(AcquisitionError::Unavailable(format!(
                "no readable processes under {}",
                self.proc_root.display()
            )));
        }

        let identities: HashSet<ProcessIdentity> = processes.iter().map(ProcessSample::identity).collect();
        self.cleanup_stale(&identities);
        Ok(processes)
    }

    fn get_process(&self, pid: u32) -> Option<ProcessSample> {
        self.parse_process(pid, false)
    }

    fn system(&self) -> Result<SystemSample, AcquisitionError> {
        let stat = fs::read_to_string(self.proc_root.join("stat"))?;
        let times = CpuTimes::parse(&stat)
            .ok_or_else(|| AcquisitionError::Unavailable("no cpu line in stat".into()))?;
        let meminfo = fs::read_to_string(self.proc_root.join("meminfo"))?;
        let (total, available) = parse_meminfo(&meminfo)
            .ok_or_else(|| AcquisitionError::Unavailable("no MemTotal in meminfo".into()))?;

        // The first read has no baseline and reports 0
        let cpu_percent = {
            let mut prev = self.system_cpu.lock().unwrap_or_else(|e| e.into_inner());
            let percent = prev.map(|p| times.busy_percent_since(&p)).unwrap_or(0.0);
            *prev = Some(times);
            percent
        };

        Ok(SystemSample {
            cpu_percent,
            memory_total_bytes: total,
            memory_used_bytes: total - available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_meminfo, CpuTimes, StatLine};

    #[test]
    fn parses_names_with_spaces_and_parens() {
        let line = "4242 (Web Content (x)) S 1 4242 4242 0 -1 4194560 100 0 0 0 \
                    250 50 0 0 20 5 12 0 987654 1000000 2048 18446744073709551615";
        let stat = StatLine::parse(line).unwrap();
        assert_eq!(stat.name, "Web Content (x)");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.utime, 250);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.nice, 5);
        assert_eq!(stat.start_ticks, 987654);
        assert_eq!(stat.rss_pages, 2048);
    }

    #[test]
    fn rejects_truncated_stat() {
        assert!(StatLine::parse("1 (init) S 0").is_none());
    }

    #[test]
    fn busy_share_between_cpu_reads() {
        let first = CpuTimes::parse("cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        assert_eq!(first, CpuTimes { total: 1000, idle: 800 });
        let second = CpuTimes::parse("cpu  250 0 150 750 150 0 0 0 0 0\n").unwrap();
        assert_eq!(second.busy_percent_since(&first), 200.0 * 100.0 / 300.0);
        assert_eq!(second.busy_percent_since(&second), 0.0);
        assert!(CpuTimes::parse("intr 1 2 3\n").is_none());
    }

    #[test]
    fn meminfo_prefers_available_over_free() {
        let content = "MemTotal:       16000 kB\nMemFree:         2000 kB\nMemAvailable:    6000 kB\n";
        assert_eq!(parse_meminfo(content), Some((16000 * 1024, 6000 * 1024)));
        let old_kernel = "MemTotal: 1000 kB\nMemFree: 250 kB\n";
        assert_eq!(parse_meminfo(old_kernel), Some((1000 * 1024, 250 * 1024)));
        assert_eq!(parse_meminfo("MemFree: 1 kB\n"), None);
    }
}
