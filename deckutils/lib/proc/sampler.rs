use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::Stream;
use nix::unistd::{sysconf, SysconfVar};
use tokio::{fs, time::Instant};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Where the kernel exposes per-process records.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Consecutive unreadable samples after which a monitoring stream ends.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Clock ticks per second assumed when the platform does not report one.
const FALLBACK_CLOCK_TICKS: u64 = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A point-in-time reading of a process's resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessMetrics {
    /// User + system CPU ticks, including reaped children.
    pub cpu_ticks: u64,

    /// Resident set size in kilobytes.
    pub rss_kb: u64,

    /// CPU usage since the previous sample, as a percentage of one core.
    ///
    /// Always `0.0` for a standalone [`ProcessSampler::sample`], which has nothing to diff
    /// against.
    pub cpu_percent: f32,
}

/// Reads resource usage for processes from procfs.
#[derive(Debug, Clone)]
pub struct ProcessSampler {
    proc_root: PathBuf,
    clock_ticks: u64,
    max_consecutive_failures: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessSampler {
    /// Creates a sampler reading from `/proc`.
    pub fn new() -> Self {
        Self::with_proc_root(DEFAULT_PROC_ROOT)
    }

    /// Creates a sampler reading from an alternate procfs mount.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
        let clock_ticks = match sysconf(SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as u64,
            _ => FALLBACK_CLOCK_TICKS,
        };

        Self {
            proc_root: proc_root.into(),
            clock_ticks,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }

    /// Sets how many unreadable samples in a row end a monitoring stream.
    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max.max(1);
        self
    }

    /// The procfs root this sampler reads from.
    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Takes one sample, or `None` if the process records cannot be read.
    pub async fn sample(&self, pid: u32) -> Option<ProcessMetrics> {
        let dir = self.proc_root.join(pid.to_string());
        let stat = fs::read_to_string(dir.join("stat")).await.ok()?;
        let status = fs::read_to_string(dir.join("status")).await.ok()?;

        Some(ProcessMetrics {
            cpu_ticks: parse_cpu_ticks(&stat)?,
            rss_kb: parse_rss_kb(&status)?,
            cpu_percent: 0.0,
        })
    }

    /// Samples `pid` every `interval` until the process disappears.
    ///
    /// The stream ends once [`DEFAULT_MAX_CONSECUTIVE_FAILURES`] (or the configured limit)
    /// samples in a row could not be read. It is lazy and not restartable.
    pub fn start_monitoring(
        &self,
        pid: u32,
        interval: Duration,
    ) -> impl Stream<Item = ProcessMetrics> + Send + 'static {
        let sampler = self.clone();

        async_stream::stream! {
            let mut previous: Option<(u64, Instant)> = None;
            let mut failures = 0;

            loop {
                match sampler.sample(pid).await {
                    Some(mut metrics) => {
                        failures = 0;
                        let now = Instant::now();
                        if let Some((ticks, at)) = previous {
                            metrics.cpu_percent =
                                sampler.cpu_percent(metrics.cpu_ticks.saturating_sub(ticks), now - at);
                        }
                        previous = Some((metrics.cpu_ticks, now));
                        yield metrics;
                    }
                    None => {
                        failures += 1;
                        if failures >= sampler.max_consecutive_failures {
                            tracing::debug!(pid, failures, "process records unreadable, ending monitor");
                            break;
                        }
                    }
                }

                tokio::time::sleep(interval).await;
            }
        }
    }

    /// CPU usage as a percentage of one core, from the ticks consumed over `wall` time.
    pub fn cpu_percent(&self, tick_delta: u64, wall: Duration) -> f32 {
        let wall_ms = wall.as_millis() as f64;
        if wall_ms <= 0.0 {
            return 0.0;
        }

        let cpu_ms = tick_delta as f64 * 1000.0 / self.clock_ticks as f64;
        (cpu_ms / wall_ms * 100.0) as f32
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sums utime, stime, cutime and cstime from a `/proc/<pid>/stat` record.
///
/// The command name is parenthesised and may itself contain spaces or parentheses, so fields
/// are counted from the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is the state (field 3); utime is field 14.
    fields
        .get(11..15)?
        .iter()
        .map(|f| f.parse::<i64>().ok().map(|v| v.max(0) as u64))
        .sum()
}

/// Reads the `VmRSS:` line of a `/proc/<pid>/status` record.
fn parse_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tempfile::tempdir;

    use super::*;

    const STAT: &str = "4242 (wine64 (preloader)) S 1 4242 4242 0 -1 4194560 1500 0 0 0 120 30 5 7 20 0 4 0 100 1024 256 18446744073709551615";
    const STATUS: &str = "Name:\twine64\nState:\tS (sleeping)\nVmPeak:\t  900000 kB\nVmRSS:\t  524288 kB\nThreads:\t4\n";

    #[test]
    fn test_parse_cpu_ticks_handles_parenthesised_names() {
        assert_eq!(parse_cpu_ticks(STAT), Some(120 + 30 + 5 + 7));
        assert_eq!(parse_cpu_ticks("12 (short) S 1 2"), None);
        assert_eq!(parse_cpu_ticks("no parens here"), None);
    }

    #[test]
    fn test_parse_rss_kb() {
        assert_eq!(parse_rss_kb(STATUS), Some(524288));
        assert_eq!(parse_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[tokio::test]
    async fn test_sample_reads_fake_procfs() -> anyhow::Result<()> {
        let root = tempdir()?;
        helper::write_process(root.path(), 4242, 162, 524288)?;

        let sampler = ProcessSampler::with_proc_root(root.path());
        let metrics = sampler.sample(4242).await.unwrap();

        assert_eq!(metrics.rss_kb, 524288);
        assert_eq!(metrics.cpu_ticks, 162);
        assert_eq!(metrics.cpu_percent, 0.0);
        assert!(sampler.sample(1).await.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn test_monitoring_ends_after_consecutive_failures() -> anyhow::Result<()> {
        let root = tempdir()?;
        helper::write_process(root.path(), 7, 10, 2048)?;

        let sampler = ProcessSampler::with_proc_root(root.path()).max_consecutive_failures(2);
        let stream = sampler.start_monitoring(7, Duration::from_millis(10));
        futures::pin_mut!(stream);

        let first = stream.next().await.unwrap();
        assert_eq!(first.rss_kb, 2048);

        std::fs::remove_dir_all(root.path().join("7"))?;

        let rest = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>()).await?;
        assert!(rest.is_empty());

        Ok(())
    }

    #[test]
    fn test_cpu_percent() {
        let sampler = ProcessSampler::with_proc_root("/nonexistent");
        let ticks_per_sec = sampler.clock_ticks;

        let percent = sampler.cpu_percent(ticks_per_sec / 2, Duration::from_secs(1));
        assert!((percent - 50.0).abs() < 1.0);
        assert_eq!(sampler.cpu_percent(10, Duration::ZERO), 0.0);
    }

    mod helper {
        use std::path::Path;

        pub fn write_process(root: &Path, pid: u32, ticks: u64, rss_kb: u64) -> anyhow::Result<()> {
            let dir = root.join(pid.to_string());
            std::fs::create_dir_all(&dir)?;
            std::fs::write(
                dir.join("stat"),
                format!("{pid} (game.exe) R 1 1 1 0 -1 0 0 0 0 0 {ticks} 0 0 0 20 0 1 0 1 1 1"),
            )?;
            std::fs::write(dir.join("status"), format!("Name:\tgame.exe\nVmRSS:\t{rss_kb} kB\n"))?;
            Ok(())
        }
    }
}
