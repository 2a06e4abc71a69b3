use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use deckutils::{OutputStream, ProcessLog};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, Lines},
    process::{ChildStderr, ChildStdout},
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Substrings that mark a guest output line as worth logging after the line budget is spent.
const FLAGGED_MARKERS: [&str; 5] = ["err", "warn", "fixme", "segfault", "sigsegv"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a child's output is drained.
#[derive(Debug)]
pub struct DrainOptions {
    /// Label attached to every traced line, usually the container or process id.
    pub label: String,

    /// Lines traced in full before only flagged lines are traced.
    pub full_log_lines: usize,

    /// Lines kept in memory for error reports.
    pub tail_lines: usize,

    /// File every line is appended to.
    pub log: Option<ProcessLog>,
}

/// A background task reading a child's stdout and stderr until both close.
///
/// The task is started before the caller waits on the child so the child never blocks on a
/// full pipe.
#[derive(Debug)]
pub struct OutputDrain {
    handle: JoinHandle<()>,
    tail: Arc<Mutex<VecDeque<String>>>,
    lines: Arc<Mutex<usize>>,
}

/// What a drain captured by the time it was finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// The most recent lines, oldest first.
    pub tail: Vec<String>,

    /// Total lines read from both streams.
    pub lines: usize,
}

/// Shared state the drain task writes into.
struct DrainState {
    options: DrainOptions,
    tail: Arc<Mutex<VecDeque<String>>>,
    lines: Arc<Mutex<usize>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OutputDrain {
    /// The lines captured so far, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.tail
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Waits up to `grace` for both streams to close, then cancels the task.
    ///
    /// Call this after the child has exited or been killed. A grandchild holding the pipes
    /// open cannot keep the caller waiting past the grace period.
    pub async fn finish(mut self, grace: Duration) -> DrainSummary {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            tracing::debug!("output drain did not finish within {grace:?}, cancelling");
            self.handle.abort();
        }

        DrainSummary {
            tail: self.tail(),
            lines: self.lines.lock().map(|l| *l).unwrap_or_default(),
        }
    }
}

impl DrainSummary {
    /// The captured tail joined into one block of text.
    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.tail.iter().any(|line| line.contains(needle))
    }
}

impl DrainState {
    async fn record(&mut self, stream: OutputStream, line: String) {
        let index = {
            let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
            *lines += 1;
            *lines
        };

        if index <= self.options.full_log_lines {
            tracing::debug!(label = %self.options.label, %stream, "{line}");
        } else if is_flagged(&line) {
            tracing::warn!(label = %self.options.label, %stream, "{line}");
        }

        if let Some(log) = self.options.log.as_mut() {
            if let Err(e) = log.write_line(stream, &line).await {
                tracing::warn!(
                    label = %self.options.label,
                    error = %e,
                    "failed to write process log, disabling it"
                );
                self.options.log = None;
            }
        }

        if self.options.tail_lines > 0 {
            let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == self.options.tail_lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Starts draining a child's output streams.
///
/// Either stream may be absent, in which case only the other is read. Both streams are read
/// concurrently and their lines interleave in arrival order.
pub fn spawn_drain(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    options: DrainOptions,
) -> OutputDrain {
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(options.tail_lines)));
    let lines = Arc::new(Mutex::new(0));

    let mut state = DrainState {
        options,
        tail: Arc::clone(&tail),
        lines: Arc::clone(&lines),
    };

    let handle = tokio::spawn(async move {
        let mut stdout = stdout.map(|s| BufReader::new(s).lines());
        let mut stderr = stderr.map(|s| BufReader::new(s).lines());

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => state.record(OutputStream::Stdout, line).await,
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => state.record(OutputStream::Stderr, line).await,
                    None => stderr = None,
                },
            }
        }
    });

    OutputDrain {
        handle,
        tail,
        lines,
    }
}

/// Reads the next line, treating read errors as end of stream.
async fn next_line<R>(reader: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

fn is_flagged(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    FLAGGED_MARKERS.iter().any(|marker| lower.contains(marker))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    fn options(tail_lines: usize, log: Option<ProcessLog>) -> DrainOptions {
        DrainOptions {
            label: "test".to_string(),
            full_log_lines: 2,
            tail_lines,
            log,
        }
    }

    #[test]
    fn test_flagged_lines() {
        assert!(is_flagged("0024:err:module:import_dll Library MSVCR120.dll not found"));
        assert!(is_flagged("Warning: something odd"));
        assert!(is_flagged("box64: SIGSEGV with Access error"));
        assert!(!is_flagged("wine: configuration updated"));
    }

    #[tokio::test]
    async fn test_drain_keeps_tail_of_both_streams() -> anyhow::Result<()> {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("for i in 1 2 3 4 5; do echo out$i; done; echo err1 >&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let drain = spawn_drain(child.stdout.take(), child.stderr.take(), options(3, None));
        child.wait().await?;
        let summary = drain.finish(Duration::from_secs(5)).await;

        assert_eq!(summary.lines, 6);
        assert_eq!(summary.tail.len(), 3);
        assert!(summary.contains("err1"));
        assert!(!summary.contains("out1"));

        Ok(())
    }

    #[tokio::test]
    async fn test_drain_writes_process_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = ProcessLog::create(dir.path(), "game").await?;

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("echo hello; echo oops >&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let drain = spawn_drain(child.stdout.take(), child.stderr.take(), options(0, Some(log)));
        child.wait().await?;
        let summary = drain.finish(Duration::from_secs(5)).await;
        assert!(summary.tail.is_empty());

        let contents = tokio::fs::read_to_string(dir.path().join("game.log")).await?;
        assert!(contents.contains("[stdout] hello\n"));
        assert!(contents.contains("[stderr] oops\n"));

        Ok(())
    }

    #[tokio::test]
    async fn test_finish_cancels_after_grace() -> anyhow::Result<()> {
        // The background sleep inherits the pipe, so the stream stays open after sh exits.
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("echo started; sleep 5 &")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let drain = spawn_drain(child.stdout.take(), None, options(10, None));
        child.wait().await?;

        let started = std::time::Instant::now();
        let summary = drain.finish(Duration::from_millis(200)).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(summary.tail, vec!["started".to_string()]);

        Ok(())
    }
}
