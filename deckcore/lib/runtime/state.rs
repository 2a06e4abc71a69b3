use std::path::PathBuf;

use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One launched guest executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct GuestProcess {
    /// Unique per launch: `<spawn time in ms>-<native pid>`.
    #[getset(get = "pub with_prefix")]
    pub(super) id: String,

    /// The container the process runs in.
    #[getset(get = "pub with_prefix")]
    pub(super) container_id: String,

    /// The guest executable on the host filesystem.
    #[getset(get = "pub with_prefix")]
    pub(super) executable_path: PathBuf,

    /// When the process was spawned.
    #[getset(get_copy = "pub with_prefix")]
    pub(super) started_at: DateTime<Utc>,

    /// The pid of the sandbox process.
    #[getset(get_copy = "pub with_prefix")]
    pub(super) native_pid: u32,
}

/// Where a guest process is in its life.
///
/// `Running` is the only state with outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    /// The process is alive.
    Running,

    /// The process exited on its own with this code.
    Exited {
        /// The exit code.
        code: i32,
    },

    /// The process was terminated by a signal.
    Killed {
        /// The signal that ended it.
        signal: i32,

        /// Whether a hard kill was sent, either on request or after a graceful kill timed out.
        forced: bool,
    },
}

/// A point-in-time view of a guest process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct ProcessStatus {
    /// The process id.
    #[getset(get = "pub with_prefix")]
    pub(super) id: String,

    /// Liveness and exit information.
    #[getset(get_copy = "pub with_prefix")]
    pub(super) state: ProcessState,

    /// CPU usage in percent of one core.
    ///
    /// A single status read has nothing to diff against and reports `0.0`; use the monitor
    /// stream for real percentages.
    #[getset(get_copy = "pub with_prefix")]
    pub(super) cpu_percent: f32,

    /// Resident memory in kilobytes, `0` once the process has exited.
    #[getset(get_copy = "pub with_prefix")]
    pub(super) memory_kb: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessState {
    /// Whether the process is still alive.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    /// The exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited { code } => Some(*code),
            _ => None,
        }
    }
}

impl ProcessStatus {
    /// Whether the process is still alive.
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// The exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        self.state.exit_code()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited { code } => write!(f, "exited ({code})"),
            ProcessState::Killed { signal, forced } => {
                write!(f, "killed by signal {signal}")?;
                if *forced {
                    write!(f, " (forced)")?;
                }
                Ok(())
            }
        }
    }
}
