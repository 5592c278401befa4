//! Execution records and the values that describe them.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use corral_core::StreamEvent;
use serde::{Deserialize, Serialize};

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    /// No further transition can happen from this state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OS-level details of a live subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
}

/// Snapshot of one execution as tracked by the registry.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Registry key: caller-supplied or a generated UUID.
    pub session_id: String,
    /// Session id announced by the subprocess in its `system` init event.
    pub reported_session_id: Option<String>,
    /// Present only while the record is `Running`.
    pub process: Option<ProcessInfo>,
    pub status: ExecutionStatus,
    pub working_directory: PathBuf,
    pub query: String,
    /// Events in parse order. Only appended while `Running`.
    pub events: Vec<StreamEvent>,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub(crate) fn pending(session_id: String, working_directory: PathBuf, query: String) -> Self {
        Self {
            session_id,
            reported_session_id: None,
            process: None,
            status: ExecutionStatus::Pending,
            working_directory,
            query,
            events: Vec::new(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Text of the last `result` event, if the subprocess produced one.
    pub fn final_result(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|event| match event {
            StreamEvent::Result(result) => result.result.as_deref(),
            _ => None,
        })
    }

    /// Wall-clock time between start and completion.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        completed.duration_since(started).ok()
    }
}

/// Program to launch for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Input to [`super::ExecutionRegistry::start_execution`].
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    /// Explicit id, e.g. to attach to a resumed session. Generated when `None`.
    pub session_id: Option<String>,
    pub working_directory: PathBuf,
    /// Opaque input payload recorded alongside the execution.
    pub query: String,
    /// Subprocess to spawn. `None` attaches without spawning.
    pub command: Option<CommandSpec>,
    /// Overrides the registry-wide timeout for this execution.
    pub timeout: Option<Duration>,
}

impl ExecutionParams {
    pub fn new(working_directory: impl Into<PathBuf>, command: CommandSpec) -> Self {
        Self {
            session_id: None,
            working_directory: working_directory.into(),
            query: String::new(),
            command: Some(command),
            timeout: None,
        }
    }

    /// Track an existing session without launching a subprocess.
    pub fn attach(session_id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            working_directory: working_directory.into(),
            query: String::new(),
            command: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Notification published whenever the registry map changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Created {
        session_id: String,
    },
    Transitioned {
        session_id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    Removed {
        session_id: String,
    },
}

impl RegistryChange {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Created { session_id }
            | Self::Transitioned { session_id, .. }
            | Self::Removed { session_id } => session_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use corral_core::ndjson::parse_line;

    #[test]
    fn terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Killed.is_terminal());
    }

    #[test]
    fn shell_command_wraps_script() {
        let cmd = CommandSpec::shell("echo hi").env("A", "1");
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c", "echo hi"]);
        assert_eq!(cmd.env, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn final_result_uses_last_result_event() {
        let mut record = ExecutionRecord::pending("s".into(), PathBuf::from("/tmp"), String::new());
        assert!(record.final_result().is_none());
        for line in [
            r#"{"type":"result","subtype":"success","result":"first"}"#,
            r#"{"type":"assistant","message":{"content":"hi"}}"#,
            r#"{"type":"result","subtype":"success","result":"second"}"#,
        ] {
            record.events.push(parse_line(line).unwrap());
        }
        assert_eq!(record.final_result(), Some("second"));
    }
}
