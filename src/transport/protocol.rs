//! Controller protocol message types.
//!
//! One JSON document per datagram on the control socket. Descriptors and
//! credentials ride alongside as ancillary data, see [`super::Ancillary`].

use serde::{Deserialize, Serialize};

/// Command sent from the controller to the container init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Liveness probe.
    Ping,
    /// Copy the single attached descriptor's contents into `path`.
    CopyIn { path: String },
    /// Open `path` read-only and send the descriptor back.
    Open { path: String },
    /// Remove the file at `path`.
    Delete { path: String },
    /// Empty the scratch directories.
    Reset,
    /// Run one untrusted program. Attached descriptors become its files.
    Execve(ExecRequest),
    /// Follow-up inside an active execve exchange only.
    Kill,
}

impl Command {
    /// Short name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::CopyIn { .. } => "copy_in",
            Self::Open { .. } => "open",
            Self::Delete { .. } => "delete",
            Self::Reset => "reset",
            Self::Execve(_) => "execve",
            Self::Kill => "kill",
        }
    }
}

/// Payload of [`Command::Execve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub envv: Vec<String>,
    #[serde(default)]
    pub rlimits: Vec<ResourceLimit>,
    /// The first attached descriptor is the program image.
    #[serde(default)]
    pub fd_exec: bool,
}

/// A single rlimit applied to the child before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub resource: LimitKind,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Cpu,
    Fsize,
    Data,
    Stack,
    Core,
    Nofile,
    Nproc,
    AddressSpace,
    Memlock,
}

/// Reply sent from the container init to the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Non-empty marks a logical failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Meaningful when the program exited normally.
    #[serde(default)]
    pub exit_status: i32,
    /// Present only when the program was killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl Reply {
    /// Empty success reply.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn exited(exit_status: i32) -> Self {
        Self {
            exit_status,
            ..Self::default()
        }
    }

    pub fn signaled(outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Coarse classification of how the program terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Normal,
    TimeLimitExceeded,
    OutputLimitExceeded,
    Banned,
    RuntimeError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags() {
        let json = serde_json::to_string(&Command::CopyIn {
            path: "/w/a.out".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"cmd\":\"copy_in\""));
        assert!(json.contains("\"path\":\"/w/a.out\""));

        let json = serde_json::to_string(&Command::Kill).unwrap();
        assert_eq!(json, r#"{"cmd":"kill"}"#);
    }

    #[test]
    fn execve_fields_default() {
        let cmd: Command = serde_json::from_str(r#"{"cmd":"execve","argv":["/bin/true"]}"#).unwrap();
        let Command::Execve(req) = cmd else {
            panic!("expected execve");
        };
        assert_eq!(req.argv, vec!["/bin/true"]);
        assert!(req.envv.is_empty());
        assert!(req.rlimits.is_empty());
        assert!(!req.fd_exec);
    }

    #[test]
    fn execve_rlimits() {
        let json = r#"{
            "cmd": "execve",
            "argv": ["a.out"],
            "fd_exec": true,
            "rlimits": [{"resource": "cpu", "soft": 1, "hard": 2}]
        }"#;
        let Command::Execve(req) = serde_json::from_str(json).unwrap() else {
            panic!("expected execve");
        };
        assert!(req.fd_exec);
        assert_eq!(
            req.rlimits,
            vec![ResourceLimit {
                resource: LimitKind::Cpu,
                soft: 1,
                hard: 2,
            }]
        );
    }

    #[test]
    fn reply_omits_empty_error() {
        let json = serde_json::to_string(&Reply::exited(42)).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"exit_status\":42"));
        assert!(!json.contains("outcome"));
    }

    #[test]
    fn reply_error_flag() {
        assert!(Reply::error("open: no such file").is_error());
        assert!(!Reply::ok().is_error());
        assert!(!Reply::error("").is_error());

        let reply: Reply = serde_json::from_str(r#"{"outcome":"banned"}"#).unwrap();
        assert_eq!(reply.outcome, Some(Outcome::Banned));
        assert!(!reply.is_error());
    }

    #[test]
    fn error_reply_carries_no_outcome() {
        let json = serde_json::to_string(&Reply::error("execve: aborted")).unwrap();
        assert!(!json.contains("outcome"));

        let json = serde_json::to_string(&Reply::signaled(Outcome::TimeLimitExceeded)).unwrap();
        assert!(json.contains("\"outcome\":\"time_limit_exceeded\""));
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"cmd":"reboot"}"#).is_err());
    }
}
