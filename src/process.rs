//! Waiting on, killing and reaping supervised processes.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Deserialize;
use tracing::{debug, trace};

/// Which processes a forced cleanup reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillScope {
    /// Every process in the pid namespace. Only valid when running as
    /// namespace pid 1.
    #[default]
    Namespace,
    /// The supervised program's process group.
    ProcessGroup,
}

impl KillScope {
    /// Resolve against the child of one exchange, if any.
    pub const fn target(self, pid: Option<Pid>) -> Option<KillTarget> {
        match (self, pid) {
            (Self::Namespace, _) => Some(KillTarget::Namespace),
            (Self::ProcessGroup, Some(pid)) => Some(KillTarget::Group(pid)),
            (Self::ProcessGroup, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTarget {
    Namespace,
    Group(Pid),
}

/// Process-table operations used by the execution supervisor.
pub trait ProcessControl: Send + Sync {
    /// Block until `pid` terminates.
    fn wait(&self, pid: Pid) -> nix::Result<WaitStatus>;

    /// SIGKILL everything in `target`.
    fn kill_all(&self, target: KillTarget);

    /// Collect already terminated children in `target` without blocking.
    /// Returns how many were reaped.
    fn reap(&self, target: KillTarget) -> usize;
}

/// [`ProcessControl`] backed by the real syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn wait(&self, pid: Pid) -> nix::Result<WaitStatus> {
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    fn kill_all(&self, target: KillTarget) {
        let result = match target {
            KillTarget::Namespace => kill(Pid::from_raw(-1), Signal::SIGKILL),
            KillTarget::Group(pgid) => killpg(pgid, Signal::SIGKILL),
        };
        if let Err(e) = result {
            trace!(?target, error = %e, "kill found nothing to signal");
        }
    }

    fn reap(&self, target: KillTarget) -> usize {
        let selector = match target {
            KillTarget::Namespace => Pid::from_raw(-1),
            KillTarget::Group(pgid) => Pid::from_raw(-pgid.as_raw()),
        };
        let mut reaped = 0;
        loop {
            match waitpid(selector, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
                Ok(_) => reaped += 1,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!(error = %e, "reap stopped");
                    break;
                }
            }
        }
        reaped
    }
}
