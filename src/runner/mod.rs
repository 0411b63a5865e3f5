//! Process creation for the supervised program.
//!
//! Creation is two-phase so the controller can register the pid before any
//! untrusted code runs: [`Runner::start`] forks and prepares a child that
//! blocks just short of exec, then [`PendingExec::release`] lets it exec or
//! [`PendingExec::abort`] kills it.

mod forkexec;

pub use forkexec::ForkExecRunner;

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::error::RunnerError;
use crate::transport::ResourceLimit;

/// Everything needed to create the child.
///
/// Owns the descriptors; dropping the spec after `start` closes this
/// process's copies.
#[derive(Debug, Default)]
pub struct RunSpec {
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    /// Program image for fd-exec mode. `None` resolves `argv[0]` as a path.
    ///
    /// The image descriptor stays close-on-exec so the program never sees
    /// it. The kernel then cannot hand it to a `#!` interpreter, so only
    /// binaries run this way; scripts fail with `ENOENT`.
    pub exec_file: Option<OwnedFd>,
    /// Become descriptors 0..N of the child, in order.
    pub files: Vec<OwnedFd>,
    pub rlimits: Vec<ResourceLimit>,
    pub work_dir: PathBuf,
    pub no_new_privs: bool,
    pub drop_caps: bool,
}

/// Creates child processes.
pub trait Runner: Send + Sync {
    /// Fork and prepare a child, stopping before exec.
    fn start(&self, spec: &RunSpec) -> Result<Box<dyn PendingExec>, RunnerError>;
}

/// A prepared child waiting for the go-ahead.
pub trait PendingExec: Send {
    fn pid(&self) -> Pid;

    /// Let the child exec. Returns once the exec has succeeded or failed;
    /// on failure the child has already been reaped.
    fn release(self: Box<Self>) -> Result<Pid, RunnerError>;

    /// Kill and reap the child without letting it exec.
    fn abort(self: Box<Self>);
}
