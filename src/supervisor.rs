//! Execution supervisor: one execve exchange from fork to completion.
//!
//! Reply order seen by the controller:
//!
//! 1. rendezvous: empty reply carrying (pid, uid, gid) credentials, sent
//!    while the child is parked before exec. The controller answers with
//!    one command; `Kill` aborts the exec, anything else releases it.
//! 2. terminal: exit status, signal outcome, or a logical error.
//! 3. completion: empty reply once the kill listener has finished.
//!
//! Between start and the terminal reply two tasks race: the primary wait
//! on the child and the kill listener reading the controller's next
//! command. The listener must not reap until the primary wait is done (the
//! `wait_done` oneshot), and completion is not sent until the listener has
//! finished (its join handle).

use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::error::{join, ChannelError, RunnerError};
use crate::process::{KillScope, KillTarget, ProcessControl};
use crate::runner::{RunSpec, Runner};
use crate::transport::{
    Ancillary, Channel, Command, Credentials, ExecRequest, Outcome, Reply,
};

pub struct Supervisor {
    channel: Arc<dyn Channel>,
    runner: Arc<dyn Runner>,
    processes: Arc<dyn ProcessControl>,
    scope: KillScope,
    work_dir: PathBuf,
}

impl Supervisor {
    pub fn new(
        channel: Arc<dyn Channel>,
        runner: Arc<dyn Runner>,
        processes: Arc<dyn ProcessControl>,
        scope: KillScope,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            channel,
            runner,
            processes,
            scope,
            work_dir,
        }
    }

    /// Run one execve exchange. Only channel failures are returned; every
    /// other failure becomes the terminal reply.
    #[instrument(skip_all, fields(argv0 = req.argv.first().map(String::as_str).unwrap_or_default()))]
    pub async fn execve(&self, req: ExecRequest, ancillary: Ancillary) -> Result<(), ChannelError> {
        let started = match self.prepare(req, ancillary) {
            Ok(spec) => self.start(spec).await,
            Err(e) => Err(e),
        };
        let pid = started.as_ref().ok().copied();

        let (wait_done, wait_done_rx) = oneshot::channel();
        let listener = tokio::spawn(kill_listener(
            Arc::clone(&self.channel),
            Arc::clone(&self.processes),
            self.scope.target(pid),
            wait_done_rx,
        ));

        let status = match started {
            Ok(pid) => {
                let processes = Arc::clone(&self.processes);
                match join(tokio::task::spawn_blocking(move || processes.wait(pid))).await {
                    Ok(Ok(status)) => Ok(status),
                    Ok(Err(e)) => Err(RunnerError::Wait(e)),
                    Err(e) => Err(RunnerError::Join(e)),
                }
            }
            Err(e) => Err(e),
        };
        let _ = wait_done.send(());

        let reply = match status {
            Ok(status) => {
                debug!(?status, "child terminated");
                classify(status)
            }
            Err(e) => {
                warn!(error = %e, "execve failed");
                Reply::error(format!("execve: {e}"))
            }
        };
        let sent = self.channel.send_reply(&reply, Ancillary::default()).await;

        join(listener).await?;
        sent?;
        self.channel
            .send_reply(&Reply::ok(), Ancillary::default())
            .await
    }

    /// Split received descriptors into program image and inherited files.
    fn prepare(&self, req: ExecRequest, ancillary: Ancillary) -> Result<RunSpec, RunnerError> {
        let mut files = ancillary.fds;
        let exec_file = if req.fd_exec {
            if files.is_empty() {
                return Err(RunnerError::MissingExecFd);
            }
            Some(files.remove(0))
        } else {
            None
        };

        Ok(RunSpec {
            argv: req.argv,
            envv: req.envv,
            exec_file,
            files,
            rlimits: req.rlimits,
            work_dir: self.work_dir.clone(),
            no_new_privs: true,
            drop_caps: true,
        })
    }

    /// Create the child, rendezvous with the controller, then let it exec.
    async fn start(&self, spec: RunSpec) -> Result<Pid, RunnerError> {
        let runner = Arc::clone(&self.runner);
        let pending = join(tokio::task::spawn_blocking(move || {
            let pending = runner.start(&spec);
            // Our copies of the received descriptors go away here whether or
            // not the child was created.
            drop(spec);
            pending
        }))
        .await??;

        let pid = pending.pid();
        if let Err(reason) = self.rendezvous(pid).await {
            join(tokio::task::spawn_blocking(move || pending.abort())).await?;
            info!(pid = pid.as_raw(), %reason, "exec aborted");
            return Err(RunnerError::Aborted(reason));
        }

        let pid = join(tokio::task::spawn_blocking(move || pending.release())).await??;
        info!(pid = pid.as_raw(), "program started");
        Ok(pid)
    }

    async fn rendezvous(&self, pid: Pid) -> Result<(), String> {
        let cred = Credentials::current(pid.as_raw());
        self.channel
            .send_reply(&Reply::ok(), Ancillary::with_cred(cred))
            .await
            .map_err(|e| format!("rendezvous send: {e}"))?;

        match self.channel.recv_command().await {
            Ok((Command::Kill, _)) => Err("received kill".to_string()),
            Ok((cmd, _)) => {
                debug!(pid = pid.as_raw(), cmd = cmd.name(), "rendezvous released");
                Ok(())
            }
            Err(e) => Err(format!("rendezvous recv: {e}")),
        }
    }
}

/// Waits for the controller's follow-up, kills, then reaps once the
/// primary wait has finished.
async fn kill_listener(
    channel: Arc<dyn Channel>,
    processes: Arc<dyn ProcessControl>,
    target: Option<KillTarget>,
    wait_done: oneshot::Receiver<()>,
) {
    match channel.recv_command().await {
        Ok((cmd, _)) => debug!(cmd = cmd.name(), "kill listener woke"),
        Err(e) => warn!(error = %e, "kill listener receive failed"),
    }

    if let Some(target) = target {
        processes.kill_all(target);
    }

    // Reaping before the primary wait returns could steal its status.
    let _ = wait_done.await;

    if let Some(target) = target {
        let reaped = processes.reap(target);
        debug!(reaped, "collected zombies");
    }
}

/// Map a wait status to the terminal reply.
pub fn classify(status: WaitStatus) -> Reply {
    match status {
        WaitStatus::Exited(_, code) => Reply::exited(code),
        WaitStatus::Signaled(_, signal, _) => Reply::signaled(outcome_for(signal)),
        other => Reply::error(format!("execve: unknown status {other:?}")),
    }
}

/// Coarse outcome for a terminating signal.
pub const fn outcome_for(signal: Signal) -> Outcome {
    match signal {
        // SIGKILL comes from the controller's kill on timeout.
        Signal::SIGXCPU | Signal::SIGKILL => Outcome::TimeLimitExceeded,
        Signal::SIGXFSZ => Outcome::OutputLimitExceeded,
        Signal::SIGSYS => Outcome::Banned,
        _ => Outcome::RuntimeError,
    }
}
