//! Test doubles for the channel, runner and process seams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use tokio::sync::mpsc;

use crate::error::{ChannelError, RunnerError};
use crate::process::{KillTarget, ProcessControl};
use crate::runner::{PendingExec, RunSpec, Runner};
use crate::transport::{Ancillary, Channel, Command, Credentials, Reply};

#[derive(Debug)]
pub struct RecordedReply {
    pub reply: Reply,
    pub cred: Option<Credentials>,
    pub fds: usize,
}

/// In-memory channel fed from a queue of commands.
pub struct ScriptedChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<(Command, Ancillary)>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Command, Ancillary)>>,
    replies: Mutex<Vec<RecordedReply>>,
    sends_fail: AtomicBool,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            replies: Mutex::new(Vec::new()),
            sends_fail: AtomicBool::new(false),
        }
    }

    pub fn push(&self, cmd: Command) {
        self.push_with(cmd, Ancillary::default());
    }

    pub fn push_with(&self, cmd: Command, ancillary: Ancillary) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            tx.send((cmd, ancillary)).unwrap();
        }
    }

    /// Receives report `Closed` once the queue drains.
    pub fn finish(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Like `finish`, and every send fails from now on.
    pub fn close(&self) {
        self.finish();
        self.sends_fail.store(true, Ordering::SeqCst);
    }

    pub fn replies(&self) -> Vec<RecordedReply> {
        std::mem::take(&mut *self.replies.lock().unwrap())
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn recv_command(&self) -> Result<(Command, Ancillary), ChannelError> {
        self.rx.lock().await.recv().await.ok_or(ChannelError::Closed)
    }

    async fn send_reply(&self, reply: &Reply, ancillary: Ancillary) -> Result<(), ChannelError> {
        if self.sends_fail.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.replies.lock().unwrap().push(RecordedReply {
            reply: reply.clone(),
            cred: ancillary.cred,
            fds: ancillary.fds.len(),
        });
        Ok(())
    }
}

type Events = Arc<Mutex<Vec<&'static str>>>;

/// Runner that never forks.
pub struct FakeRunner {
    pid: Option<i32>,
    events: Events,
    layout: Mutex<Option<(bool, usize)>>,
}

impl FakeRunner {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Some(pid),
            events: Events::default(),
            layout: Mutex::new(None),
        }
    }

    /// Every start fails.
    pub fn failing() -> Self {
        Self {
            pid: None,
            ..Self::new(0)
        }
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    /// (has program image, inherited file count) of the last start.
    pub fn last_layout(&self) -> Option<(bool, usize)> {
        *self.layout.lock().unwrap()
    }
}

impl Runner for FakeRunner {
    fn start(&self, spec: &RunSpec) -> Result<Box<dyn PendingExec>, RunnerError> {
        let pid = self.pid.ok_or(RunnerError::ChildVanished)?;
        *self.layout.lock().unwrap() = Some((spec.exec_file.is_some(), spec.files.len()));
        self.events.lock().unwrap().push("start");
        Ok(Box::new(FakePending {
            pid: Pid::from_raw(pid),
            events: Arc::clone(&self.events),
        }))
    }
}

struct FakePending {
    pid: Pid,
    events: Events,
}

impl PendingExec for FakePending {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn release(self: Box<Self>) -> Result<Pid, RunnerError> {
        self.events.lock().unwrap().push("release");
        Ok(self.pid)
    }

    fn abort(self: Box<Self>) {
        self.events.lock().unwrap().push("abort");
    }
}

/// Process control that records calls and answers `wait` after a delay.
pub struct RecordingProcesses {
    exit_code: Option<i32>,
    delay: Duration,
    events: Events,
}

impl RecordingProcesses {
    pub fn exiting(code: i32, delay: Duration) -> Self {
        Self {
            exit_code: Some(code),
            delay,
            events: Events::default(),
        }
    }

    pub fn killed(delay: Duration) -> Self {
        Self {
            exit_code: None,
            delay,
            events: Events::default(),
        }
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl ProcessControl for RecordingProcesses {
    fn wait(&self, pid: Pid) -> nix::Result<WaitStatus> {
        std::thread::sleep(self.delay);
        self.events.lock().unwrap().push("wait");
        Ok(match self.exit_code {
            Some(code) => WaitStatus::Exited(pid, code),
            None => WaitStatus::Signaled(pid, Signal::SIGKILL, false),
        })
    }

    fn kill_all(&self, _target: KillTarget) {
        self.events.lock().unwrap().push("kill");
    }

    fn reap(&self, _target: KillTarget) -> usize {
        self.events.lock().unwrap().push("reap");
        0
    }
}
