//! Controller side of the control channel.
//!
//! Blocking and thread-safe: one thread drives an [`ContainerClient::execve`]
//! exchange while another may call [`ContainerClient::kill`] to stop it.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use crate::error::{ChannelError, ClientError};
use crate::transport::{
    encode, recv_decoded, Ancillary, BufferPool, Command, ExecRequest, Outcome, Reply, Socket,
    MAX_MESSAGE_SIZE,
};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const KILLED: u8 = 2;

/// How a supervised program ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// Pid reported at rendezvous, as seen from this side of the socket.
    pub pid: i32,
    pub exit_status: i32,
    /// `Normal` unless a signal ended the program.
    pub outcome: Outcome,
}

pub struct ContainerClient {
    socket: Socket,
    pool: BufferPool,
    state: AtomicU8,
}

impl ContainerClient {
    /// Wrap the controller end of the control socket.
    pub fn new(socket: Socket) -> Result<Self, ChannelError> {
        socket.set_pass_cred(true)?;
        Ok(Self {
            socket,
            pool: BufferPool::new(MAX_MESSAGE_SIZE),
            state: AtomicU8::new(IDLE),
        })
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.request(&Command::Ping, Ancillary::default()).map(drop)
    }

    /// Stream `source` into `path` inside the container.
    pub fn copy_in(&self, path: &str, source: OwnedFd) -> Result<(), ClientError> {
        let cmd = Command::CopyIn {
            path: path.to_string(),
        };
        self.request(&cmd, Ancillary::with_fds(vec![source])).map(drop)
    }

    /// Open `path` inside the container for reading.
    pub fn open(&self, path: &str) -> Result<OwnedFd, ClientError> {
        let cmd = Command::Open {
            path: path.to_string(),
        };
        let ancillary = self.request(&cmd, Ancillary::default())?;
        ancillary
            .fds
            .into_iter()
            .next()
            .ok_or(ClientError::Protocol("open reply without descriptor"))
    }

    pub fn delete(&self, path: &str) -> Result<(), ClientError> {
        let cmd = Command::Delete {
            path: path.to_string(),
        };
        self.request(&cmd, Ancillary::default()).map(drop)
    }

    pub fn reset(&self) -> Result<(), ClientError> {
        self.request(&Command::Reset, Ancillary::default()).map(drop)
    }

    /// Run one program to completion.
    ///
    /// `on_started` sees the pid while the program is parked before exec;
    /// returning `false` kills it instead of letting it run.
    pub fn execve<F>(
        &self,
        req: ExecRequest,
        files: Vec<OwnedFd>,
        on_started: F,
    ) -> Result<ExecResult, ClientError>
    where
        F: FnOnce(i32) -> bool,
    {
        self.send(&Command::Execve(req), Ancillary::with_fds(files))?;

        let (first, ancillary) = self.recv()?;
        let (pid, terminal) = if first.is_error() {
            (None, first)
        } else {
            let cred = ancillary
                .cred
                .ok_or(ClientError::Protocol("rendezvous without credentials"))?;
            if on_started(cred.pid) {
                // Any command other than Kill lets the program exec.
                self.send(&Command::Ping, Ancillary::default())?;
                self.state.store(RUNNING, Ordering::SeqCst);
            } else {
                debug!(pid = cred.pid, "killing at rendezvous");
                self.send(&Command::Kill, Ancillary::default())?;
            }
            (Some(cred.pid), self.recv()?.0)
        };

        // The init waits for one more command before completing; skip it
        // only if `kill` already sent one.
        if self.state.swap(IDLE, Ordering::SeqCst) != KILLED {
            self.send(&Command::Kill, Ancillary::default())?;
        }
        let (completion, _) = self.recv()?;

        if let Some(message) = terminal.error {
            return Err(ClientError::Remote(message));
        }
        if let Some(message) = completion.error {
            return Err(ClientError::Remote(message));
        }
        let pid = pid.ok_or(ClientError::Protocol("terminal reply before rendezvous"))?;
        Ok(ExecResult {
            pid,
            exit_status: terminal.exit_status,
            outcome: terminal.outcome.unwrap_or_default(),
        })
    }

    /// Kill the running program, if any. Returns whether a kill was sent.
    pub fn kill(&self) -> Result<bool, ClientError> {
        if self
            .state
            .compare_exchange(RUNNING, KILLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        self.send(&Command::Kill, Ancillary::default())?;
        Ok(true)
    }

    fn request(&self, cmd: &Command, ancillary: Ancillary) -> Result<Ancillary, ClientError> {
        self.send(cmd, ancillary)?;
        let (reply, ancillary) = self.recv()?;
        match reply.error {
            Some(message) if !message.is_empty() => Err(ClientError::Remote(message)),
            _ => Ok(ancillary),
        }
    }

    fn send(&self, cmd: &Command, ancillary: Ancillary) -> Result<(), ChannelError> {
        self.socket.send(&encode(cmd)?, ancillary)
    }

    fn recv(&self) -> Result<(Reply, Ancillary), ChannelError> {
        recv_decoded(&self.socket, &self.pool)
    }
}
