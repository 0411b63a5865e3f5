//! Command dispatch and the simple file-staging handlers.
//!
//! Each handler sends exactly one reply. OS failures become logical errors
//! in that reply; only a failing channel is returned to the caller.

use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ChannelError;
use crate::process::ProcessControl;
use crate::runner::Runner;
use crate::supervisor::Supervisor;
use crate::transport::{Ancillary, Channel, Command, Reply};

/// Staged files are created world read/write/execute so copied-in
/// binaries can run.
const COPY_IN_MODE: u32 = 0o777;

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    supervisor: Supervisor,
    tmp_dir: PathBuf,
    work_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn Channel>,
        runner: Arc<dyn Runner>,
        processes: Arc<dyn ProcessControl>,
        config: &Config,
    ) -> Self {
        let supervisor = Supervisor::new(
            Arc::clone(&channel),
            runner,
            processes,
            config.kill_scope,
            config.work_dir.clone(),
        );
        Self {
            channel,
            supervisor,
            tmp_dir: config.tmp_dir.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    /// Handle one command.
    pub async fn dispatch(&self, cmd: Command, ancillary: Ancillary) -> Result<(), ChannelError> {
        match cmd {
            Command::Ping => self.reply(Reply::ok()).await,
            Command::CopyIn { path } => self.copy_in(&path, ancillary).await,
            Command::Open { path } => self.open(&path).await,
            Command::Delete { path } => self.delete(&path).await,
            Command::Reset => self.reset().await,
            Command::Execve(req) => self.supervisor.execve(req, ancillary).await,
            Command::Kill => {
                warn!("kill outside an execve exchange");
                self.reply_error("kill: no execve in progress".to_string())
                    .await
            }
        }
    }

    async fn reply(&self, reply: Reply) -> Result<(), ChannelError> {
        self.channel.send_reply(&reply, Ancillary::default()).await
    }

    async fn reply_error(&self, message: String) -> Result<(), ChannelError> {
        warn!(%message, "command failed");
        self.reply(Reply::error(message)).await
    }

    async fn copy_in(&self, path: &str, ancillary: Ancillary) -> Result<(), ChannelError> {
        let [source] = match <[OwnedFd; 1]>::try_from(ancillary.fds) {
            Ok(fds) => fds,
            Err(fds) => {
                let count = fds.len();
                drop(fds);
                return self
                    .reply_error(format!("copyin: unexpected number of fds({count})"))
                    .await;
            }
        };

        match copy_into(path, source).await {
            Ok(bytes) => {
                debug!(path, bytes, "copied in");
                self.reply(Reply::ok()).await
            }
            Err(e) => self.reply_error(format!("copyin: {e}")).await,
        }
    }

    async fn open(&self, path: &str) -> Result<(), ChannelError> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => return self.reply_error(format!("open: {e}")).await,
        };
        let fd = OwnedFd::from(file.into_std().await);
        // The channel closes our copy once it is sent.
        self.channel
            .send_reply(&Reply::ok(), Ancillary::with_fds(vec![fd]))
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), ChannelError> {
        match remove_path(Path::new(path)).await {
            Ok(()) => self.reply(Reply::ok()).await,
            Err(e) => self.reply_error(format!("delete: {e}")).await,
        }
    }

    async fn reset(&self) -> Result<(), ChannelError> {
        for dir in [&self.tmp_dir, &self.work_dir] {
            if let Err(e) = remove_contents(dir).await {
                return self
                    .reply_error(format!("reset: {} {e}", dir.display()))
                    .await;
            }
        }
        debug!("scratch directories cleared");
        self.reply(Reply::ok()).await
    }
}

/// Create or truncate `path` and stream `source` into it.
async fn copy_into(path: &str, source: OwnedFd) -> io::Result<u64> {
    let mut input = tokio::fs::File::from_std(std::fs::File::from(source));
    let mut output = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(COPY_IN_MODE)
        .open(path)
        .await?;
    let bytes = tokio::io::copy(&mut input, &mut output).await?;
    output.flush().await?;
    Ok(bytes)
}

/// Remove a file, symlink or empty directory.
async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

/// Delete everything inside `dir`, keeping `dir` itself.
async fn remove_contents(dir: &Path) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
