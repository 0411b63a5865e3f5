//! Init loop: receive a command, dispatch it, repeat.
//!
//! The loop returns instead of exiting so it can run inside tests; only
//! `main` turns the result into a process exit.
#![allow(unsafe_code)]

use std::any::Any;
use std::ffi::OsString;
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::{debug, info};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{ChannelError, LoopError};
use crate::process::SystemProcesses;
use crate::runner::ForkExecRunner;
use crate::transport::{Channel, Socket, UnixChannel};

/// Marker argument that turns the binary into the container init.
pub const INIT_ARG: &str = "init";

/// True when running as namespace pid 1 invoked as `<program> init`.
pub fn should_activate<I>(pid: u32, args: I) -> bool
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter().skip(1);
    pid == 1 && args.next().is_some_and(|arg| arg == INIT_ARG) && args.next().is_none()
}

/// Adopt the inherited control socket and serve until it closes.
pub async fn run(config: &Config) -> Result<(), LoopError> {
    // SAFETY: the launcher hands this descriptor over to us and nothing else
    // in this process refers to it.
    let socket = unsafe { Socket::from_raw_fd(config.socket_fd) };
    fcntl(config.socket_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(ChannelError::Io)?;

    let channel: Arc<dyn Channel> = Arc::new(UnixChannel::new(socket, config.buffer_size));
    let dispatcher = Dispatcher::new(
        Arc::clone(&channel),
        Arc::new(ForkExecRunner::new()),
        Arc::new(SystemProcesses),
        config,
    );
    info!(
        socket_fd = config.socket_fd,
        kill_scope = ?config.kill_scope,
        "container init ready"
    );
    serve(channel, Arc::new(dispatcher)).await
}

/// Run the loop on its own task so a panic anywhere below surfaces as
/// [`LoopError::Panic`] instead of unwinding through the caller.
pub async fn serve(channel: Arc<dyn Channel>, dispatcher: Arc<Dispatcher>) -> Result<(), LoopError> {
    match tokio::spawn(serve_loop(channel, dispatcher)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(LoopError::Panic(panic_message(&e.into_panic()))),
        Err(e) => Err(ChannelError::Join(e).into()),
    }
}

async fn serve_loop(channel: Arc<dyn Channel>, dispatcher: Arc<Dispatcher>) -> Result<(), LoopError> {
    loop {
        let (cmd, ancillary) = match channel.recv_command().await {
            Ok(received) => received,
            Err(ChannelError::Closed) => {
                info!("control channel closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let name = cmd.name();
        debug!(cmd = name, fds = ancillary.fds.len(), "dispatching");
        dispatcher.dispatch(cmd, ancillary).await?;
        debug!(cmd = name, "done");
    }
}

/// Exit code and diagnostic line for how the init finished.
///
/// `outcome` is the driver's result, wrapped by `catch_unwind` so panics
/// outside the loop task exit the same way as panics inside it.
pub fn exit_status(outcome: std::thread::Result<anyhow::Result<()>>) -> (i32, String) {
    match outcome {
        Ok(Ok(())) => (0, "container_exit".to_string()),
        Ok(Err(e)) => match e.downcast_ref::<LoopError>() {
            Some(LoopError::Panic(message)) => (1, format!("container_panic: {message}")),
            _ => (1, format!("container_exit: {e:#}")),
        },
        Err(payload) => (1, format!("container_panic: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
