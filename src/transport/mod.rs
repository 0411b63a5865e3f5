//! Transport layer for controller ↔ init communication.
//!
//! Provides the `Channel` trait the init loop talks through, the JSON codec,
//! and the Unix socket implementation carrying descriptors and credentials.

pub mod pool;
pub mod protocol;
pub mod socket;

pub use pool::BufferPool;
pub use protocol::{Command, ExecRequest, LimitKind, Outcome, Reply, ResourceLimit};
pub use socket::Socket;

use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{join, ChannelError};

/// Maximum encoded message size (64 KiB). Also the default receive buffer.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Process credential triple sent alongside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// `pid` paired with this process's real uid and gid.
    pub fn current(pid: i32) -> Self {
        Self {
            pid,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Out-of-band part of a message. Owns its descriptors: dropping it closes
/// them.
#[derive(Debug, Default)]
pub struct Ancillary {
    pub fds: Vec<OwnedFd>,
    pub cred: Option<Credentials>,
}

impl Ancillary {
    pub fn with_fds(fds: Vec<OwnedFd>) -> Self {
        Self { fds, cred: None }
    }

    pub fn with_cred(cred: Credentials) -> Self {
        Self {
            fds: Vec::new(),
            cred: Some(cred),
        }
    }
}

/// Init-side view of the control channel.
///
/// Both methods take `&self`: during an execve exchange the kill listener
/// blocks in `recv_command` while the supervisor sends replies.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Receive and decode the next command.
    async fn recv_command(&self) -> Result<(Command, Ancillary), ChannelError>;

    /// Encode and send a reply, transferring any attached descriptors.
    async fn send_reply(&self, reply: &Reply, ancillary: Ancillary) -> Result<(), ChannelError>;
}

/// Serialize a message. Fails with `TooLarge` past [`MAX_MESSAGE_SIZE`].
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ChannelError> {
    let payload = serde_json::to_vec(value).map_err(ChannelError::Encode)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ChannelError::TooLarge(payload.len()));
    }
    Ok(payload)
}

/// Deserialize a complete message; partial input is an error.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ChannelError> {
    serde_json::from_slice(payload).map_err(ChannelError::Decode)
}

/// Receive one message into a pooled buffer and decode it.
///
/// The buffer goes back to the pool before this returns, on every path.
pub fn recv_decoded<T: DeserializeOwned>(
    socket: &Socket,
    pool: &BufferPool,
) -> Result<(T, Ancillary), ChannelError> {
    let mut buf = pool.acquire();
    let (len, ancillary) = socket.recv(&mut buf)?;
    let value = decode(&buf[..len])?;
    Ok((value, ancillary))
}

/// [`Channel`] over a [`Socket`]. Blocking syscalls run on tokio's blocking
/// pool so the kill listener and the primary wait can overlap.
#[derive(Debug, Clone)]
pub struct UnixChannel {
    socket: Arc<Socket>,
    pool: Arc<BufferPool>,
}

impl UnixChannel {
    pub fn new(socket: Socket, buffer_size: usize) -> Self {
        Self {
            socket: Arc::new(socket),
            pool: Arc::new(BufferPool::new(buffer_size)),
        }
    }
}

#[async_trait]
impl Channel for UnixChannel {
    async fn recv_command(&self) -> Result<(Command, Ancillary), ChannelError> {
        let socket = Arc::clone(&self.socket);
        let pool = Arc::clone(&self.pool);
        join(tokio::task::spawn_blocking(move || recv_decoded(&socket, &pool))).await?
    }

    async fn send_reply(&self, reply: &Reply, ancillary: Ancillary) -> Result<(), ChannelError> {
        let payload = encode(reply)?;
        let socket = Arc::clone(&self.socket);
        join(tokio::task::spawn_blocking(move || socket.send(&payload, ancillary))).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_payload_is_decode_error() {
        let payload = encode(&Command::Open {
            path: "/w/out".to_string(),
        })
        .unwrap();
        let cut = &payload[..payload.len() - 3];
        assert!(matches!(
            decode::<Command>(cut),
            Err(ChannelError::Decode(_))
        ));
    }

    #[test]
    fn corrupted_payload_is_decode_error() {
        assert!(matches!(
            decode::<Command>(b"\x00\xffgarbage"),
            Err(ChannelError::Decode(_))
        ));
        // Well-formed JSON missing a required field.
        assert!(matches!(
            decode::<Command>(br#"{"cmd":"copy_in"}"#),
            Err(ChannelError::Decode(_))
        ));
    }

    #[test]
    fn oversized_message_rejected() {
        let req = ExecRequest {
            argv: vec!["x".repeat(MAX_MESSAGE_SIZE)],
            ..ExecRequest::default()
        };
        assert!(matches!(
            encode(&Command::Execve(req)),
            Err(ChannelError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn channel_roundtrip_over_socketpair() {
        let (init_end, controller_end) = Socket::pair().unwrap();
        let channel = UnixChannel::new(init_end, MAX_MESSAGE_SIZE);

        let payload = encode(&Command::Delete {
            path: "/tmp/x".to_string(),
        })
        .unwrap();
        controller_end.send(&payload, Ancillary::default()).unwrap();

        let (cmd, ancillary) = channel.recv_command().await.unwrap();
        assert_eq!(
            cmd,
            Command::Delete {
                path: "/tmp/x".to_string()
            }
        );
        assert!(ancillary.fds.is_empty());

        channel
            .send_reply(&Reply::error("delete: denied"), Ancillary::default())
            .await
            .unwrap();
        let pool = BufferPool::new(MAX_MESSAGE_SIZE);
        let (reply, _) = recv_decoded::<Reply>(&controller_end, &pool).unwrap();
        assert_eq!(reply.error.as_deref(), Some("delete: denied"));
    }

    #[tokio::test]
    async fn corrupted_datagram_fails_receive() {
        let (init_end, controller_end) = Socket::pair().unwrap();
        let channel = UnixChannel::new(init_end, MAX_MESSAGE_SIZE);

        controller_end
            .send(br#"{"cmd":"pi"#, Ancillary::default())
            .unwrap();
        assert!(matches!(
            channel.recv_command().await,
            Err(ChannelError::Decode(_))
        ));
    }
}
