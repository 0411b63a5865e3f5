//! `SOCK_SEQPACKET` Unix socket with descriptor and credential passing.
//!
//! Each datagram is one message. Descriptors travel as `SCM_RIGHTS`,
//! the credential triple as `SCM_CREDENTIALS`.
#![allow(unsafe_code)]

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixCredentials,
};
use tracing::trace;

use super::{Ancillary, Credentials};
use crate::error::ChannelError;

/// Most descriptors accepted in one message.
pub const MAX_FDS: usize = 16;

/// One end of the control channel.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Wrap an already connected socket.
    pub const fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Adopt an inherited descriptor number.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket owned by nobody else in this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self::new(OwnedFd::from_raw_fd(fd))
    }

    /// Connected pair, both ends close-on-exec.
    pub fn pair() -> nix::Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Ask the kernel to deliver peer credentials with each message.
    pub fn set_pass_cred(&self, enabled: bool) -> nix::Result<()> {
        setsockopt(&self.fd, sockopt::PassCred, &enabled)
    }

    /// Send one datagram. Descriptors in `ancillary` are closed afterwards
    /// whether or not the send went through.
    pub fn send(&self, payload: &[u8], ancillary: Ancillary) -> Result<(), ChannelError> {
        let raw_fds: Vec<RawFd> = ancillary.fds.iter().map(AsRawFd::as_raw_fd).collect();
        let cred = ancillary.cred.map(UnixCredentials::from);

        let mut cmsgs = Vec::with_capacity(2);
        if !raw_fds.is_empty() {
            cmsgs.push(ControlMessage::ScmRights(&raw_fds));
        }
        if let Some(cred) = cred.as_ref() {
            cmsgs.push(ControlMessage::ScmCredentials(cred));
        }

        let iov = [IoSlice::new(payload)];
        let result = loop {
            match sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };
        drop(ancillary);

        let sent = result?;
        trace!(bytes = sent, fds = raw_fds.len(), "sent message");
        Ok(())
    }

    /// Receive one datagram into `buf`.
    ///
    /// Received descriptors are close-on-exec. A zero-length datagram means
    /// the peer hung up.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, Ancillary), ChannelError> {
        let capacity = buf.len();
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS], libc::ucred);
        let mut iov = [IoSliceMut::new(buf)];

        loop {
            let msg = match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            let mut ancillary = Ancillary::default();
            let cmsgs = match msg.cmsgs() {
                Ok(cmsgs) => cmsgs,
                Err(Errno::ENOBUFS) => return Err(ChannelError::AncillaryTruncated),
                Err(e) => return Err(e.into()),
            };
            for cmsg in cmsgs {
                match cmsg {
                    ControlMessageOwned::ScmRights(fds) => {
                        // SAFETY: the kernel just installed these descriptors
                        // in our table; nothing else refers to them.
                        ancillary
                            .fds
                            .extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                    }
                    ControlMessageOwned::ScmCredentials(cred) => {
                        ancillary.cred = Some(Credentials {
                            pid: cred.pid(),
                            uid: cred.uid(),
                            gid: cred.gid(),
                        });
                    }
                    _ => {}
                }
            }

            if msg.flags.contains(MsgFlags::MSG_TRUNC) {
                return Err(ChannelError::Truncated(capacity));
            }
            if msg.bytes == 0 {
                return Err(ChannelError::Closed);
            }
            trace!(bytes = msg.bytes, fds = ancillary.fds.len(), "received message");
            return Ok((msg.bytes, ancillary));
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<Credentials> for UnixCredentials {
    fn from(cred: Credentials) -> Self {
        Self::from(libc::ucred {
            pid: cred.pid,
            uid: cred.uid,
            gid: cred.gid,
        })
    }
}
