//! container-init library
//!
//! The init process of a sandbox namespace and the controller client that
//! talks to it:
//! - Control channel: JSON messages over a `SOCK_SEQPACKET` socket with
//!   descriptor and credential passing
//! - Command dispatch for file staging and scratch cleanup
//! - Execution supervisor running untrusted programs with a kill race

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod init;
pub mod process;
pub mod runner;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod testing;
