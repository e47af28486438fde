//! SSH transport layer
//!
//! [`client`] builds authenticated sessions (optionally tunneled through a
//! bastion); [`session`] runs the four task operations on top of an
//! established session and its SFTP channel.

mod client;
mod session;

pub use client::{Bastion, HostKeyPolicy, SshClient};
pub use session::HostSession;

/// libssh2 return code when the session timeout fires mid-operation;
/// not exported by the ssh2 crate.
pub(crate) const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
