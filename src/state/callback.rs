//! Back channel to a client.
//!
//! The server needs to talk to clients on its own initiative only to take
//! back delegations. How the CB_RECALL reaches the client (a callback RPC
//! program for NFSv4.0, the session back channel for NFSv4.1) is up to the
//! transport; the state layer only needs the [`CallbackChannel`] trait.

use async_trait::async_trait;

use super::Inode;
use crate::protocol::xdr::nfs4::{nfsstat4, stateid4};

/// Callback path to one client.
#[async_trait]
pub trait CallbackChannel: Send + Sync {
    /// Asks the client to return the delegation `stateid` on `inode`.
    /// `is_write` tells whether it is a write delegation.
    ///
    /// Called on a spawned task; the conflicting request has already been
    /// answered with `NFS4ERR_DELAY`.
    async fn notify_recall(
        &self,
        inode: &Inode,
        stateid: stateid4,
        is_write: bool,
    ) -> Result<(), nfsstat4>;
}
