//! NFSv4 client, session and state management.
//!
//! This is the stateful heart of an NFSv4.0/4.1 server. Operation handlers
//! consult it to:
//!
//! - establish client identities and keep their leases (`client`, `handler`)
//! - sequence requests exactly once, via owner seqids in v4.0 (`owner`) or
//!   session slots in v4.1 (`session`)
//! - hand out stateids for opens, locks, delegations, layouts and copies
//!   (`stateid`, `nfs4_state`)
//! - enforce share reservations and grant or recall delegations (`file_tracker`)
//! - enforce byte-range locks (`lock_manager`)
//! - let clients reclaim their state after a server restart (`recovery`)
//!
//! [`StateHandler`] ties everything together and is the single entry point
//! handed to every request context.

use std::fmt;

mod callback;
mod client;
mod file_tracker;
mod handler;
mod lock_manager;
mod nfs4_state;
mod owner;
pub mod recovery;
mod session;
pub mod stateid;

pub use callback::CallbackChannel;
pub use client::{NFS4Client, NewClient};
pub use file_tracker::{DelegationGrant, DelegationInfo, FileTracker, OpenResult};
pub use handler::{LockError, StateHandler};
pub use lock_manager::{ByteRangeLock, LockDenied, LockManager, LockOwnerKey};
pub use nfs4_state::{DisposeListener, NFS4State};
pub use owner::{OwnerSequenceGuard, SeqidCheck, StateOwner};
pub use recovery::ClientRecoveryStore;
pub use session::{
    ConnectionId, NFSv41Session, SequenceReply, SequenceResult, SessionRequest, SlotGuard,
};
pub use stateid::StateType;

/// Identity of a file as the state layer sees it: the opaque file handle
/// bytes of the object.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Inode(Vec<u8>);

impl Inode {
    pub fn new(handle: impl Into<Vec<u8>>) -> Self {
        Self(handle.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Inode {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for Inode {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl AsRef<[u8]> for Inode {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inode(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
