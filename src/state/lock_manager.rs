//! Byte-range locks.
//!
//! Locks are advisory ranges held by a lock-owner on a file. Read locks of
//! different owners may overlap; a write lock conflicts with every
//! overlapping lock of another owner. Locks of the same owner never conflict:
//! a new lock replaces whatever the owner held on its range, splitting
//! older locks as needed.
//!
//! A length of `u64::MAX` means "up to the end of the file".
//!
//! Every granted range remembers the lock stateid it was taken under. One
//! lock-owner may hold a lock state per open of the file, and releasing one
//! of them drops only that state's ranges.

use std::fmt;

use dashmap::DashMap;
use tracing::trace;

use super::Inode;
use crate::protocol::xdr::nfs4::{clientid4, nfs_lock_type4, nfsstat4, NFS4_OTHER_SIZE};

/// Identity of a lock-owner: `lock_owner4` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockOwnerKey {
    pub client_id: clientid4,
    pub owner: Vec<u8>,
}

impl LockOwnerKey {
    pub fn new(client_id: clientid4, owner: impl Into<Vec<u8>>) -> Self {
        Self {
            client_id,
            owner: owner.into(),
        }
    }
}

/// A lock held (or requested) on a byte range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteRangeLock {
    pub owner: LockOwnerKey,
    pub lock_type: nfs_lock_type4,
    pub offset: u64,
    pub length: u64,
}

impl ByteRangeLock {
    /// Builds a lock, rejecting an empty range or one that runs past the
    /// largest offset with `NFS4ERR_INVAL`.
    pub fn new(
        owner: LockOwnerKey,
        lock_type: nfs_lock_type4,
        offset: u64,
        length: u64,
    ) -> Result<Self, nfsstat4> {
        last_byte(offset, length)?;
        Ok(Self {
            owner,
            lock_type,
            offset,
            length,
        })
    }

    /// Last byte covered by the lock (inclusive).
    pub fn last(&self) -> u64 {
        if self.length == u64::MAX {
            u64::MAX
        } else {
            self.offset + (self.length - 1)
        }
    }

    pub fn is_write(&self) -> bool {
        self.lock_type.is_write()
    }

    fn overlaps(&self, offset: u64, last: u64) -> bool {
        self.offset <= last && offset <= self.last()
    }

    fn conflicts_with(&self, other: &ByteRangeLock) -> bool {
        self.owner != other.owner
            && self.overlaps(other.offset, other.last())
            && (self.is_write() || other.is_write())
    }

    /// The part of `self` left after removing `offset..=last`: up to two
    /// pieces.
    fn subtract(&self, offset: u64, last: u64) -> impl Iterator<Item = ByteRangeLock> {
        let before = (self.offset < offset).then(|| ByteRangeLock {
            length: offset - self.offset,
            ..self.clone()
        });
        let after = (last < self.last()).then(|| ByteRangeLock {
            offset: last + 1,
            length: if self.length == u64::MAX { u64::MAX } else { self.last() - last },
            ..self.clone()
        });
        before.into_iter().chain(after)
    }
}

fn last_byte(offset: u64, length: u64) -> Result<u64, nfsstat4> {
    match length {
        0 => Err(nfsstat4::NFS4ERR_INVAL),
        u64::MAX => Ok(u64::MAX),
        _ => offset.checked_add(length - 1).ok_or(nfsstat4::NFS4ERR_INVAL),
    }
}

/// A lock request was refused because of `conflict` (NFS4ERR_DENIED, with
/// the conflicting lock reported to the client).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockDenied {
    pub conflict: ByteRangeLock,
}

impl fmt::Display for LockDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock denied by {:?} lock of client {:016x} at {}+{}",
            self.conflict.lock_type, self.conflict.owner.client_id, self.conflict.offset,
            self.conflict.length
        )
    }
}

impl std::error::Error for LockDenied {}

impl From<LockDenied> for nfsstat4 {
    fn from(_: LockDenied) -> Self {
        nfsstat4::NFS4ERR_DENIED
    }
}

/// A granted lock with the opaque part of its lock stateid.
#[derive(Clone, Debug)]
struct HeldLock {
    state: [u8; NFS4_OTHER_SIZE],
    lock: ByteRangeLock,
}

/// Byte-range locks of every file.
#[derive(Default)]
pub struct LockManager {
    files: DashMap<Inode, Vec<HeldLock>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `lock` on `inode` for the lock state `state`, replacing locks
    /// its owner already holds on the range.
    pub fn lock(
        &self,
        inode: &Inode,
        state: [u8; NFS4_OTHER_SIZE],
        lock: ByteRangeLock,
    ) -> Result<(), LockDenied> {
        let mut locks = self.files.entry(inode.clone()).or_default();
        let conflict = locks.iter().find(|held| held.lock.conflicts_with(&lock));
        if let Some(conflict) = conflict.map(|held| held.lock.clone()) {
            trace!("{:?}: {:?} denied by {:?}", inode, lock, conflict);
            drop(locks);
            self.files.remove_if(inode, |_, locks| locks.is_empty());
            return Err(LockDenied { conflict });
        }
        Self::remove_range(&mut *locks, &lock.owner, lock.offset, lock.last());
        trace!("{:?}: locked {:?}", inode, lock);
        locks.push(HeldLock { state, lock });
        Ok(())
    }

    /// The first lock that would deny `lock` (LOCKT).
    pub fn test(&self, inode: &Inode, lock: &ByteRangeLock) -> Option<ByteRangeLock> {
        let locks = self.files.get(inode)?;
        locks.iter().find(|held| held.lock.conflicts_with(lock)).map(|held| held.lock.clone())
    }

    /// Releases the range `offset`/`length` held by `owner` (LOCKU). Locks
    /// partially covered by the range are split.
    pub fn unlock(
        &self,
        inode: &Inode,
        owner: &LockOwnerKey,
        offset: u64,
        length: u64,
    ) -> Result<(), nfsstat4> {
        let last = last_byte(offset, length)?;
        if let Some(mut locks) = self.files.get_mut(inode) {
            Self::remove_range(&mut *locks, owner, offset, last);
        }
        self.files.remove_if(inode, |_, locks| locks.is_empty());
        Ok(())
    }

    /// Releases every lock taken on `inode` under the lock state `state`.
    pub fn unlock_state(&self, inode: &Inode, state: &[u8; NFS4_OTHER_SIZE]) {
        if let Some(mut locks) = self.files.get_mut(inode) {
            locks.retain(|held| held.state != *state);
        }
        self.files.remove_if(inode, |_, locks| locks.is_empty());
    }

    /// Whether `owner` holds any lock on `inode`.
    pub fn has_locks(&self, inode: &Inode, owner: &LockOwnerKey) -> bool {
        self.files
            .get(inode)
            .is_some_and(|locks| locks.iter().any(|held| held.lock.owner == *owner))
    }

    /// Locks held on `inode`, in acquisition order.
    pub fn locks(&self, inode: &Inode) -> Vec<ByteRangeLock> {
        self.files
            .get(inode)
            .map(|locks| locks.iter().map(|held| held.lock.clone()).collect())
            .unwrap_or_default()
    }

    fn remove_range(locks: &mut Vec<HeldLock>, owner: &LockOwnerKey, offset: u64, last: u64) {
        let mut kept = Vec::with_capacity(locks.len());
        for held in locks.drain(..) {
            if held.lock.owner == *owner && held.lock.overlaps(offset, last) {
                let state = held.state;
                kept.extend(held.lock.subtract(offset, last).map(|lock| HeldLock { state, lock }));
            } else {
                kept.push(held);
            }
        }
        *locks = kept;
    }
}
