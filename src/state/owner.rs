//! Open and lock owners.
//!
//! An owner is an opaque client-chosen identifier that scopes one stream of
//! state-changing requests within a client. In NFSv4.0 every OPEN, CLOSE,
//! LOCK, ... carries the owner's seqid, and the owner keeps the reply of the
//! last request so a retransmission is answered from the cache instead of
//! being executed twice. NFSv4.1 owners are unsequenced; the session slot
//! takes over that job.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::protocol::xdr::nfs4::{clientid4, nfsstat4, seqid4, NFS4_OTHER_SIZE};

/// An open-owner or lock-owner of one client.
#[derive(Debug)]
pub struct StateOwner {
    client_id: clientid4,
    owner: Vec<u8>,
    sequenced: bool,
    confirmed: AtomicBool,
    sequence: Mutex<OwnerSequence>,
    states: Mutex<HashSet<[u8; NFS4_OTHER_SIZE]>>,
}

#[derive(Debug)]
struct OwnerSequence {
    last: seqid4,
    in_progress: bool,
    reply: Option<Vec<u8>>,
}

/// Outcome of checking a request's owner seqid.
#[derive(Debug)]
pub enum SeqidCheck {
    /// The request is new; execute it and report through the guard.
    Next(OwnerSequenceGuard),
    /// The request repeats the last one; answer with the cached reply.
    Replay(Vec<u8>),
}

impl StateOwner {
    /// Creates an NFSv4.0 owner whose first request carries `initial_seq`.
    pub fn sequenced(client_id: clientid4, owner: Vec<u8>, initial_seq: seqid4) -> Self {
        Self::new(client_id, owner, true, initial_seq.wrapping_sub(1))
    }

    /// Creates an NFSv4.1 owner; sequencing is done by the session slot.
    pub fn unsequenced(client_id: clientid4, owner: Vec<u8>) -> Self {
        let owner = Self::new(client_id, owner, false, 0);
        owner.confirmed.store(true, Ordering::Release);
        owner
    }

    fn new(client_id: clientid4, owner: Vec<u8>, sequenced: bool, last: seqid4) -> Self {
        Self {
            client_id,
            owner,
            sequenced,
            confirmed: AtomicBool::new(false),
            sequence: Mutex::new(OwnerSequence {
                last,
                in_progress: false,
                reply: None,
            }),
            states: Mutex::new(HashSet::new()),
        }
    }

    pub fn client_id(&self) -> clientid4 {
        self.client_id
    }

    pub fn owner(&self) -> &[u8] {
        &self.owner
    }

    /// Whether this owner uses NFSv4.0 seqids.
    pub fn is_sequenced(&self) -> bool {
        self.sequenced
    }

    /// Seqid of the last accepted request.
    pub fn last_seqid(&self) -> seqid4 {
        self.sequence.lock().last
    }

    /// Marks the owner confirmed (OPEN_CONFIRM).
    pub fn confirm(&self) {
        self.confirmed.store(true, Ordering::Release);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Checks `request_seq` against the owner's sequence.
    ///
    /// * equal to the last seqid: a retransmission, answered from the cache;
    /// * the last seqid plus one: a new request, returned as a guard;
    /// * anything else: `NFS4ERR_BAD_SEQID`.
    ///
    /// A new request arriving while another one of the same owner executes
    /// fails with `NFS4ERR_DELAY`.
    pub fn begin(self: &Arc<Self>, request_seq: seqid4) -> Result<SeqidCheck, nfsstat4> {
        if !self.sequenced {
            return Ok(SeqidCheck::Next(OwnerSequenceGuard {
                owner: self.clone(),
                done: true,
            }));
        }

        let mut seq = self.sequence.lock();
        if request_seq == seq.last {
            trace!("owner {:?} replay of seqid {}", self.owner, request_seq);
            return match &seq.reply {
                Some(reply) => Ok(SeqidCheck::Replay(reply.clone())),
                None => Err(nfsstat4::NFS4ERR_BAD_SEQID),
            };
        }
        if request_seq != seq.last.wrapping_add(1) {
            trace!(
                "owner {:?} expected seqid {}, got {}",
                self.owner,
                seq.last.wrapping_add(1),
                request_seq
            );
            return Err(nfsstat4::NFS4ERR_BAD_SEQID);
        }
        if seq.in_progress {
            return Err(nfsstat4::NFS4ERR_DELAY);
        }
        seq.in_progress = true;
        Ok(SeqidCheck::Next(OwnerSequenceGuard {
            owner: self.clone(),
            done: false,
        }))
    }

    pub(crate) fn attach_state(&self, other: [u8; NFS4_OTHER_SIZE]) {
        self.states.lock().insert(other);
    }

    pub(crate) fn detach_state(&self, other: &[u8; NFS4_OTHER_SIZE]) {
        self.states.lock().remove(other);
    }

    /// Whether any live state belongs to this owner.
    pub fn has_states(&self) -> bool {
        !self.states.lock().is_empty()
    }
}

/// A request accepted by [`StateOwner::begin`] that is being executed.
///
/// [`OwnerSequenceGuard::complete`] advances the owner and caches the reply.
/// Dropping the guard without completing leaves the seqid where it was, so
/// the client may resend the same request.
#[derive(Debug)]
pub struct OwnerSequenceGuard {
    owner: Arc<StateOwner>,
    done: bool,
}

impl OwnerSequenceGuard {
    pub fn owner(&self) -> &Arc<StateOwner> {
        &self.owner
    }

    /// Finishes the request with `status` and its encoded `reply`.
    pub fn complete(mut self, status: nfsstat4, reply: Vec<u8>) {
        self.done = true;
        if !self.owner.sequenced {
            return;
        }
        let mut seq = self.owner.sequence.lock();
        seq.in_progress = false;
        if status.bumps_seqid() {
            seq.last = seq.last.wrapping_add(1);
            seq.reply = Some(reply);
        }
    }
}

impl Drop for OwnerSequenceGuard {
    fn drop(&mut self) {
        if !self.done {
            self.owner.sequence.lock().in_progress = false;
        }
    }
}
