//! A single piece of server-held state: an open, a byte-range lock, a
//! delegation, a layout or a server-side copy.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::owner::StateOwner;
use super::stateid::{self, StateType};
use super::Inode;
use crate::protocol::xdr::nfs4::{stateid4, NFS4_OTHER_SIZE};

/// Callback run once when the state is disposed.
pub type DisposeListener = Box<dyn FnOnce(&NFS4State) + Send>;

/// State handle identified by a stateid.
///
/// Disposal happens exactly once: the first call to [`NFS4State::dispose`]
/// runs every registered listener, later calls do nothing.
pub struct NFS4State {
    stateid: Mutex<stateid4>,
    state_type: StateType,
    owner: Arc<StateOwner>,
    /// Open state a lock state hangs off
    parent: Option<[u8; NFS4_OTHER_SIZE]>,
    file: Option<Inode>,
    disposed: AtomicBool,
    listeners: Mutex<SmallVec<[DisposeListener; 2]>>,
}

impl NFS4State {
    pub(crate) fn new(
        stateid: stateid4,
        state_type: StateType,
        owner: Arc<StateOwner>,
        parent: Option<[u8; NFS4_OTHER_SIZE]>,
        file: Option<Inode>,
        listener: Option<DisposeListener>,
    ) -> Self {
        Self {
            stateid: Mutex::new(stateid),
            state_type,
            owner,
            parent,
            file,
            disposed: AtomicBool::new(false),
            listeners: Mutex::new(listener.into_iter().collect()),
        }
    }

    /// Current stateid, including its seqid.
    pub fn stateid(&self) -> stateid4 {
        *self.stateid.lock()
    }

    /// The opaque part of the stateid; never changes.
    pub fn other(&self) -> [u8; NFS4_OTHER_SIZE] {
        self.stateid.lock().other
    }

    pub fn state_type(&self) -> StateType {
        self.state_type
    }

    pub fn owner(&self) -> &Arc<StateOwner> {
        &self.owner
    }

    /// Opaque part of the parent open state, for lock states.
    pub fn parent(&self) -> Option<&[u8; NFS4_OTHER_SIZE]> {
        self.parent.as_ref()
    }

    /// File the state refers to, if it was created for one.
    pub fn file(&self) -> Option<&Inode> {
        self.file.as_ref()
    }

    /// Advances the seqid after a state-changing operation and returns the
    /// new stateid.
    pub fn bump_seqid(&self) -> stateid4 {
        let mut id = self.stateid.lock();
        id.seqid = stateid::bump_seqid(id.seqid);
        *id
    }

    /// Registers `listener` to run on disposal. If the state is already
    /// disposed the listener runs right away, on the calling thread, so the
    /// caller must not hold any lock the listener takes.
    pub fn add_dispose_listener(&self, listener: impl FnOnce(&NFS4State) + Send + 'static) {
        {
            let mut listeners = self.listeners.lock();
            if !self.disposed.load(Ordering::Acquire) {
                listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// Disposes the state, running its listeners. Returns `false` if it was
    /// disposed already.
    pub fn dispose(&self) -> bool {
        let listeners = {
            let mut listeners = self.listeners.lock();
            if self.disposed.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *listeners)
        };
        for listener in listeners {
            listener(self);
        }
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for NFS4State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NFS4State")
            .field("stateid", &self.stateid())
            .field("type", &self.state_type)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
