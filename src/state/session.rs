//! NFSv4.1 sessions and their slot tables.
//!
//! Every COMPOUND of a minor version 1 client starts with SEQUENCE, naming a
//! slot of the session and that slot's next sequence id. A slot executes one
//! request at a time; its last reply is cached so that a retransmission is
//! answered without executing the request again (exactly-once semantics).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::SessionLimits;
use crate::protocol::xdr::nfs4::{
    channel_attrs4, channel_dir_from_client4, channel_dir_from_server4, clientid4, nfsstat4,
    sequenceid4, sessionid4, slotid4, CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
};

/// Identifies a transport connection, as assigned by the server's
/// connection layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Arguments of CREATE_SESSION.
#[derive(Clone, Debug, Default)]
pub struct SessionRequest {
    /// `csa_sequence`: the client's create-session sequence id
    pub sequence: sequenceid4,
    pub flags: u32,
    pub fore_channel: channel_attrs4,
    pub back_channel: channel_attrs4,
    pub cb_program: u32,
}

#[derive(Debug, Default)]
struct SessionSlot {
    sequence: sequenceid4,
    used: bool,
    in_progress: bool,
    reply: Option<Vec<u8>>,
}

/// One NFSv4.1 session of a client.
pub struct NFSv41Session {
    id: sessionid4,
    client_id: clientid4,
    sequence: sequenceid4,
    flags: u32,
    cb_program: u32,
    fore_channel: channel_attrs4,
    back_channel: channel_attrs4,
    slots: Box<[Mutex<SessionSlot>]>,
    highest_used: AtomicI32,
    client_highest: AtomicU32,
    auto_bind: bool,
    connections: Mutex<HashMap<ConnectionId, channel_dir_from_server4>>,
}

/// Result of SEQUENCE on a slot.
#[derive(Debug)]
pub enum SequenceResult {
    /// A new request; execute it and finish through the guard.
    New(SlotGuard),
    /// A retransmission; send the cached reply back.
    Replay(Vec<u8>),
}

/// Slot fields of a SEQUENCE reply.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SequenceReply {
    pub session_id: sessionid4,
    pub sequence: sequenceid4,
    pub slot_id: slotid4,
    pub highest_slot_id: slotid4,
    pub target_highest_slot_id: slotid4,
}

/// Negotiates one channel: every limit is the smaller of what the client
/// asked for and what the server allows.
fn negotiate(
    requested: &channel_attrs4,
    max_requests: u32,
    limits: &SessionLimits,
) -> channel_attrs4 {
    channel_attrs4 {
        ca_headerpadsize: 0,
        ca_maxrequestsize: requested.ca_maxrequestsize.min(limits.max_request_size),
        ca_maxresponsesize: requested.ca_maxresponsesize.min(limits.max_response_size),
        ca_maxresponsesize_cached: requested
            .ca_maxresponsesize_cached
            .min(limits.max_response_size_cached),
        ca_maxoperations: requested.ca_maxoperations.min(limits.max_operations),
        ca_maxrequests: requested.ca_maxrequests.min(max_requests),
        ca_rdma_ird: Vec::new(),
    }
}

impl NFSv41Session {
    /// Creates a session with channels negotiated against `limits`. The
    /// connection the CREATE_SESSION arrived on is bound to it.
    pub(crate) fn new(
        id: sessionid4,
        client_id: clientid4,
        request: &SessionRequest,
        limits: &SessionLimits,
        auto_bind: bool,
        connection: ConnectionId,
    ) -> Result<Self, nfsstat4> {
        if request.fore_channel.ca_maxrequests == 0 {
            return Err(nfsstat4::NFS4ERR_INVAL);
        }
        let fore_channel = negotiate(&request.fore_channel, limits.max_requests, limits);
        if fore_channel.ca_maxrequests == 0 {
            return Err(nfsstat4::NFS4ERR_INVAL);
        }
        let back_channel = negotiate(&request.back_channel, limits.max_back_requests, limits);
        let slots = (0..fore_channel.ca_maxrequests).map(|_| Mutex::default()).collect();

        // persistent and RDMA sessions are not offered
        let flags = request.flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN;
        let direction = if flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN != 0 {
            channel_dir_from_server4::CDFS4_BOTH
        } else {
            channel_dir_from_server4::CDFS4_FORE
        };

        Ok(Self {
            id,
            client_id,
            sequence: request.sequence,
            flags,
            cb_program: request.cb_program,
            client_highest: AtomicU32::new(fore_channel.ca_maxrequests - 1),
            fore_channel,
            back_channel,
            slots,
            highest_used: AtomicI32::new(-1),
            auto_bind,
            connections: Mutex::new(HashMap::from([(connection, direction)])),
        })
    }

    pub fn id(&self) -> &sessionid4 {
        &self.id
    }

    pub fn client_id(&self) -> clientid4 {
        self.client_id
    }

    /// The CREATE_SESSION sequence id that created this session.
    pub fn sequence(&self) -> sequenceid4 {
        self.sequence
    }

    /// Flags granted by the server.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn cb_program(&self) -> u32 {
        self.cb_program
    }

    pub fn fore_channel(&self) -> &channel_attrs4 {
        &self.fore_channel
    }

    pub fn back_channel(&self) -> &channel_attrs4 {
        &self.back_channel
    }

    /// Number of slots of the fore channel.
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Highest slot id that has ever carried a request, or -1.
    pub fn get_highest_used_slot(&self) -> i32 {
        self.highest_used.load(Ordering::Acquire)
    }

    /// Highest slot id the client last said it is going to use.
    pub fn client_highest_slot(&self) -> slotid4 {
        self.client_highest.load(Ordering::Acquire)
    }

    /// Whether any slot is executing a request.
    pub fn has_requests_in_progress(&self) -> bool {
        self.slots.iter().any(|slot| slot.lock().in_progress)
    }

    /// Starts a request on `slot_id` with sequence id `sequence`.
    ///
    /// * `slot_id` outside the slot table or above `highest_slot_id`:
    ///   `NFS4ERR_BADSLOT`;
    /// * same sequence id as the slot's last request: the cached reply, or
    ///   `NFS4ERR_RETRY_UNCACHED_REP` when it was not cached;
    /// * the next sequence id: a new request, unless the slot is still busy
    ///   (`NFS4ERR_DELAY`);
    /// * anything else: `NFS4ERR_SEQ_MISORDERED`.
    pub fn sequence_request(
        self: &Arc<Self>,
        connection: ConnectionId,
        slot_id: slotid4,
        sequence: sequenceid4,
        highest_slot_id: slotid4,
        cache_this: bool,
    ) -> Result<SequenceResult, nfsstat4> {
        let slot = match self.slots.get(slot_id as usize) {
            Some(slot) if slot_id <= highest_slot_id => slot,
            _ => {
                trace!("slot {} out of range (highest {})", slot_id, highest_slot_id);
                return Err(nfsstat4::NFS4ERR_BADSLOT);
            }
        };
        self.check_connection(connection)?;
        self.client_highest.store(highest_slot_id.min(self.slot_count() - 1), Ordering::Release);

        let mut slot = slot.lock();
        if slot.in_progress {
            if sequence == slot.sequence || sequence == slot.sequence.wrapping_add(1) {
                return Err(nfsstat4::NFS4ERR_DELAY);
            }
            return Err(nfsstat4::NFS4ERR_SEQ_MISORDERED);
        }
        if slot.used && sequence == slot.sequence {
            trace!("slot {} replay of sequence {}", slot_id, sequence);
            return match &slot.reply {
                Some(reply) => Ok(SequenceResult::Replay(reply.clone())),
                None => Err(nfsstat4::NFS4ERR_RETRY_UNCACHED_REP),
            };
        }
        if sequence != slot.sequence.wrapping_add(1) {
            trace!(
                "slot {} expected sequence {}, got {}",
                slot_id,
                slot.sequence.wrapping_add(1),
                sequence
            );
            return Err(nfsstat4::NFS4ERR_SEQ_MISORDERED);
        }

        slot.in_progress = true;
        slot.used = true;
        drop(slot);
        self.highest_used.fetch_max(slot_id as i32, Ordering::AcqRel);

        Ok(SequenceResult::New(SlotGuard {
            session: self.clone(),
            slot_id,
            sequence,
            cache_this,
            done: false,
        }))
    }

    /// Binds `connection` for `direction` (BIND_CONN_TO_SESSION) and returns
    /// the directions actually bound.
    pub fn bind_connection(
        &self,
        connection: ConnectionId,
        direction: channel_dir_from_client4,
    ) -> channel_dir_from_server4 {
        let bound = match direction {
            channel_dir_from_client4::CDFC4_FORE => channel_dir_from_server4::CDFS4_FORE,
            channel_dir_from_client4::CDFC4_BACK => channel_dir_from_server4::CDFS4_BACK,
            channel_dir_from_client4::CDFC4_FORE_OR_BOTH
            | channel_dir_from_client4::CDFC4_BACK_OR_BOTH => channel_dir_from_server4::CDFS4_BOTH,
        };
        debug!("session {:02x?}: bind {} as {:?}", &self.id[..12], connection, bound);
        self.connections.lock().insert(connection, bound);
        bound
    }

    /// Forgets `connection`, e.g. when it is closed.
    pub fn unbind_connection(&self, connection: ConnectionId) -> bool {
        self.connections.lock().remove(&connection).is_some()
    }

    pub fn is_bound(&self, connection: ConnectionId) -> bool {
        self.connections.lock().contains_key(&connection)
    }

    /// Makes sure a fore channel request on `connection` may use this
    /// session, binding the connection implicitly when allowed.
    pub fn check_connection(&self, connection: ConnectionId) -> Result<(), nfsstat4> {
        let mut connections = self.connections.lock();
        if connections.contains_key(&connection) {
            return Ok(());
        }
        if !self.auto_bind {
            return Err(nfsstat4::NFS4ERR_CONN_NOT_BOUND_TO_SESSION);
        }
        trace!("auto-binding {}", connection);
        connections.insert(connection, channel_dir_from_server4::CDFS4_FORE);
        Ok(())
    }

    fn finish(&self, slot_id: slotid4, sequence: sequenceid4, reply: Option<Vec<u8>>) {
        let mut slot = self.slots[slot_id as usize].lock();
        slot.sequence = sequence;
        slot.in_progress = false;
        slot.reply = reply;
    }
}

impl fmt::Debug for NFSv41Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NFSv41Session")
            .field("id", &self.id)
            .field("client_id", &format_args!("{:016x}", self.client_id))
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A slot executing a request.
///
/// [`SlotGuard::complete`] records the reply; dropping the guard without
/// completing advances the slot with no cached reply, so a retransmission
/// gets `NFS4ERR_RETRY_UNCACHED_REP`.
pub struct SlotGuard {
    session: Arc<NFSv41Session>,
    slot_id: slotid4,
    sequence: sequenceid4,
    cache_this: bool,
    done: bool,
}

impl SlotGuard {
    pub fn session(&self) -> &Arc<NFSv41Session> {
        &self.session
    }

    pub fn slot_id(&self) -> slotid4 {
        self.slot_id
    }

    /// Slot fields for the SEQUENCE reply.
    pub fn reply(&self) -> SequenceReply {
        let highest = self.session.slot_count() - 1;
        SequenceReply {
            session_id: self.session.id,
            sequence: self.sequence,
            slot_id: self.slot_id,
            highest_slot_id: highest,
            target_highest_slot_id: highest,
        }
    }

    /// Finishes the request with its encoded COMPOUND `reply`. The reply is
    /// kept for retransmissions if the client asked for it and it fits the
    /// negotiated cache size.
    pub fn complete(mut self, reply: Vec<u8>) {
        self.done = true;
        let cached = self.cache_this
            && reply.len() <= self.session.fore_channel.ca_maxresponsesize_cached as usize;
        self.session.finish(self.slot_id, self.sequence, cached.then_some(reply));
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.done {
            self.session.finish(self.slot_id, self.sequence, None);
        }
    }
}

impl fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("slot_id", &self.slot_id)
            .field("sequence", &self.sequence)
            .finish()
    }
}
