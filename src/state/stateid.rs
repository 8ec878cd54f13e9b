//! Layout of the identifiers the server hands out: client ids, stateids and
//! session ids.
//!
//! ```text
//! clientid4 (u64):  | instance id (16) | boot epoch (16) | counter (32) |
//! stateid4.other:   | clientid4 (8 bytes, BE) | type (1) | counter (3, BE) |
//! sessionid4:       | clientid4 (8 bytes, BE) | sequence (4, BE) | 0 (4) |
//! ```
//!
//! Since the owning client id is the prefix of every stateid and session id,
//! any of them can be routed back to the server instance and client that
//! issued it.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::protocol::xdr::nfs4::{
    clientid4, nfsstat4, sessionid4, stateid4, NFS4_OTHER_SIZE, NFS4_SESSIONID_SIZE,
};

/// Anonymous stateid: READ/WRITE without any state.
pub const ZERO_STATEID: stateid4 = stateid4::new(0, [0; NFS4_OTHER_SIZE]);
/// READ bypass stateid.
pub const ONE_STATEID: stateid4 = stateid4::new(u32::MAX, [0xff; NFS4_OTHER_SIZE]);
/// NFSv4.1 "current stateid" of the COMPOUND.
pub const CURRENT_STATEID: stateid4 = stateid4::new(1, [0; NFS4_OTHER_SIZE]);
/// NFSv4.1 stateid that is never valid.
pub const INVAL_STATEID: stateid4 = stateid4::new(u32::MAX, [0; NFS4_OTHER_SIZE]);

/// Largest per-client counter that fits in a stateid.
pub const MAX_STATE_COUNTER: u32 = 0x00ff_ffff;

const TYPE_OFFSET: usize = 8;

/// The kind of state a stateid names. The discriminant is the tag byte
/// stored in the stateid.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum StateType {
    Invalid = 0,
    Open = 1,
    Lock = 2,
    Delegation = 4,
    Layout = 8,
    ServerSideCopy = 16,
}

/// Fields recovered from a stateid's opaque part.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodedStateid {
    pub state_type: StateType,
    pub client_id: clientid4,
    pub instance_id: u16,
    pub counter: u32,
}

/// Builds a client id.
pub fn make_client_id(instance_id: u16, boot_epoch: u16, counter: u32) -> clientid4 {
    (u64::from(instance_id) << 48) | (u64::from(boot_epoch) << 32) | u64::from(counter)
}

/// Instance id embedded in a client id.
pub fn client_id_instance(client_id: clientid4) -> u16 {
    (client_id >> 48) as u16
}

/// Boot epoch embedded in a client id.
pub fn client_id_epoch(client_id: clientid4) -> u16 {
    (client_id >> 32) as u16
}

/// Per-incarnation counter embedded in a client id.
pub fn client_id_counter(client_id: clientid4) -> u32 {
    client_id as u32
}

/// Boot epoch and client counter base of a server incarnation started
/// `boot_secs` seconds after the Unix epoch.
///
/// The epoch keeps the low 16 bits of the boot time and the counter base
/// the next 16, so incarnations whose epochs collide still hand out
/// distinct client ids.
pub fn incarnation(boot_secs: u64) -> (u16, u32) {
    (boot_secs as u16, u32::from((boot_secs >> 16) as u16) << 16)
}

/// Builds a fresh stateid (seqid 1) of `state_type` owned by `client_id`.
///
/// `counter` must be in `1..=MAX_STATE_COUNTER`.
pub fn encode(state_type: StateType, client_id: clientid4, counter: u32) -> stateid4 {
    debug_assert!(counter != 0 && counter <= MAX_STATE_COUNTER);
    let mut other = [0u8; NFS4_OTHER_SIZE];
    other[..TYPE_OFFSET].copy_from_slice(&client_id.to_be_bytes());
    other[TYPE_OFFSET] = state_type as u8;
    other[TYPE_OFFSET + 1..].copy_from_slice(&counter.to_be_bytes()[1..]);
    stateid4::new(1, other)
}

/// Splits a stateid into its fields. An unknown tag decodes as
/// [`StateType::Invalid`].
pub fn decode(stateid: &stateid4) -> DecodedStateid {
    let client_id = client_id_of(stateid);
    let state_type =
        StateType::from_u8(stateid.other[TYPE_OFFSET]).unwrap_or(StateType::Invalid);
    let mut counter = [0u8; 4];
    counter[1..].copy_from_slice(&stateid.other[TYPE_OFFSET + 1..]);
    DecodedStateid {
        state_type,
        client_id,
        instance_id: client_id_instance(client_id),
        counter: u32::from_be_bytes(counter),
    }
}

/// The client id prefix of a stateid.
pub fn client_id_of(stateid: &stateid4) -> clientid4 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&stateid.other[..TYPE_OFFSET]);
    u64::from_be_bytes(id)
}

/// Whether `stateid` is one of the special stateids that carry no state.
pub fn is_stateless(stateid: &stateid4) -> bool {
    *stateid == ZERO_STATEID || *stateid == ONE_STATEID
}

/// Validates that `stateid` was issued by instance `instance_id` and names
/// state of `expected` type.
pub fn check_type(
    stateid: &stateid4,
    expected: StateType,
    instance_id: u16,
) -> Result<DecodedStateid, nfsstat4> {
    if is_stateless(stateid) {
        return Err(nfsstat4::NFS4ERR_BAD_STATEID);
    }
    let decoded = decode(stateid);
    if decoded.instance_id != instance_id {
        return Err(nfsstat4::NFS4ERR_STALE_STATEID);
    }
    if decoded.state_type != expected || decoded.counter == 0 {
        return Err(nfsstat4::NFS4ERR_BAD_STATEID);
    }
    Ok(decoded)
}

/// Compares the seqid a client supplied with the current one of the state.
///
/// In NFSv4.1 a zero seqid means "whatever is current". Otherwise an older
/// seqid is `NFS4ERR_OLD_STATEID` and a newer one `NFS4ERR_BAD_STATEID`.
pub fn check_seqid(
    current: &stateid4,
    supplied: &stateid4,
    minor_version: u32,
) -> Result<(), nfsstat4> {
    if supplied.seqid == 0 && minor_version > 0 {
        return Ok(());
    }
    if supplied.seqid == current.seqid {
        return Ok(());
    }
    // seqids wrap and skip zero; "older" is judged on the signed distance
    if (current.seqid.wrapping_sub(supplied.seqid) as i32) > 0 {
        Err(nfsstat4::NFS4ERR_OLD_STATEID)
    } else {
        Err(nfsstat4::NFS4ERR_BAD_STATEID)
    }
}

/// Next stateid seqid; zero is reserved and skipped on wrap.
pub fn bump_seqid(seqid: u32) -> u32 {
    match seqid.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Builds the session id of the session created by `client_id` with
/// CREATE_SESSION sequence `sequence`.
pub fn make_session_id(client_id: clientid4, sequence: u32) -> sessionid4 {
    let mut id = [0u8; NFS4_SESSIONID_SIZE];
    id[..8].copy_from_slice(&client_id.to_be_bytes());
    id[8..12].copy_from_slice(&sequence.to_be_bytes());
    id
}

/// The client id prefix of a session id.
pub fn client_id_of_session(session_id: &sessionid4) -> clientid4 {
    let mut id = [0u8; 8];
    id.copy_from_slice(&session_id[..8]);
    u64::from_be_bytes(id)
}
