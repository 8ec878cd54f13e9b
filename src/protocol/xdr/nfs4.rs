//! XDR data types and constants of NFS version 4.0 (RFC 7530/7531) and
//! version 4.1 (RFC 8881) that the state management layer shares with the
//! message codec.
//!
//! Only the structures whose byte layout the state layer owns are defined
//! here: the stateid, the session id, channel attributes and the client
//! owner, together with the status codes and the share/lock/delegation
//! constants the state machine consults.

// Allow unused code since the constant tables mirror the RFC
#![allow(dead_code)]
// Preserve original RFC naming conventions for consistency with RFC 7530 and RFC 8881
#![allow(non_camel_case_types)]

use std::fmt;
use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::{Deserialize, DeserializeEnum, Serialize, SerializeEnum};
use crate::{DeserializeStruct, SerializeStruct};

/// The RPC program number shared by all NFS versions.
pub const PROGRAM: u32 = 100003;
/// The version number of the NFSv4 protocol family.
pub const VERSION: u32 = 4;

/// Size of the opaque part of a stateid.
pub const NFS4_OTHER_SIZE: usize = 12;
/// Size of a session id.
pub const NFS4_SESSIONID_SIZE: usize = 16;
/// Size of the boot/confirm verifiers.
pub const NFS4_VERIFIER_SIZE: usize = 8;

pub type clientid4 = u64;
pub type seqid4 = u32;
pub type sequenceid4 = u32;
pub type slotid4 = u32;
pub type verifier4 = [u8; NFS4_VERIFIER_SIZE];
pub type sessionid4 = [u8; NFS4_SESSIONID_SIZE];

// Share reservations, RFC 8881 section 18.16.
pub const OPEN4_SHARE_ACCESS_READ: u32 = 0x0000_0001;
pub const OPEN4_SHARE_ACCESS_WRITE: u32 = 0x0000_0002;
pub const OPEN4_SHARE_ACCESS_BOTH: u32 = 0x0000_0003;

pub const OPEN4_SHARE_DENY_NONE: u32 = 0x0000_0000;
pub const OPEN4_SHARE_DENY_READ: u32 = 0x0000_0001;
pub const OPEN4_SHARE_DENY_WRITE: u32 = 0x0000_0002;
pub const OPEN4_SHARE_DENY_BOTH: u32 = 0x0000_0003;

/// Bits of `share_access` carrying the delegation "want" (NFSv4.1).
pub const OPEN4_SHARE_ACCESS_WANT_DELEG_MASK: u32 = 0x0000_FF00;
pub const OPEN4_SHARE_ACCESS_WANT_NO_PREFERENCE: u32 = 0x0000_0000;
pub const OPEN4_SHARE_ACCESS_WANT_READ_DELEG: u32 = 0x0000_0100;
pub const OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG: u32 = 0x0000_0200;
pub const OPEN4_SHARE_ACCESS_WANT_ANY_DELEG: u32 = 0x0000_0300;
pub const OPEN4_SHARE_ACCESS_WANT_NO_DELEG: u32 = 0x0000_0400;
pub const OPEN4_SHARE_ACCESS_WANT_CANCEL: u32 = 0x0000_0500;

// CREATE_SESSION flags, RFC 8881 section 18.36.
pub const CREATE_SESSION4_FLAG_PERSIST: u32 = 0x0000_0001;
pub const CREATE_SESSION4_FLAG_CONN_BACK_CHAN: u32 = 0x0000_0002;
pub const CREATE_SESSION4_FLAG_CONN_RDMA: u32 = 0x0000_0004;

// SEQUENCE status flags, RFC 8881 section 18.46.
pub const SEQ4_STATUS_CB_PATH_DOWN: u32 = 0x0000_0001;
pub const SEQ4_STATUS_EXPIRED_ALL_STATE_REVOKED: u32 = 0x0000_0004;
pub const SEQ4_STATUS_RECALLABLE_STATE_REVOKED: u32 = 0x0000_0040;
pub const SEQ4_STATUS_RESTART_RECLAIM_NEEDED: u32 = 0x0000_0100;
pub const SEQ4_STATUS_CB_PATH_DOWN_SESSION: u32 = 0x0000_0200;

/// Status codes of NFSv4.0 and NFSv4.1 operations.
///
/// Used as the error type of every state layer operation, the same way the
/// file system layer reports failures with its status enum.
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfsstat4 {
    #[default]
    NFS4_OK = 0,
    NFS4ERR_PERM = 1,
    NFS4ERR_NOENT = 2,
    NFS4ERR_IO = 5,
    NFS4ERR_NXIO = 6,
    NFS4ERR_ACCESS = 13,
    NFS4ERR_EXIST = 17,
    NFS4ERR_NOTDIR = 20,
    NFS4ERR_ISDIR = 21,
    /// Invalid argument, e.g. an illegal downgrade target.
    NFS4ERR_INVAL = 22,
    NFS4ERR_STALE = 70,
    NFS4ERR_BADHANDLE = 10001,
    NFS4ERR_NOTSUPP = 10004,
    NFS4ERR_SERVERFAULT = 10006,
    /// The operation must be retried later, e.g. a delegation recall is pending.
    NFS4ERR_DELAY = 10008,
    /// A conflicting byte-range lock is held.
    NFS4ERR_DENIED = 10010,
    /// The client's lease has expired.
    NFS4ERR_EXPIRED = 10011,
    NFS4ERR_LOCKED = 10012,
    /// The server is in its grace period and only accepts reclaims.
    NFS4ERR_GRACE = 10013,
    /// A conflicting share reservation is held.
    NFS4ERR_SHARE_DENIED = 10015,
    NFS4ERR_CLID_INUSE = 10017,
    NFS4ERR_RESOURCE = 10018,
    NFS4ERR_MOVED = 10019,
    NFS4ERR_NOFILEHANDLE = 10020,
    NFS4ERR_MINOR_VERS_MISMATCH = 10021,
    /// The client id is unknown or was issued by another server instance.
    NFS4ERR_STALE_CLIENTID = 10022,
    /// The stateid was issued by another server instance or incarnation.
    NFS4ERR_STALE_STATEID = 10023,
    /// The stateid refers to a superseded seqid.
    NFS4ERR_OLD_STATEID = 10024,
    /// The stateid is malformed, of the wrong type or unknown.
    NFS4ERR_BAD_STATEID = 10025,
    /// The owner seqid is out of order.
    NFS4ERR_BAD_SEQID = 10026,
    NFS4ERR_LOCK_RANGE = 10028,
    /// A reclaim was attempted outside of the grace period.
    NFS4ERR_NO_GRACE = 10033,
    /// The reclaim does not refer to state known before the restart.
    NFS4ERR_RECLAIM_BAD = 10034,
    NFS4ERR_RECLAIM_CONFLICT = 10035,
    NFS4ERR_BADXDR = 10036,
    /// The owner still holds state and cannot be released.
    NFS4ERR_LOCKS_HELD = 10037,
    NFS4ERR_OPENMODE = 10038,
    NFS4ERR_BAD_RANGE = 10042,
    NFS4ERR_ADMIN_REVOKED = 10047,
    NFS4ERR_CB_PATH_DOWN = 10048,
    /// The session id is unknown.
    NFS4ERR_BADSESSION = 10052,
    /// The slot id is outside of the session's slot table.
    NFS4ERR_BADSLOT = 10053,
    NFS4ERR_COMPLETE_ALREADY = 10054,
    /// A session scoped request arrived on a connection not bound to the session.
    NFS4ERR_CONN_NOT_BOUND_TO_SESSION = 10055,
    /// The slot or create-session sequence is neither a replay nor the next value.
    NFS4ERR_SEQ_MISORDERED = 10063,
    NFS4ERR_SEQUENCE_POS = 10064,
    NFS4ERR_REQ_TOO_BIG = 10065,
    NFS4ERR_REP_TOO_BIG = 10066,
    NFS4ERR_REP_TOO_BIG_TO_CACHE = 10067,
    /// A retransmission arrived for a reply that was not cached.
    NFS4ERR_RETRY_UNCACHED_REP = 10068,
    NFS4ERR_TOO_MANY_OPS = 10070,
    NFS4ERR_OP_NOT_IN_SESSION = 10071,
    NFS4ERR_CLIENTID_BUSY = 10074,
    NFS4ERR_SEQ_FALSE_RETRY = 10076,
    NFS4ERR_BAD_HIGH_SLOT = 10077,
    NFS4ERR_DEADSESSION = 10078,
    NFS4ERR_WRONG_TYPE = 10083,
    NFS4ERR_DELEG_REVOKED = 10087,
}
impl SerializeEnum for nfsstat4 {}
impl DeserializeEnum for nfsstat4 {}

impl nfsstat4 {
    /// Whether an NFSv4.0 owner seqid advances after a request that ended
    /// with this status (RFC 7530 section 9.1.7).
    pub fn bumps_seqid(self) -> bool {
        !matches!(
            self,
            nfsstat4::NFS4ERR_STALE_CLIENTID
                | nfsstat4::NFS4ERR_STALE_STATEID
                | nfsstat4::NFS4ERR_BAD_STATEID
                | nfsstat4::NFS4ERR_BAD_SEQID
                | nfsstat4::NFS4ERR_BADXDR
                | nfsstat4::NFS4ERR_RESOURCE
                | nfsstat4::NFS4ERR_NOFILEHANDLE
                | nfsstat4::NFS4ERR_MOVED
        )
    }
}

impl fmt::Display for nfsstat4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for nfsstat4 {}

/// Delegation types returned by OPEN.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum open_delegation_type4 {
    #[default]
    OPEN_DELEGATE_NONE = 0,
    OPEN_DELEGATE_READ = 1,
    OPEN_DELEGATE_WRITE = 2,
    OPEN_DELEGATE_NONE_EXT = 3,
}
impl SerializeEnum for open_delegation_type4 {}
impl DeserializeEnum for open_delegation_type4 {}

/// Byte-range lock types.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfs_lock_type4 {
    #[default]
    READ_LT = 1,
    WRITE_LT = 2,
    /// Blocking read lock
    READW_LT = 3,
    /// Blocking write lock
    WRITEW_LT = 4,
}
impl SerializeEnum for nfs_lock_type4 {}
impl DeserializeEnum for nfs_lock_type4 {}

impl nfs_lock_type4 {
    pub fn is_write(self) -> bool {
        matches!(self, nfs_lock_type4::WRITE_LT | nfs_lock_type4::WRITEW_LT)
    }
}

/// Channel directions a client asks for in BIND_CONN_TO_SESSION.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum channel_dir_from_client4 {
    #[default]
    CDFC4_FORE = 0x1,
    CDFC4_BACK = 0x2,
    CDFC4_FORE_OR_BOTH = 0x3,
    CDFC4_BACK_OR_BOTH = 0x7,
}
impl SerializeEnum for channel_dir_from_client4 {}
impl DeserializeEnum for channel_dir_from_client4 {}

/// Channel directions the server actually bound.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum channel_dir_from_server4 {
    #[default]
    CDFS4_FORE = 0x1,
    CDFS4_BACK = 0x2,
    CDFS4_BOTH = 0x3,
}
impl SerializeEnum for channel_dir_from_server4 {}
impl DeserializeEnum for channel_dir_from_server4 {}

/// The stateid: a 4-byte sequence number followed by a 12-byte opaque
/// identifier. Encodes to exactly 16 bytes.
///
/// ```text
/// struct stateid4 {
///     uint32_t        seqid;
///     opaque          other[NFS4_OTHER_SIZE];
/// };
/// ```
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct stateid4 {
    pub seqid: seqid4,
    pub other: [u8; NFS4_OTHER_SIZE],
}
DeserializeStruct!(stateid4, seqid, other);
SerializeStruct!(stateid4, seqid, other);

impl stateid4 {
    pub const fn new(seqid: seqid4, other: [u8; NFS4_OTHER_SIZE]) -> Self {
        Self { seqid, other }
    }
}

impl fmt::Display for stateid4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:", self.seqid)?;
        for b in self.other {
            write!(f, "{b:02x}")?;
        }
        write!(f, "]")
    }
}

/// Fore and back channel attributes negotiated by CREATE_SESSION.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct channel_attrs4 {
    pub ca_headerpadsize: u32,
    pub ca_maxrequestsize: u32,
    pub ca_maxresponsesize: u32,
    pub ca_maxresponsesize_cached: u32,
    pub ca_maxoperations: u32,
    pub ca_maxrequests: u32,
    pub ca_rdma_ird: Vec<u32>,
}
DeserializeStruct!(
    channel_attrs4,
    ca_headerpadsize,
    ca_maxrequestsize,
    ca_maxresponsesize,
    ca_maxresponsesize_cached,
    ca_maxoperations,
    ca_maxrequests,
    ca_rdma_ird
);
SerializeStruct!(
    channel_attrs4,
    ca_headerpadsize,
    ca_maxrequestsize,
    ca_maxresponsesize,
    ca_maxresponsesize_cached,
    ca_maxoperations,
    ca_maxrequests,
    ca_rdma_ird
);

/// Client-supplied identity: boot verifier plus opaque owner bytes.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct client_owner4 {
    pub co_verifier: verifier4,
    pub co_ownerid: Vec<u8>,
}
DeserializeStruct!(client_owner4, co_verifier, co_ownerid);
SerializeStruct!(client_owner4, co_verifier, co_ownerid);
