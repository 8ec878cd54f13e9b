//! Protocol module holds the wire-level vocabulary of NFS version 4.0 (RFC 7530)
//! and 4.1 (RFC 8881) that the state layer shares with the message codec.
//!
//! - `xdr`: External Data Representation (XDR) for serialization and deserialization
//!   of data structures according to RFC 4506, and the NFSv4 types whose byte layout
//!   the state layer owns (`stateid4`, `sessionid4`, `channel_attrs4`, `nfsstat4`).
//!
//! Unlike version 3, NFSv4 is stateful: the server hands out stateids and
//! session ids that clients echo back byte for byte, so those encodings must
//! never change.

pub mod xdr;
