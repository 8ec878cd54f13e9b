//! NFS Mamont state - client, session and state management for an NFSv4 server
//!
//! This library implements the stateful core of an NFS version 4.0 and 4.1
//! server as defined in RFC 7530 and RFC 8881. Operation handlers (OPEN,
//! LOCK, SEQUENCE, ...) call into it to keep track of who the clients are,
//! what they hold, and whether a request is new or a retransmission.
//!
//! ## Supported Features
//!
//! - Client registration and confirmation for both SETCLIENTID (v4.0) and
//!   EXCHANGE_ID/CREATE_SESSION (v4.1)
//! - Leases with a background sweeper and optional courtesy period
//! - Exactly-once semantics through owner seqids (v4.0) and session slots (v4.1)
//! - Stateids for opens, byte-range locks, delegations, layouts and copies
//! - Share reservations, read/write delegations and asynchronous recall
//! - Byte-range locking
//! - Grace period and reclaim after restart, with an in-memory or sled backed
//!   recovery store
//!
//! ## Main Components
//!
//! - `state`: the [`state::StateHandler`] registry and everything it owns.
//!
//! - `config`: [`config::StateHandlerConfig`], lease times, session limits and
//!   the recovery store backend.
//!
//! - `protocol`: XDR types of NFSv4 the state layer works with, with their
//!   encoding and decoding.
//!
//! ## Standards Compliance
//!
//! This implementation follows these RFCs:
//! - RFC 7530: Network File System (NFS) Version 4 Protocol
//! - RFC 8881: Network File System (NFS) Version 4 Minor Version 1 Protocol
//! - RFC 4506: XDR: External Data Representation Standard
//!
//! ## Usage
//!
//! Create a [`state::StateHandler`] from a configuration, call
//! [`state::StateHandler::start`] inside a tokio runtime to run the lease
//! sweeper, and share the handler with every request context.

pub mod config;
pub mod protocol;
pub mod state;

pub use protocol::xdr;
