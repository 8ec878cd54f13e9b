#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use nfs_mamont_state::config::StateHandlerConfig;
use nfs_mamont_state::state::{
    CallbackChannel, Inode, NFS4Client, NewClient, SessionRequest, StateHandler,
};
use nfs_mamont_state::xdr::nfs4::{channel_attrs4, client_owner4, nfsstat4, stateid4};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A CB_RECALL as seen by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recall {
    pub inode: Inode,
    pub stateid: stateid4,
    pub is_write: bool,
}

/// Back channel that reports every recall on a channel.
pub struct RecordingCallback {
    recalls: mpsc::UnboundedSender<Recall>,
    status: nfsstat4,
}

#[async_trait]
impl CallbackChannel for RecordingCallback {
    async fn notify_recall(
        &self,
        inode: &Inode,
        stateid: stateid4,
        is_write: bool,
    ) -> Result<(), nfsstat4> {
        let _ = self.recalls.send(Recall {
            inode: inode.clone(),
            stateid,
            is_write,
        });
        match self.status {
            nfsstat4::NFS4_OK => Ok(()),
            status => Err(status),
        }
    }
}

pub fn recording_callback() -> (Arc<dyn CallbackChannel>, mpsc::UnboundedReceiver<Recall>) {
    failing_callback(nfsstat4::NFS4_OK)
}

/// A back channel whose recalls are delivered but answered with `status`.
pub fn failing_callback(
    status: nfsstat4,
) -> (Arc<dyn CallbackChannel>, mpsc::UnboundedReceiver<Recall>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(RecordingCallback {
            recalls: tx,
            status,
        }),
        rx,
    )
}

/// Waits for the next recall, failing the test after a second.
pub async fn next_recall(rx: &mut mpsc::UnboundedReceiver<Recall>) -> Recall {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no recall within a second")
        .expect("callback dropped")
}

pub fn test_config() -> StateHandlerConfig {
    StateHandlerConfig::default()
        .with_instance_id(7)
        .with_lease_time(Duration::from_secs(10))
        .with_grace_period(Duration::from_secs(10))
}

pub fn handler() -> Arc<StateHandler> {
    handler_with(test_config())
}

pub fn handler_with(config: StateHandlerConfig) -> Arc<StateHandler> {
    init_logging();
    StateHandler::new(config).expect("cannot create state handler")
}

/// A handler whose grace period is already over.
pub fn handler_out_of_grace() -> Arc<StateHandler> {
    handler_with(test_config().with_grace_period(Duration::ZERO))
}

pub fn new_client(
    minor_version: u32,
    owner: &str,
    callback: Option<Arc<dyn CallbackChannel>>,
) -> NewClient {
    let remote: SocketAddr = "192.0.2.10:700".parse().expect("bad address");
    let local: SocketAddr = "192.0.2.1:2049".parse().expect("bad address");
    NewClient {
        remote,
        local,
        minor_version,
        owner: client_owner4 {
            co_verifier: [1; 8],
            co_ownerid: owner.as_bytes().to_vec(),
        },
        principal: "nobody".to_string(),
        callback,
        confirmed: true,
    }
}

/// Parameters of a client that still has to be confirmed.
pub fn unconfirmed_client(minor_version: u32, owner: &str) -> NewClient {
    NewClient {
        confirmed: false,
        ..new_client(minor_version, owner, None)
    }
}

/// A confirmed NFSv4.0 client.
pub fn client_v40(handler: &StateHandler, owner: &str) -> Arc<NFS4Client> {
    handler.create_client(new_client(0, owner, None))
}

/// A confirmed NFSv4.1 client.
pub fn client_v41(
    handler: &StateHandler,
    owner: &str,
    callback: Option<Arc<dyn CallbackChannel>>,
) -> Arc<NFS4Client> {
    handler.create_client(new_client(1, owner, callback))
}

pub fn channel(max_requests: u32) -> channel_attrs4 {
    channel_attrs4 {
        ca_headerpadsize: 0,
        ca_maxrequestsize: 1024 * 1024,
        ca_maxresponsesize: 1024 * 1024,
        ca_maxresponsesize_cached: 4096,
        ca_maxoperations: 16,
        ca_maxrequests: max_requests,
        ca_rdma_ird: Vec::new(),
    }
}

pub fn session_request(sequence: u32, slots: u32) -> SessionRequest {
    SessionRequest {
        sequence,
        flags: 0,
        fore_channel: channel(slots),
        back_channel: channel(1),
        cb_program: 0x4000_0000,
    }
}

pub fn inode(name: &str) -> Inode {
    Inode::new(name.as_bytes().to_vec())
}
