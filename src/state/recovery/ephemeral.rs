use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::debug;

use super::{ClientRecoveryStore, GraceWindow};
use crate::protocol::xdr::nfs4::nfsstat4;

/// In-memory recovery store for deployments without durable state.
///
/// A fresh process never knows any client from before, so every reclaim is
/// rejected: with `NFS4ERR_RECLAIM_BAD` during the grace window and with
/// `NFS4ERR_NO_GRACE` after it.
#[derive(Debug)]
pub struct EphemeralClientRecoveryStore {
    clients: Mutex<HashSet<Vec<u8>>>,
    grace: GraceWindow,
}

impl EphemeralClientRecoveryStore {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashSet::new()),
            grace: GraceWindow::new(Vec::new()),
        }
    }

    /// Number of recorded clients.
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl Default for EphemeralClientRecoveryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRecoveryStore for EphemeralClientRecoveryStore {
    fn add_client(&self, owner: &[u8]) -> anyhow::Result<()> {
        debug!("recording client {:?}", String::from_utf8_lossy(owner));
        self.clients.lock().insert(owner.to_vec());
        Ok(())
    }

    fn remove_client(&self, owner: &[u8]) -> anyhow::Result<()> {
        self.clients.lock().remove(owner);
        self.grace.forget(owner);
        Ok(())
    }

    fn want_reclaim(&self, owner: &[u8]) -> Result<(), nfsstat4> {
        self.grace.want_reclaim(owner)
    }

    fn reclaim_complete(&self) -> anyhow::Result<()> {
        self.grace.close();
        Ok(())
    }

    fn waiting_for_reclaim(&self) -> bool {
        self.grace.waiting()
    }

    fn in_grace(&self) -> bool {
        self.grace.is_open()
    }

    fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
