use std::path::Path;

use anyhow::{anyhow, Context as _};
use tracing::{debug, error, info};

use super::{ClientRecoveryStore, GraceWindow};
use crate::protocol::xdr::nfs4::nfsstat4;

const CLIENTS_TREE: &str = "clients";
const GENERATION_KEY: &[u8] = b"boot-generation";

/// Recovery store persisted in a sled embedded database.
///
/// Every open bumps a persistent boot generation. Client records are keyed
/// by the raw owner bytes and hold the generation in which they were written
/// or last reclaimed, so records written by an earlier generation are exactly
/// the clients known before the restart.
pub struct SledClientRecoveryStore {
    db: sled::Db,
    clients: sled::Tree,
    generation: u64,
    grace: GraceWindow,
}

fn decode_generation(value: &[u8]) -> anyhow::Result<u64> {
    let bytes: [u8; 8] =
        value.try_into().map_err(|_| anyhow!("corrupted generation of {} bytes", value.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl SledClientRecoveryStore {
    /// Opens (or creates) the database at `path` and starts a new incarnation.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("unable to open recovery store at {}", path.display()))?;
        let clients = db.open_tree(CLIENTS_TREE).context("unable to open clients tree")?;

        let previous_generation = match db.get(GENERATION_KEY)? {
            Some(value) => decode_generation(&value)?,
            None => 0,
        };
        let generation = previous_generation + 1;
        db.insert(GENERATION_KEY, &generation.to_be_bytes()[..])?;

        let mut previous = Vec::new();
        for entry in clients.iter() {
            let (owner, value) = entry.context("unable to scan clients tree")?;
            if decode_generation(&value)? < generation {
                previous.push(owner.to_vec());
            }
        }
        db.flush().context("unable to flush recovery store")?;

        info!(
            "recovery store at {} opened, generation {}, {} client(s) may reclaim",
            path.display(),
            generation,
            previous.len()
        );
        Ok(Self {
            db,
            clients,
            generation,
            grace: GraceWindow::new(previous),
        })
    }

    /// Boot generation of this incarnation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&self, owner: &[u8]) -> anyhow::Result<()> {
        self.clients.insert(owner, &self.generation.to_be_bytes()[..])?;
        self.clients.flush()?;
        Ok(())
    }
}

impl ClientRecoveryStore for SledClientRecoveryStore {
    fn add_client(&self, owner: &[u8]) -> anyhow::Result<()> {
        debug!("recording client {:?}", String::from_utf8_lossy(owner));
        self.touch(owner).context("unable to record client")
    }

    fn remove_client(&self, owner: &[u8]) -> anyhow::Result<()> {
        self.grace.forget(owner);
        self.clients.remove(owner).context("unable to remove client record")?;
        self.clients.flush()?;
        Ok(())
    }

    fn want_reclaim(&self, owner: &[u8]) -> Result<(), nfsstat4> {
        self.grace.want_reclaim(owner)?;
        self.touch(owner).map_err(|e| {
            error!("unable to update reclaim record: {:?}", e);
            nfsstat4::NFS4ERR_SERVERFAULT
        })
    }

    fn reclaim_complete(&self) -> anyhow::Result<()> {
        let stale = self.grace.close();
        for owner in &stale {
            // A record re-added in this generation belongs to a new client.
            if let Some(value) = self.clients.get(owner)? {
                if decode_generation(&value)? < self.generation {
                    self.clients.remove(owner)?;
                }
            }
        }
        self.clients.flush()?;
        info!("grace period closed, {} stale record(s) dropped", stale.len());
        Ok(())
    }

    fn waiting_for_reclaim(&self) -> bool {
        self.grace.waiting()
    }

    fn in_grace(&self) -> bool {
        self.grace.is_open()
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.db.flush().context("unable to flush recovery store")?;
        Ok(())
    }
}
