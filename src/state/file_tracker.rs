//! Per-file open and delegation bookkeeping.
//!
//! Every OPEN registers a share reservation (access and deny bits) of its
//! open-owner on the file. A new open is refused with
//! `NFS4ERR_SHARE_DENIED` when its access collides with another owner's deny
//! bits or vice versa. Repeated opens by the same owner are merged into one
//! record and one stateid.
//!
//! The tracker also hands out delegations and recalls them when an open by
//! another client conflicts. A recall runs asynchronously; the conflicting
//! open fails with `NFS4ERR_DELAY` until the delegation is returned.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::client::NFS4Client;
use super::nfs4_state::NFS4State;
use super::owner::StateOwner;
use super::Inode;
use crate::protocol::xdr::nfs4::{
    clientid4, nfsstat4, open_delegation_type4, stateid4,
    OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_ACCESS_WANT_ANY_DELEG,
    OPEN4_SHARE_ACCESS_WANT_CANCEL, OPEN4_SHARE_ACCESS_WANT_DELEG_MASK,
    OPEN4_SHARE_ACCESS_WANT_NO_DELEG, OPEN4_SHARE_ACCESS_WANT_NO_PREFERENCE,
    OPEN4_SHARE_ACCESS_WANT_READ_DELEG, OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG,
    OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_BOTH, OPEN4_SHARE_DENY_READ,
};

/// Bits of `share_access` above the want field; flags this server ignores.
const SHARE_ACCESS_FLAGS_MASK: u32 = 0xFFFF_0000;

/// Result of a successful open.
#[derive(Clone, Debug)]
pub struct OpenResult {
    pub state: Arc<NFS4State>,
    /// Open stateid, with the seqid bumped if the open was merged
    pub stateid: stateid4,
    /// Access bits of the owner's open after merging
    pub share_access: u32,
    /// Deny bits of the owner's open after merging
    pub share_deny: u32,
    pub delegation: Option<DelegationGrant>,
}

/// A delegation handed out with an open.
#[derive(Clone, Debug)]
pub struct DelegationGrant {
    pub state: Arc<NFS4State>,
    pub stateid: stateid4,
    pub delegation_type: open_delegation_type4,
}

/// Snapshot of the delegation on a file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DelegationInfo {
    pub client_id: clientid4,
    pub stateid: stateid4,
    pub delegation_type: open_delegation_type4,
    /// Whether a recall has been sent
    pub recalling: bool,
}

struct OpenRecord {
    owner: Arc<StateOwner>,
    access: u32,
    deny: u32,
    state: Arc<NFS4State>,
}

impl OpenRecord {
    fn client_id(&self) -> clientid4 {
        self.owner.client_id()
    }

    fn same_owner(&self, owner: &StateOwner) -> bool {
        self.owner.client_id() == owner.client_id() && self.owner.owner() == owner.owner()
    }
}

struct DelegationRecord {
    client: Arc<NFS4Client>,
    state: Arc<NFS4State>,
    delegation_type: open_delegation_type4,
    recalling: bool,
}

#[derive(Default)]
struct FileEntry {
    opens: SmallVec<[OpenRecord; 4]>,
    delegation: Option<DelegationRecord>,
}

impl FileEntry {
    fn is_empty(&self) -> bool {
        self.opens.is_empty() && self.delegation.is_none()
    }
}

/// Whether an open with `access`/`deny` by another client conflicts with a
/// delegation of type `delegation_type`.
fn conflicts_with_delegation(
    delegation_type: open_delegation_type4,
    access: u32,
    deny: u32,
) -> bool {
    match delegation_type {
        open_delegation_type4::OPEN_DELEGATE_WRITE => true,
        open_delegation_type4::OPEN_DELEGATE_READ => {
            access & OPEN4_SHARE_ACCESS_WRITE != 0 || deny & OPEN4_SHARE_DENY_READ != 0
        }
        _ => false,
    }
}

/// Splits `share_access` into access bits and the delegation want, and
/// validates both together with `share_deny`.
fn split_share_access(share_access: u32, share_deny: u32) -> Result<(u32, u32), nfsstat4> {
    let share_access = share_access & !SHARE_ACCESS_FLAGS_MASK;
    let access = share_access & !OPEN4_SHARE_ACCESS_WANT_DELEG_MASK;
    let want = share_access & OPEN4_SHARE_ACCESS_WANT_DELEG_MASK;
    if access == 0 || access & !OPEN4_SHARE_ACCESS_BOTH != 0 {
        return Err(nfsstat4::NFS4ERR_INVAL);
    }
    if share_deny & !OPEN4_SHARE_DENY_BOTH != 0 {
        return Err(nfsstat4::NFS4ERR_INVAL);
    }
    match want {
        OPEN4_SHARE_ACCESS_WANT_NO_PREFERENCE
        | OPEN4_SHARE_ACCESS_WANT_READ_DELEG
        | OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG
        | OPEN4_SHARE_ACCESS_WANT_ANY_DELEG
        | OPEN4_SHARE_ACCESS_WANT_NO_DELEG
        | OPEN4_SHARE_ACCESS_WANT_CANCEL => Ok((access, want)),
        _ => Err(nfsstat4::NFS4ERR_INVAL),
    }
}

/// Open and delegation state of every file with at least one of them.
pub struct FileTracker {
    me: Weak<FileTracker>,
    files: DashMap<Inode, FileEntry>,
}

impl FileTracker {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            files: DashMap::new(),
        })
    }

    /// Registers an open of `inode` by `owner` of `client`.
    ///
    /// `share_access` may carry NFSv4.1 delegation want bits. Checks run in
    /// this order:
    ///
    /// 1. share reservations of other owners (`NFS4ERR_SHARE_DENIED`);
    /// 2. a conflicting delegation of another client is recalled, once, and
    ///    the open fails with `NFS4ERR_DELAY`;
    /// 3. an open of the same owner is merged, otherwise a new open state is
    ///    created;
    /// 4. a wanted delegation is granted if nothing stands in the way.
    pub fn add_open(
        &self,
        client: &Arc<NFS4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        share_access: u32,
        share_deny: u32,
    ) -> Result<OpenResult, nfsstat4> {
        let (access, want) = split_share_access(share_access, share_deny)?;
        self.with_entry(inode, |entry| {
            self.open_locked(entry, client, owner, inode, access, share_deny, want, false)
        })
    }

    /// Re-establishes an open held before a server restart. Share
    /// reservations and delegations are not checked; the caller is expected
    /// to have admitted the reclaim.
    pub fn reclaim_open(
        &self,
        client: &Arc<NFS4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        share_access: u32,
        share_deny: u32,
    ) -> Result<OpenResult, nfsstat4> {
        let (access, _) = split_share_access(share_access, share_deny)?;
        self.with_entry(inode, |entry| {
            self.open_locked(entry, client, owner, inode, access, share_deny, 0, true)
        })
    }

    /// Re-establishes a delegation held before a server restart.
    pub fn reclaim_delegation(
        &self,
        client: &Arc<NFS4Client>,
        inode: &Inode,
        delegation_type: open_delegation_type4,
    ) -> Result<DelegationGrant, nfsstat4> {
        if !matches!(
            delegation_type,
            open_delegation_type4::OPEN_DELEGATE_READ | open_delegation_type4::OPEN_DELEGATE_WRITE
        ) {
            return Err(nfsstat4::NFS4ERR_INVAL);
        }
        self.with_entry(inode, |entry| match &entry.delegation {
            Some(d) if d.client.id() != client.id() => Err(nfsstat4::NFS4ERR_RECLAIM_CONFLICT),
            Some(d) => Ok(DelegationGrant {
                state: d.state.clone(),
                stateid: d.state.stateid(),
                delegation_type: d.delegation_type,
            }),
            None => self.grant_delegation(entry, client, inode, delegation_type),
        })
    }

    /// Runs `f` on the entry of `inode` while holding the entry's shard lock,
    /// dropping the entry afterwards if it ended up empty.
    fn with_entry<T>(
        &self,
        inode: &Inode,
        f: impl FnOnce(&mut FileEntry) -> Result<T, nfsstat4>,
    ) -> Result<T, nfsstat4> {
        let result = {
            let mut entry = self.files.entry(inode.clone()).or_default();
            f(&mut entry)
        };
        if result.is_err() {
            self.files.remove_if(inode, |_, entry| entry.is_empty());
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn open_locked(
        &self,
        entry: &mut FileEntry,
        client: &Arc<NFS4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        access: u32,
        deny: u32,
        want: u32,
        reclaim: bool,
    ) -> Result<OpenResult, nfsstat4> {
        if !reclaim {
            let denied = entry.opens.iter().any(|open| {
                !open.same_owner(owner) && (open.deny & access != 0 || deny & open.access != 0)
            });
            if denied {
                trace!("{:?}: share access {} deny {} denied", inode, access, deny);
                return Err(nfsstat4::NFS4ERR_SHARE_DENIED);
            }

            if let Some(delegation) = entry.delegation.as_mut() {
                if delegation.client.id() != client.id()
                    && conflicts_with_delegation(delegation.delegation_type, access, deny)
                {
                    if !delegation.recalling {
                        delegation.recalling = self.recall(delegation, inode);
                    }
                    return Err(nfsstat4::NFS4ERR_DELAY);
                }
            }
        }

        let (state, stateid, share_access, share_deny) =
            match entry.opens.iter_mut().find(|open| open.same_owner(owner)) {
                Some(open) => {
                    open.access |= access;
                    open.deny |= deny;
                    let stateid = open.state.bump_seqid();
                    trace!("{:?}: merged open {}", inode, stateid);
                    (open.state.clone(), stateid, open.access, open.deny)
                }
                None => {
                    let tracker = self.me.clone();
                    let file = inode.clone();
                    let state = client.create_open_state_for(
                        owner,
                        inode,
                        Box::new(move |state: &NFS4State| {
                            if let Some(tracker) = tracker.upgrade() {
                                tracker.remove_open(&file, &state.stateid());
                            }
                        }),
                    )?;
                    entry.opens.push(OpenRecord {
                        owner: owner.clone(),
                        access,
                        deny,
                        state: state.clone(),
                    });
                    let stateid = state.stateid();
                    (state, stateid, access, deny)
                }
            };

        let delegation = match self.wanted_delegation(entry, client, access, want) {
            Some(delegation_type) => {
                Some(self.grant_delegation(entry, client, inode, delegation_type)?)
            }
            None => None,
        };

        Ok(OpenResult {
            state,
            stateid,
            share_access,
            share_deny,
            delegation,
        })
    }

    /// Decides which delegation, if any, goes with an open.
    fn wanted_delegation(
        &self,
        entry: &FileEntry,
        client: &NFS4Client,
        access: u32,
        want: u32,
    ) -> Option<open_delegation_type4> {
        let (read, write) = match want {
            OPEN4_SHARE_ACCESS_WANT_READ_DELEG => (true, false),
            OPEN4_SHARE_ACCESS_WANT_WRITE_DELEG => (false, true),
            OPEN4_SHARE_ACCESS_WANT_ANY_DELEG => (true, true),
            _ => return None,
        };
        if entry.delegation.is_some() || client.callback().is_none() {
            return None;
        }

        let others = entry.opens.iter().filter(|open| open.client_id() != client.id());
        let mut other_opens = false;
        let mut other_writers = false;
        for open in others {
            other_opens = true;
            other_writers |= open.access & OPEN4_SHARE_ACCESS_WRITE != 0;
        }

        if write && !other_opens && (!read || access & OPEN4_SHARE_ACCESS_WRITE != 0) {
            Some(open_delegation_type4::OPEN_DELEGATE_WRITE)
        } else if read && !other_writers && access & OPEN4_SHARE_ACCESS_READ != 0 {
            Some(open_delegation_type4::OPEN_DELEGATE_READ)
        } else {
            None
        }
    }

    fn grant_delegation(
        &self,
        entry: &mut FileEntry,
        client: &Arc<NFS4Client>,
        inode: &Inode,
        delegation_type: open_delegation_type4,
    ) -> Result<DelegationGrant, nfsstat4> {
        let tracker = self.me.clone();
        let file = inode.clone();
        let state = client.create_delegation_state_for(
            inode,
            Box::new(move |state: &NFS4State| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.remove_delegation(&file, &state.stateid());
                }
            }),
        )?;
        let stateid = state.stateid();
        debug!("{:?}: {:?} delegation {} to {}", inode, delegation_type, stateid, client);
        entry.delegation = Some(DelegationRecord {
            client: client.clone(),
            state: state.clone(),
            delegation_type,
            recalling: false,
        });
        Ok(DelegationGrant {
            state,
            stateid,
            delegation_type,
        })
    }

    /// Sends CB_RECALL for `delegation` on a background task. Returns
    /// `false` if the recall could not be sent; the next conflicting open
    /// tries again.
    fn recall(&self, delegation: &DelegationRecord, inode: &Inode) -> bool {
        let stateid = delegation.state.stateid();
        let Some(callback) = delegation.client.callback() else {
            warn!("{:?}: no callback path to recall {} from {}", inode, stateid, delegation.client);
            return false;
        };
        let is_write = delegation.delegation_type == open_delegation_type4::OPEN_DELEGATE_WRITE;
        let inode = inode.clone();
        let client = delegation.client.to_string();
        debug!("{:?}: recalling {} from {}", inode, stateid, client);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = callback.notify_recall(&inode, stateid, is_write).await {
                        warn!("recall of {} from {} failed: {}", stateid, client, e);
                    }
                });
                true
            }
            Err(_) => {
                error!("no runtime to recall {} from {}", stateid, client);
                false
            }
        }
    }

    /// Downgrades the open `stateid` of `client` to `share_access`/`share_deny`
    /// (OPEN_DOWNGRADE). The new bits must be a non-empty subset of the
    /// current ones, otherwise `NFS4ERR_INVAL`.
    pub fn downgrade_open(
        &self,
        client: &NFS4Client,
        inode: &Inode,
        stateid: &stateid4,
        share_access: u32,
        share_deny: u32,
    ) -> Result<stateid4, nfsstat4> {
        let mut entry = self.files.get_mut(inode).ok_or(nfsstat4::NFS4ERR_BAD_STATEID)?;
        let open = entry
            .opens
            .iter_mut()
            .find(|open| open.state.other() == stateid.other)
            .filter(|open| open.client_id() == client.id())
            .ok_or(nfsstat4::NFS4ERR_BAD_STATEID)?;
        if share_access == 0
            || share_access & !open.access != 0
            || share_deny & !open.deny != 0
        {
            return Err(nfsstat4::NFS4ERR_INVAL);
        }
        open.access = share_access;
        open.deny = share_deny;
        let stateid = open.state.bump_seqid();
        trace!(
            "{:?}: downgraded {} to access {} deny {}",
            inode,
            stateid,
            share_access,
            share_deny
        );
        Ok(stateid)
    }

    /// Drops the open record of `stateid`, if any.
    pub fn remove_open(&self, inode: &Inode, stateid: &stateid4) {
        if let Some(mut entry) = self.files.get_mut(inode) {
            entry.opens.retain(|open| open.state.other() != stateid.other);
        }
        self.files.remove_if(inode, |_, entry| entry.is_empty());
    }

    /// Access bits of the open `stateid` of `client`.
    pub fn get_share_access(
        &self,
        client: &NFS4Client,
        inode: &Inode,
        stateid: &stateid4,
    ) -> Result<u32, nfsstat4> {
        let entry = self.files.get(inode).ok_or(nfsstat4::NFS4ERR_BAD_STATEID)?;
        entry
            .opens
            .iter()
            .find(|open| open.state.other() == stateid.other && open.client_id() == client.id())
            .map(|open| open.access)
            .ok_or(nfsstat4::NFS4ERR_BAD_STATEID)
    }

    /// Drops the delegation of `inode` if `stateid` names it.
    pub fn remove_delegation(&self, inode: &Inode, stateid: &stateid4) -> bool {
        let removed = match self.files.get_mut(inode) {
            Some(mut entry) => {
                let matches =
                    entry.delegation.as_ref().is_some_and(|d| d.state.other() == stateid.other);
                if matches {
                    entry.delegation = None;
                }
                matches
            }
            None => false,
        };
        self.files.remove_if(inode, |_, entry| entry.is_empty());
        removed
    }

    /// The delegation on `inode`, if any.
    pub fn delegation(&self, inode: &Inode) -> Option<DelegationInfo> {
        let entry = self.files.get(inode)?;
        entry.delegation.as_ref().map(|d| DelegationInfo {
            client_id: d.client.id(),
            stateid: d.state.stateid(),
            delegation_type: d.delegation_type,
            recalling: d.recalling,
        })
    }

    pub fn has_delegation(&self, inode: &Inode) -> bool {
        self.files.get(inode).is_some_and(|entry| entry.delegation.is_some())
    }

    /// Number of open records on `inode`.
    pub fn open_count(&self, inode: &Inode) -> usize {
        self.files.get(inode).map_or(0, |entry| entry.opens.len())
    }

    /// Number of files with opens or delegations.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
