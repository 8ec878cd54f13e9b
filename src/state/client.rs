//! A client known to the server.
//!
//! The client owns everything the server keeps on its behalf: the open and
//! lock owners, all stateids, and (for NFSv4.1) its sessions. Disposing the
//! client disposes all of it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::callback::CallbackChannel;
use super::nfs4_state::{DisposeListener, NFS4State};
use super::owner::StateOwner;
use super::session::{ConnectionId, NFSv41Session, SessionRequest};
use super::stateid::{self, StateType, MAX_STATE_COUNTER};
use super::Inode;
use crate::config::SessionLimits;
use crate::protocol::xdr::nfs4::{
    client_owner4, clientid4, nfsstat4, seqid4, sessionid4, stateid4, verifier4,
    NFS4_OTHER_SIZE,
};

/// Parameters of a new client (SETCLIENTID or EXCHANGE_ID).
#[derive(Clone)]
pub struct NewClient {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub minor_version: u32,
    /// Client supplied owner id and boot verifier
    pub owner: client_owner4,
    /// Authenticated principal of the request that created the client
    pub principal: String,
    pub callback: Option<Arc<dyn CallbackChannel>>,
    /// Create the client already confirmed
    pub confirmed: bool,
}

impl fmt::Debug for NewClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewClient")
            .field("remote", &self.remote)
            .field("minor_version", &self.minor_version)
            .field("owner", &String::from_utf8_lossy(&self.owner.co_ownerid))
            .field("callback", &self.callback.is_some())
            .field("confirmed", &self.confirmed)
            .finish()
    }
}

#[derive(Default)]
struct ClientInner {
    owners: HashMap<Vec<u8>, Arc<StateOwner>>,
    /// Owner used for state that belongs to the client itself
    /// (delegations, layouts, copies)
    client_owner: Option<Arc<StateOwner>>,
    states: HashMap<[u8; NFS4_OTHER_SIZE], Arc<NFS4State>>,
    state_counter: u32,
    sessions: HashMap<sessionid4, Arc<NFSv41Session>>,
    /// Sequence id of the last CREATE_SESSION and the session it produced
    session_sequence: u32,
    last_session: Option<Arc<NFSv41Session>>,
    disposed: bool,
}

/// A client of the server.
pub struct NFS4Client {
    id: clientid4,
    owner: Vec<u8>,
    verifier: verifier4,
    confirm_verifier: verifier4,
    principal: String,
    remote: SocketAddr,
    local: SocketAddr,
    minor_version: u32,
    lease_time: Duration,
    courtesy_period: Duration,
    confirmed: AtomicBool,
    reclaim_completed: AtomicBool,
    lease_expiry: Mutex<Instant>,
    callback: Mutex<Option<Arc<dyn CallbackChannel>>>,
    inner: Mutex<ClientInner>,
}

impl NFS4Client {
    pub(crate) fn new(
        id: clientid4,
        params: NewClient,
        confirm_verifier: verifier4,
        lease_time: Duration,
        courtesy_period: Duration,
    ) -> Self {
        Self {
            id,
            owner: params.owner.co_ownerid,
            verifier: params.owner.co_verifier,
            confirm_verifier,
            principal: params.principal,
            remote: params.remote,
            local: params.local,
            minor_version: params.minor_version,
            lease_time,
            courtesy_period,
            confirmed: AtomicBool::new(false),
            reclaim_completed: AtomicBool::new(false),
            lease_expiry: Mutex::new(Instant::now() + lease_time),
            callback: Mutex::new(params.callback),
            inner: Mutex::new(ClientInner::default()),
        }
    }

    pub fn id(&self) -> clientid4 {
        self.id
    }

    /// The client's opaque owner id.
    pub fn owner(&self) -> &[u8] {
        &self.owner
    }

    /// Boot verifier the client supplied.
    pub fn verifier(&self) -> &verifier4 {
        &self.verifier
    }

    /// Verifier the server handed out with the client id; SETCLIENTID_CONFIRM
    /// must present it.
    pub fn confirm_verifier(&self) -> &verifier4 {
        &self.confirm_verifier
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn minor_version(&self) -> u32 {
        self.minor_version
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::Acquire)
    }

    pub(crate) fn set_confirmed(&self) -> bool {
        !self.confirmed.swap(true, Ordering::AcqRel)
    }

    pub fn callback(&self) -> Option<Arc<dyn CallbackChannel>> {
        self.callback.lock().clone()
    }

    /// Installs or replaces the back channel.
    pub fn set_callback(&self, callback: Option<Arc<dyn CallbackChannel>>) {
        *self.callback.lock() = callback;
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// The instant the lease runs out.
    pub fn lease_expiry(&self) -> Instant {
        *self.lease_expiry.lock()
    }

    /// A lease is valid up to and including its expiry instant.
    pub fn is_lease_valid(&self) -> bool {
        Instant::now() <= *self.lease_expiry.lock()
    }

    /// Renews the lease.
    ///
    /// An expired lease can only be renewed while the client is kept as a
    /// courtesy client; otherwise this fails with `NFS4ERR_EXPIRED`.
    pub fn update_lease_time(&self) -> Result<(), nfsstat4> {
        let now = Instant::now();
        let mut expiry = self.lease_expiry.lock();
        if now > *expiry + self.courtesy_period || self.inner.lock().disposed {
            return Err(nfsstat4::NFS4ERR_EXPIRED);
        }
        *expiry = now + self.lease_time;
        Ok(())
    }

    /// Whether the sweeper may reap this client at `now`: the lease expired
    /// and the courtesy period is over, or the client holds no state at all.
    pub(crate) fn is_reapable(&self, now: Instant) -> bool {
        let expiry = *self.lease_expiry.lock();
        if now <= expiry {
            return false;
        }
        now > expiry + self.courtesy_period || !self.has_state()
    }

    /// Records RECLAIM_COMPLETE. A second call fails with
    /// `NFS4ERR_COMPLETE_ALREADY`.
    pub fn reclaim_complete(&self) -> Result<(), nfsstat4> {
        if self.reclaim_completed.swap(true, Ordering::AcqRel) {
            return Err(nfsstat4::NFS4ERR_COMPLETE_ALREADY);
        }
        Ok(())
    }

    pub fn is_reclaim_completed(&self) -> bool {
        self.reclaim_completed.load(Ordering::Acquire)
    }

    /// Looks up or creates the open/lock owner `owner`. NFSv4.0 owners are
    /// sequenced starting at `initial_seq`.
    pub fn get_or_create_owner(&self, owner: &[u8], initial_seq: seqid4) -> Arc<StateOwner> {
        let mut inner = self.inner.lock();
        inner
            .owners
            .entry(owner.to_vec())
            .or_insert_with(|| {
                trace!("client {:016x}: new owner {:?}", self.id, owner);
                Arc::new(if self.minor_version == 0 {
                    StateOwner::sequenced(self.id, owner.to_vec(), initial_seq)
                } else {
                    StateOwner::unsequenced(self.id, owner.to_vec())
                })
            })
            .clone()
    }

    /// Looks up an existing owner.
    pub fn owner_by_name(&self, owner: &[u8]) -> Option<Arc<StateOwner>> {
        self.inner.lock().owners.get(owner).cloned()
    }

    /// The owner of state held by the client as a whole.
    pub fn as_state_owner(&self) -> Arc<StateOwner> {
        let mut inner = self.inner.lock();
        inner
            .client_owner
            .get_or_insert_with(|| Arc::new(StateOwner::unsequenced(self.id, self.owner.clone())))
            .clone()
    }

    /// Releases the owner `owner` (RELEASE_LOCKOWNER). Fails with
    /// `NFS4ERR_LOCKS_HELD` while it holds state; an unknown owner is fine.
    pub fn release_owner(&self, owner: &[u8]) -> Result<(), nfsstat4> {
        let mut inner = self.inner.lock();
        match inner.owners.get(owner) {
            Some(o) if o.has_states() => Err(nfsstat4::NFS4ERR_LOCKS_HELD),
            Some(_) => {
                inner.owners.remove(owner);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Adds a state to the client. `listener` is in place before the state
    /// becomes visible, so a concurrent dispose of the client always runs it.
    fn insert_state(
        &self,
        inner: &mut ClientInner,
        state_type: StateType,
        owner: &Arc<StateOwner>,
        parent: Option<[u8; NFS4_OTHER_SIZE]>,
        file: Option<Inode>,
        listener: Option<DisposeListener>,
    ) -> Result<Arc<NFS4State>, nfsstat4> {
        if inner.disposed {
            return Err(nfsstat4::NFS4ERR_EXPIRED);
        }
        if inner.state_counter >= MAX_STATE_COUNTER {
            return Err(nfsstat4::NFS4ERR_RESOURCE);
        }
        inner.state_counter += 1;
        let stateid = stateid::encode(state_type, self.id, inner.state_counter);
        let state =
            Arc::new(NFS4State::new(stateid, state_type, owner.clone(), parent, file, listener));
        inner.states.insert(stateid.other, state.clone());
        owner.attach_state(stateid.other);
        debug!("client {:016x}: new {:?} state {}", self.id, state_type, stateid);
        Ok(state)
    }

    fn create_state(
        &self,
        state_type: StateType,
        owner: &Arc<StateOwner>,
        file: Option<Inode>,
        listener: Option<DisposeListener>,
    ) -> Result<Arc<NFS4State>, nfsstat4> {
        self.insert_state(&mut self.inner.lock(), state_type, owner, None, file, listener)
    }

    /// New open state for `owner`.
    pub fn create_open_state(&self, owner: &Arc<StateOwner>) -> Result<Arc<NFS4State>, nfsstat4> {
        self.create_state(StateType::Open, owner, None, None)
    }

    /// Open state of `owner` on `file`, with `listener` registered from the
    /// start.
    pub(crate) fn create_open_state_for(
        &self,
        owner: &Arc<StateOwner>,
        file: &Inode,
        listener: DisposeListener,
    ) -> Result<Arc<NFS4State>, nfsstat4> {
        self.create_state(StateType::Open, owner, Some(file.clone()), Some(listener))
    }

    /// Lock state of `lock_owner` on `file` under the open state `open`. An
    /// existing lock state of the same owner and open is returned instead of
    /// a new one; the flag tells whether the state was created. `listener`
    /// is registered only on a new state.
    pub fn create_lock_state(
        &self,
        open: &NFS4State,
        lock_owner: &Arc<StateOwner>,
        file: &Inode,
        listener: impl FnOnce(&NFS4State) + Send + 'static,
    ) -> Result<(Arc<NFS4State>, bool), nfsstat4> {
        if open.state_type() != StateType::Open {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        let parent = open.other();
        let mut inner = self.inner.lock();
        if !inner.states.contains_key(&parent) {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        let existing = inner
            .states
            .values()
            .find(|s| {
                s.state_type() == StateType::Lock
                    && s.parent() == Some(&parent)
                    && Arc::ptr_eq(s.owner(), lock_owner)
            })
            .cloned();
        if let Some(state) = existing {
            if state.file() != Some(file) {
                return Err(nfsstat4::NFS4ERR_BAD_STATEID);
            }
            return Ok((state, false));
        }
        let state = self.insert_state(
            &mut inner,
            StateType::Lock,
            lock_owner,
            Some(parent),
            Some(file.clone()),
            Some(Box::new(listener)),
        )?;
        Ok((state, true))
    }

    /// New delegation state owned by the client itself.
    pub fn create_delegation_state(&self) -> Result<Arc<NFS4State>, nfsstat4> {
        self.create_state(StateType::Delegation, &self.as_state_owner(), None, None)
    }

    /// Delegation state on `file` with `listener` registered from the start.
    pub(crate) fn create_delegation_state_for(
        &self,
        file: &Inode,
        listener: DisposeListener,
    ) -> Result<Arc<NFS4State>, nfsstat4> {
        let owner = self.as_state_owner();
        self.create_state(StateType::Delegation, &owner, Some(file.clone()), Some(listener))
    }

    /// New pNFS layout state owned by the client itself.
    pub fn create_layout_state(&self) -> Result<Arc<NFS4State>, nfsstat4> {
        self.create_state(StateType::Layout, &self.as_state_owner(), None, None)
    }

    /// New server-side copy state owned by the client itself.
    pub fn create_copy_state(&self) -> Result<Arc<NFS4State>, nfsstat4> {
        self.create_state(StateType::ServerSideCopy, &self.as_state_owner(), None, None)
    }

    /// Resolves `stateid` to a live state of this client, checking its seqid.
    pub fn state(&self, stateid: &stateid4) -> Result<Arc<NFS4State>, nfsstat4> {
        let state = self
            .inner
            .lock()
            .states
            .get(&stateid.other)
            .cloned()
            .ok_or(nfsstat4::NFS4ERR_BAD_STATEID)?;
        stateid::check_seqid(&state.stateid(), stateid, self.minor_version)?;
        Ok(state)
    }

    /// Like [`NFS4Client::state`], also requiring the state to be of
    /// `state_type`.
    pub fn state_of_type(
        &self,
        stateid: &stateid4,
        state_type: StateType,
    ) -> Result<Arc<NFS4State>, nfsstat4> {
        if stateid::decode(stateid).state_type != state_type {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        self.state(stateid)
    }

    pub fn has_state(&self) -> bool {
        !self.inner.lock().states.is_empty()
    }

    /// Every live state of the client.
    pub fn states(&self) -> Vec<Arc<NFS4State>> {
        self.inner.lock().states.values().cloned().collect()
    }

    /// Releases the state named by `stateid` together with the lock states
    /// hanging off it, running their dispose listeners.
    pub fn release_state(&self, stateid: &stateid4) -> Result<(), nfsstat4> {
        let released = {
            let mut inner = self.inner.lock();
            let state = inner
                .states
                .remove(&stateid.other)
                .ok_or(nfsstat4::NFS4ERR_BAD_STATEID)?;
            let children: Vec<_> = inner
                .states
                .iter()
                .filter(|(_, s)| s.parent() == Some(&stateid.other))
                .map(|(other, _)| *other)
                .collect();
            let mut released: Vec<_> =
                children.iter().filter_map(|other| inner.states.remove(other)).collect();
            released.push(state);
            released
        };
        debug!("client {:016x}: release {}", self.id, stateid);
        for state in released {
            state.owner().detach_state(&state.other());
            state.dispose();
        }
        Ok(())
    }

    /// Creates a session (CREATE_SESSION).
    ///
    /// `request.sequence` must be one past the last CREATE_SESSION of the
    /// client; repeating the last one returns the session it created, and
    /// any other value fails with `NFS4ERR_SEQ_MISORDERED`.
    pub fn create_session(
        &self,
        request: &SessionRequest,
        connection: ConnectionId,
        limits: &SessionLimits,
        auto_bind: bool,
    ) -> Result<Arc<NFSv41Session>, nfsstat4> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(nfsstat4::NFS4ERR_EXPIRED);
        }
        if request.sequence == inner.session_sequence {
            if let Some(session) = &inner.last_session {
                trace!("client {:016x}: create session replay", self.id);
                return Ok(session.clone());
            }
        }
        if request.sequence != inner.session_sequence.wrapping_add(1) {
            return Err(nfsstat4::NFS4ERR_SEQ_MISORDERED);
        }
        let id = stateid::make_session_id(self.id, request.sequence);
        let session =
            Arc::new(NFSv41Session::new(id, self.id, request, limits, auto_bind, connection)?);
        inner.session_sequence = request.sequence;
        inner.last_session = Some(session.clone());
        inner.sessions.insert(id, session.clone());
        debug!("client {:016x}: new session {:02x?}", self.id, id);
        Ok(session)
    }

    /// Sequence id the next CREATE_SESSION must carry (`eir_sequenceid`).
    pub fn next_session_sequence(&self) -> u32 {
        self.inner.lock().session_sequence.wrapping_add(1)
    }

    pub fn session(&self, id: &sessionid4) -> Option<Arc<NFSv41Session>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<NFSv41Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn has_sessions(&self) -> bool {
        !self.inner.lock().sessions.is_empty()
    }

    /// Removes a session (DESTROY_SESSION).
    pub fn remove_session(&self, id: &sessionid4) -> Result<Arc<NFSv41Session>, nfsstat4> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(id).ok_or(nfsstat4::NFS4ERR_BADSESSION)?;
        debug!("client {:016x}: session {:02x?} destroyed", self.id, id);
        Ok(session)
    }

    /// Whether a request of the client is executing on any session slot.
    pub fn has_requests_in_progress(&self) -> bool {
        self.inner.lock().sessions.values().any(|s| s.has_requests_in_progress())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Disposes the client unless a request is executing on one of its
    /// sessions. Returns whether the client is disposed.
    pub fn try_dispose(&self) -> bool {
        if self.has_requests_in_progress() {
            return false;
        }
        self.dispose();
        true
    }

    /// Disposes the client: all sessions go away and every state is disposed,
    /// lock states before the rest.
    pub(crate) fn dispose(&self) {
        let mut states: Vec<_> = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.sessions.clear();
            inner.last_session = None;
            inner.owners.clear();
            inner.client_owner = None;
            inner.states.drain().map(|(_, state)| state).collect()
        };
        debug!("client {:016x}: dispose with {} states", self.id, states.len());
        states.sort_by_key(|s| s.state_type() != StateType::Lock);
        for state in states {
            state.owner().detach_state(&state.other());
            state.dispose();
        }
    }
}

impl fmt::Debug for NFS4Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NFS4Client")
            .field("id", &format_args!("{:016x}", self.id))
            .field("owner", &String::from_utf8_lossy(&self.owner))
            .field("remote", &self.remote)
            .field("minor_version", &self.minor_version)
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

impl fmt::Display for NFS4Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}@{}", self.id, self.remote)
    }
}
