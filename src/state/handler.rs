//! The server-wide state registry.
//!
//! [`StateHandler`] owns every client, indexes clients by id and by session
//! id, and holds the file tracker, the lock manager and the recovery store.
//! A background task (the sweeper) reaps clients whose lease expired and
//! closes the grace period when it runs out.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use tracing_attributes::instrument;

use super::client::{NFS4Client, NewClient};
use super::file_tracker::{FileTracker, OpenResult};
use super::lock_manager::{ByteRangeLock, LockDenied, LockManager, LockOwnerKey};
use super::nfs4_state::NFS4State;
use super::owner::StateOwner;
use super::recovery::ClientRecoveryStore;
use super::session::{ConnectionId, NFSv41Session, SequenceResult, SessionRequest};
use super::stateid::{self, StateType};
use super::Inode;
use crate::config::StateHandlerConfig;
use crate::protocol::xdr::nfs4::{
    channel_dir_from_client4, channel_dir_from_server4, clientid4, nfs_lock_type4, nfsstat4,
    sessionid4, stateid4, verifier4, CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
    OPEN4_SHARE_ACCESS_WRITE, SEQ4_STATUS_CB_PATH_DOWN_SESSION,
    SEQ4_STATUS_RESTART_RECLAIM_NEEDED,
};

/// Failure of a LOCK request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockError {
    /// A conflicting lock is held; reported with `NFS4ERR_DENIED`.
    Denied(LockDenied),
    Status(nfsstat4),
}

impl From<nfsstat4> for LockError {
    fn from(status: nfsstat4) -> Self {
        LockError::Status(status)
    }
}

impl From<LockDenied> for LockError {
    fn from(denied: LockDenied) -> Self {
        LockError::Denied(denied)
    }
}

impl From<LockError> for nfsstat4 {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Denied(denied) => denied.into(),
            LockError::Status(status) => status,
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Denied(denied) => fmt::Display::fmt(denied, f),
            LockError::Status(status) => fmt::Display::fmt(status, f),
        }
    }
}

impl std::error::Error for LockError {}

/// Registry of all NFSv4 clients and their state.
pub struct StateHandler {
    config: StateHandlerConfig,
    boot_epoch: u16,
    /// Client counters of this incarnation start right after this value
    counter_base: u32,
    client_counter: AtomicU32,
    clients: DashMap<clientid4, Arc<NFS4Client>>,
    sessions: DashMap<sessionid4, Arc<NFS4Client>>,
    file_tracker: Arc<FileTracker>,
    lock_manager: Arc<LockManager>,
    recovery: Box<dyn ClientRecoveryStore>,
    grace_end: Instant,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StateHandler {
    /// Creates a handler with the recovery store selected by `config`.
    pub fn new(config: StateHandlerConfig) -> anyhow::Result<Arc<Self>> {
        let recovery = config.open_recovery_store().context("unable to open recovery store")?;
        Ok(Self::with_recovery_store(config, recovery))
    }

    /// Creates a handler on top of an already opened recovery store.
    pub fn with_recovery_store(
        config: StateHandlerConfig,
        recovery: Box<dyn ClientRecoveryStore>,
    ) -> Arc<Self> {
        let boot_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let (boot_epoch, counter_base) = stateid::incarnation(boot_secs);
        info!(
            "NFSv4 state handler: instance {}, epoch {:04x}, lease {:?}, grace {:?}",
            config.instance_id, boot_epoch, config.lease_time, config.grace_period
        );
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            grace_end: Instant::now() + config.grace_period,
            config,
            boot_epoch,
            counter_base,
            client_counter: AtomicU32::new(counter_base),
            clients: DashMap::new(),
            sessions: DashMap::new(),
            file_tracker: FileTracker::new(),
            lock_manager: Arc::new(LockManager::new()),
            recovery,
            running: AtomicBool::new(true),
            shutdown,
            sweeper: Mutex::new(None),
        })
    }

    /// Starts the lease sweeper. Must be called within a tokio runtime;
    /// calling it again does nothing.
    pub fn start(self: &Arc<Self>) {
        self.check_running();
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let handler = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match Weak::upgrade(&handler) {
                            Some(handler) => handler.sweep(),
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("lease sweeper stopped");
        }));
        info!("lease sweeper started, period {:?}", period);
    }

    /// Stops the sweeper and disposes every client. Client records stay in
    /// the recovery store so the clients can reclaim after a restart.
    ///
    /// Any use of the handler afterwards panics.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        self.sweeper.lock().take();

        let clients: Vec<_> = self.clients.iter().map(|c| c.value().clone()).collect();
        self.clients.clear();
        self.sessions.clear();
        for client in &clients {
            client.dispose();
        }
        if let Err(e) = self.recovery.flush() {
            error!("unable to flush recovery store: {:?}", e);
        }
        info!("NFSv4 state handler stopped, {} client(s) dropped", clients.len());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn check_running(&self) {
        assert!(self.is_running(), "state handler is not running");
    }

    pub fn config(&self) -> &StateHandlerConfig {
        &self.config
    }

    pub fn instance_id(&self) -> u16 {
        self.config.instance_id
    }

    pub fn boot_epoch(&self) -> u16 {
        self.boot_epoch
    }

    pub fn file_tracker(&self) -> &Arc<FileTracker> {
        &self.file_tracker
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn recovery_store(&self) -> &dyn ClientRecoveryStore {
        self.recovery.as_ref()
    }

    /// Whether `client_id` was handed out by this incarnation of this
    /// instance.
    fn issued_here(&self, client_id: clientid4) -> bool {
        let issued = self.client_counter.load(Ordering::Relaxed).wrapping_sub(self.counter_base);
        let offset = stateid::client_id_counter(client_id).wrapping_sub(self.counter_base);
        stateid::client_id_instance(client_id) == self.config.instance_id
            && stateid::client_id_epoch(client_id) == self.boot_epoch
            && offset != 0
            && offset <= issued
    }

    fn confirm_verifier(client_id: clientid4) -> verifier4 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        ((client_id << 32) | u64::from(nanos)).to_be_bytes()
    }

    // Clients

    /// Registers a new client (SETCLIENTID, EXCHANGE_ID).
    #[instrument(
        level = "debug",
        skip_all,
        fields(owner = ?String::from_utf8_lossy(&params.owner.co_ownerid))
    )]
    pub fn create_client(&self, params: NewClient) -> Arc<NFS4Client> {
        self.check_running();
        let counter = self.client_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let id = stateid::make_client_id(self.config.instance_id, self.boot_epoch, counter);
        let confirmed = params.confirmed;
        let client = Arc::new(NFS4Client::new(
            id,
            params,
            Self::confirm_verifier(id),
            self.config.lease_time,
            self.config.courtesy_period,
        ));
        self.clients.insert(id, client.clone());
        debug!("new client {:?}", client);
        if confirmed {
            self.confirm(&client);
        }
        client
    }

    /// Confirms `client`. Every other client with the same owner id is
    /// purged, and the client is recorded in the recovery store.
    #[instrument(level = "debug", skip_all, fields(clientid = client.id()))]
    pub fn confirm(&self, client: &Arc<NFS4Client>) {
        self.check_running();
        if !client.set_confirmed() {
            return;
        }
        let previous: Vec<_> = self
            .clients
            .iter()
            .filter(|c| c.id() != client.id() && c.owner() == client.owner())
            .map(|c| c.value().clone())
            .collect();
        for old in previous {
            debug!("client {} replaces {}", client, old);
            self.remove_client(&old);
        }
        if let Err(e) = self.recovery.add_client(client.owner()) {
            error!("unable to record client {}: {:?}", client, e);
        }
        debug!("client {} confirmed", client);
    }

    /// SETCLIENTID_CONFIRM: confirms client `client_id` if `verifier` is the
    /// one handed out for it.
    pub fn confirm_client(
        &self,
        client_id: clientid4,
        verifier: &verifier4,
    ) -> Result<Arc<NFS4Client>, nfsstat4> {
        let client = self.get_client(client_id)?;
        if client.confirm_verifier() != verifier {
            trace!("client {}: confirm verifier mismatch", client);
            return Err(nfsstat4::NFS4ERR_STALE_CLIENTID);
        }
        self.confirm(&client);
        Ok(client)
    }

    /// Looks up a client. Ids of other instances or earlier incarnations and
    /// unknown ids are `NFS4ERR_STALE_CLIENTID`.
    pub fn get_client(&self, client_id: clientid4) -> Result<Arc<NFS4Client>, nfsstat4> {
        self.check_running();
        if !self.issued_here(client_id) {
            return Err(nfsstat4::NFS4ERR_STALE_CLIENTID);
        }
        self.clients
            .get(&client_id)
            .map(|c| c.value().clone())
            .ok_or(nfsstat4::NFS4ERR_STALE_CLIENTID)
    }

    /// Like [`StateHandler::get_client`], requiring a confirmed client.
    pub fn get_confirmed_client(&self, client_id: clientid4) -> Result<Arc<NFS4Client>, nfsstat4> {
        let client = self.get_client(client_id)?;
        if !client.is_confirmed() {
            return Err(nfsstat4::NFS4ERR_STALE_CLIENTID);
        }
        Ok(client)
    }

    /// The client that owns `stateid`.
    ///
    /// Special stateids and malformed ones are `NFS4ERR_BAD_STATEID`,
    /// stateids of another instance or incarnation `NFS4ERR_STALE_STATEID`,
    /// and stateids of a client that is gone `NFS4ERR_BAD_STATEID`.
    pub fn get_client_by_stateid(&self, stateid: &stateid4) -> Result<Arc<NFS4Client>, nfsstat4> {
        self.check_running();
        if stateid::is_stateless(stateid) {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        let decoded = stateid::decode(stateid);
        if decoded.instance_id != self.config.instance_id || !self.issued_here(decoded.client_id) {
            return Err(nfsstat4::NFS4ERR_STALE_STATEID);
        }
        if decoded.state_type == StateType::Invalid || decoded.counter == 0 {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        self.clients
            .get(&decoded.client_id)
            .map(|c| c.value().clone())
            .ok_or(nfsstat4::NFS4ERR_BAD_STATEID)
    }

    /// The client owning session `session_id`.
    pub fn get_client_by_session(
        &self,
        session_id: &sessionid4,
    ) -> Result<Arc<NFS4Client>, nfsstat4> {
        self.check_running();
        self.sessions
            .get(session_id)
            .map(|c| c.value().clone())
            .ok_or(nfsstat4::NFS4ERR_BADSESSION)
    }

    /// Session `session_id` with its client.
    pub fn get_session(
        &self,
        session_id: &sessionid4,
    ) -> Result<(Arc<NFS4Client>, Arc<NFSv41Session>), nfsstat4> {
        let client = self.get_client_by_session(session_id)?;
        let session = client.session(session_id).ok_or(nfsstat4::NFS4ERR_BADSESSION)?;
        Ok((client, session))
    }

    /// A client with owner id `owner`, preferring a confirmed one.
    pub fn client_by_owner(&self, owner: &[u8]) -> Option<Arc<NFS4Client>> {
        self.check_running();
        let mut found = None;
        for client in self.clients.iter().filter(|c| c.owner() == owner) {
            if client.is_confirmed() {
                return Some(client.value().clone());
            }
            found = Some(client.value().clone());
        }
        found
    }

    pub fn clients(&self) -> Vec<Arc<NFS4Client>> {
        self.check_running();
        self.clients.iter().map(|c| c.value().clone()).collect()
    }

    /// Unregisters `client` and disposes it with all its state.
    #[instrument(level = "debug", skip_all, fields(clientid = client.id()))]
    pub fn remove_client(&self, client: &Arc<NFS4Client>) {
        self.check_running();
        self.unregister_client(client);
    }

    /// Removal without the running check; a client already dropped by
    /// [`StateHandler::shutdown`] is left alone.
    fn unregister_client(&self, client: &Arc<NFS4Client>) {
        if self.clients.remove(&client.id()).is_none() {
            return;
        }
        for session in client.sessions() {
            self.sessions.remove(session.id());
        }
        client.dispose();
        if client.is_confirmed() {
            if let Err(e) = self.recovery.remove_client(client.owner()) {
                error!("unable to remove record of client {}: {:?}", client, e);
            }
        }
        debug!("client {} removed", client);
    }

    /// DESTROY_CLIENTID: removes a client that has no sessions left.
    pub fn destroy_client(&self, client_id: clientid4) -> Result<(), nfsstat4> {
        let client = self.get_client(client_id)?;
        if client.has_sessions() {
            return Err(nfsstat4::NFS4ERR_CLIENTID_BUSY);
        }
        self.remove_client(&client);
        Ok(())
    }

    /// Renews the lease of the client owning `stateid`.
    pub fn update_lease_time(&self, stateid: &stateid4) -> Result<(), nfsstat4> {
        self.get_client_by_stateid(stateid)?.update_lease_time()
    }

    /// RENEW.
    pub fn renew(&self, client_id: clientid4) -> Result<(), nfsstat4> {
        self.get_confirmed_client(client_id)?.update_lease_time()
    }

    // Sessions

    /// CREATE_SESSION. Confirms the client on its first session.
    #[instrument(
        level = "debug",
        skip_all,
        fields(clientid = client.id(), sequence = request.sequence)
    )]
    pub fn create_session(
        &self,
        client: &Arc<NFS4Client>,
        request: &SessionRequest,
        connection: ConnectionId,
    ) -> Result<Arc<NFSv41Session>, nfsstat4> {
        self.check_running();
        client.update_lease_time()?;
        let session = client.create_session(
            request,
            connection,
            &self.config.session_limits,
            self.config.auto_bind_connections,
        )?;
        self.sessions.insert(*session.id(), client.clone());
        self.confirm(client);
        Ok(session)
    }

    /// DESTROY_SESSION.
    pub fn remove_session(&self, session_id: &sessionid4) -> Result<(), nfsstat4> {
        self.check_running();
        let (_, client) = self.sessions.remove(session_id).ok_or(nfsstat4::NFS4ERR_BADSESSION)?;
        client.remove_session(session_id)?;
        Ok(())
    }

    /// BIND_CONN_TO_SESSION.
    pub fn bind_connection(
        &self,
        session_id: &sessionid4,
        connection: ConnectionId,
        direction: channel_dir_from_client4,
    ) -> Result<channel_dir_from_server4, nfsstat4> {
        let (_, session) = self.get_session(session_id)?;
        Ok(session.bind_connection(connection, direction))
    }

    /// SEQUENCE: renews the client's lease and starts the request on its
    /// slot.
    pub fn sequence(
        &self,
        session_id: &sessionid4,
        connection: ConnectionId,
        slot_id: u32,
        sequence: u32,
        highest_slot_id: u32,
        cache_this: bool,
    ) -> Result<(Arc<NFS4Client>, SequenceResult), nfsstat4> {
        let (client, session) = self.get_session(session_id)?;
        client.update_lease_time()?;
        let result =
            session.sequence_request(connection, slot_id, sequence, highest_slot_id, cache_this)?;
        Ok((client, result))
    }

    /// `sr_status_flags` for a SEQUENCE reply to `client` on `session`.
    pub fn sequence_status_flags(&self, client: &NFS4Client, session: &NFSv41Session) -> u32 {
        let mut flags = 0;
        if self.in_grace_period() && !client.is_reclaim_completed() {
            flags |= SEQ4_STATUS_RESTART_RECLAIM_NEEDED;
        }
        if session.flags() & CREATE_SESSION4_FLAG_CONN_BACK_CHAN != 0 && client.callback().is_none()
        {
            flags |= SEQ4_STATUS_CB_PATH_DOWN_SESSION;
        }
        flags
    }

    // Grace period

    /// Whether the server only accepts reclaims. Closes the window once the
    /// grace period is over.
    pub fn in_grace_period(&self) -> bool {
        self.check_running();
        self.grace_open()
    }

    fn grace_open(&self) -> bool {
        if !self.recovery.in_grace() {
            return false;
        }
        if Instant::now() >= self.grace_end {
            self.end_grace();
            return false;
        }
        true
    }

    /// Fails with `NFS4ERR_GRACE` for a regular request during the grace
    /// period and with `NFS4ERR_NO_GRACE` for a reclaim after it.
    pub fn check_grace(&self, reclaim: bool) -> Result<(), nfsstat4> {
        match (self.in_grace_period(), reclaim) {
            (true, false) => Err(nfsstat4::NFS4ERR_GRACE),
            (false, true) => Err(nfsstat4::NFS4ERR_NO_GRACE),
            _ => Ok(()),
        }
    }

    /// Admits a reclaim by `client`.
    pub fn want_reclaim(&self, client: &NFS4Client) -> Result<(), nfsstat4> {
        if client.is_reclaim_completed() || !self.in_grace_period() {
            return Err(nfsstat4::NFS4ERR_NO_GRACE);
        }
        self.recovery.want_reclaim(client.owner())
    }

    /// RECLAIM_COMPLETE by `client`. The grace period ends early once no
    /// client known before the restart is still missing.
    #[instrument(level = "debug", skip_all, fields(clientid = client.id()))]
    pub fn reclaim_complete(&self, client: &NFS4Client) -> Result<(), nfsstat4> {
        self.check_running();
        client.reclaim_complete()?;
        if self.recovery.in_grace() && !self.recovery.waiting_for_reclaim() {
            self.end_grace();
        }
        Ok(())
    }

    fn end_grace(&self) {
        if !self.recovery.in_grace() {
            return;
        }
        if let Err(e) = self.recovery.reclaim_complete() {
            error!("unable to close grace period: {:?}", e);
        }
        info!("grace period ended");
    }

    // Opens, delegations and locks

    /// OPEN of `inode` by `owner`. Reclaims go through the grace checks and
    /// bypass share and delegation conflicts.
    pub fn open_file(
        &self,
        client: &Arc<NFS4Client>,
        owner: &Arc<StateOwner>,
        inode: &Inode,
        share_access: u32,
        share_deny: u32,
        reclaim: bool,
    ) -> Result<OpenResult, nfsstat4> {
        self.check_grace(reclaim)?;
        if reclaim {
            self.want_reclaim(client)?;
            self.file_tracker.reclaim_open(client, owner, inode, share_access, share_deny)
        } else {
            self.file_tracker.add_open(client, owner, inode, share_access, share_deny)
        }
    }

    /// CLOSE: releases the open `stateid` and the lock states under it.
    pub fn close_file(
        &self,
        client: &NFS4Client,
        stateid: &stateid4,
    ) -> Result<stateid4, nfsstat4> {
        let state = client.state_of_type(stateid, StateType::Open)?;
        let closed = state.bump_seqid();
        client.release_state(&closed)?;
        Ok(closed)
    }

    /// DELEGRETURN.
    pub fn return_delegation(
        &self,
        client: &NFS4Client,
        stateid: &stateid4,
    ) -> Result<(), nfsstat4> {
        client.state_of_type(stateid, StateType::Delegation)?;
        client.release_state(stateid)
    }

    /// LOCK: takes a byte-range lock for `lock_owner` under the open
    /// `open_stateid`. Returns the lock state and its current stateid.
    #[allow(clippy::too_many_arguments)]
    pub fn acquire_lock(
        &self,
        client: &Arc<NFS4Client>,
        open_stateid: &stateid4,
        lock_owner: &Arc<StateOwner>,
        inode: &Inode,
        lock_type: nfs_lock_type4,
        offset: u64,
        length: u64,
    ) -> Result<(Arc<NFS4State>, stateid4), LockError> {
        let open = client.state_of_type(open_stateid, StateType::Open)?;
        let access = self.file_tracker.get_share_access(client, inode, &open.stateid())?;
        if lock_type.is_write() && access & OPEN4_SHARE_ACCESS_WRITE == 0 {
            return Err(nfsstat4::NFS4ERR_OPENMODE.into());
        }
        let key = LockOwnerKey::new(client.id(), lock_owner.owner());
        let lock = ByteRangeLock::new(key, lock_type, offset, length)?;

        let locks = Arc::downgrade(&self.lock_manager);
        let file = inode.clone();
        let (state, created) = client.create_lock_state(&open, lock_owner, inode, move |state| {
            if let Some(locks) = locks.upgrade() {
                locks.unlock_state(&file, &state.other());
            }
        })?;

        match self.lock_manager.lock(inode, state.other(), lock) {
            Ok(()) if state.is_disposed() => {
                // disposed while the lock was being granted
                self.lock_manager.unlock_state(inode, &state.other());
                Err(nfsstat4::NFS4ERR_EXPIRED.into())
            }
            Ok(()) if created => Ok((state.clone(), state.stateid())),
            Ok(()) => Ok((state.clone(), state.bump_seqid())),
            Err(denied) => {
                if created {
                    if let Err(e) = client.release_state(&state.stateid()) {
                        warn!("unable to drop unused lock state: {}", e);
                    }
                }
                Err(denied.into())
            }
        }
    }

    /// LOCKU. The lock stateid must belong to `inode`.
    pub fn release_lock(
        &self,
        client: &NFS4Client,
        lock_stateid: &stateid4,
        inode: &Inode,
        offset: u64,
        length: u64,
    ) -> Result<stateid4, nfsstat4> {
        let state = client.state_of_type(lock_stateid, StateType::Lock)?;
        if state.file() != Some(inode) {
            return Err(nfsstat4::NFS4ERR_BAD_STATEID);
        }
        let key = LockOwnerKey::new(client.id(), state.owner().owner());
        self.lock_manager.unlock(inode, &key, offset, length)?;
        Ok(state.bump_seqid())
    }

    // Lease sweeper

    /// Reaps clients whose lease expired, and closes the grace period when
    /// it is over. Clients with a request in progress are left for the next
    /// round.
    #[instrument(level = "trace", skip_all)]
    pub fn sweep(&self) {
        if !self.is_running() {
            return;
        }
        self.grace_open();

        let now = Instant::now();
        let expired: Vec<_> = self
            .clients
            .iter()
            .filter(|c| c.is_reapable(now))
            .map(|c| c.value().clone())
            .collect();
        for client in expired {
            if client.has_requests_in_progress() {
                trace!("client {} busy, not reaped", client);
                continue;
            }
            warn!("lease of client {} expired, removing it", client);
            self.unregister_client(&client);
        }
    }
}

impl fmt::Debug for StateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandler")
            .field("instance_id", &self.config.instance_id)
            .field("boot_epoch", &self.boot_epoch)
            .field("clients", &self.clients.len())
            .field("running", &self.is_running())
            .finish()
    }
}
