//! Configuration of the NFSv4 state handler.
//!
//! Every knob has a default matching common server practice, so
//! `StateHandlerConfig::default()` is a working single-instance, non-durable
//! configuration. Builder-style `with_*` methods adjust individual values.

use std::path::PathBuf;
use std::time::Duration;

use crate::state::recovery::{
    ClientRecoveryStore, EphemeralClientRecoveryStore, SledClientRecoveryStore,
};

/// Default lease time announced to clients (`lease_time` attribute).
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(90);

/// Upper bounds the server imposes on channel attributes negotiated by
/// CREATE_SESSION. The negotiated value is the minimum of the client's
/// request and these limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    /// Number of slots in a session's fore channel slot table
    pub max_requests: u32,
    /// Maximum number of operations in one COMPOUND
    pub max_operations: u32,
    /// Maximum size of a request in bytes
    pub max_request_size: u32,
    /// Maximum size of a reply in bytes
    pub max_response_size: u32,
    /// Maximum size of a reply the slot replay cache keeps
    pub max_response_size_cached: u32,
    /// Number of slots of the back channel
    pub max_back_requests: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_requests: 64,
            max_operations: 64,
            max_request_size: 1024 * 1024 + 512,
            max_response_size: 1024 * 1024 + 512,
            max_response_size_cached: 8 * 1024,
            max_back_requests: 8,
        }
    }
}

/// Where the client recovery records live.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RecoveryStoreConfig {
    /// Records are kept in memory and lost on restart; there is nothing to
    /// reclaim after a reboot.
    #[default]
    Ephemeral,
    /// Records are persisted in a sled database at the given directory.
    Sled(PathBuf),
}

/// Configuration of a [`crate::state::StateHandler`].
#[derive(Clone, Debug)]
pub struct StateHandlerConfig {
    /// Identifier of this server process, embedded in every client id and
    /// stateid it issues.
    pub instance_id: u16,
    /// Lease time granted to clients.
    pub lease_time: Duration,
    /// Length of the reclaim window after startup.
    pub grace_period: Duration,
    /// Period of the expired-lease sweeper.
    pub sweep_interval: Duration,
    /// How long an expired client holding state is kept before it is reaped.
    pub courtesy_period: Duration,
    /// Bind unknown connections to a session on SEQUENCE instead of failing
    /// with `NFS4ERR_CONN_NOT_BOUND_TO_SESSION` (SP4_NONE behaviour).
    pub auto_bind_connections: bool,
    /// Channel attribute maxima.
    pub session_limits: SessionLimits,
    /// Recovery store backend.
    pub recovery: RecoveryStoreConfig,
}

impl Default for StateHandlerConfig {
    fn default() -> Self {
        Self {
            instance_id: 0,
            lease_time: DEFAULT_LEASE_TIME,
            grace_period: DEFAULT_LEASE_TIME,
            sweep_interval: DEFAULT_LEASE_TIME,
            courtesy_period: Duration::ZERO,
            auto_bind_connections: true,
            session_limits: SessionLimits::default(),
            recovery: RecoveryStoreConfig::Ephemeral,
        }
    }
}

impl StateHandlerConfig {
    pub fn with_instance_id(mut self, instance_id: u16) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Sets the lease time; the sweep interval follows it.
    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = lease_time;
        self.sweep_interval = lease_time;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_courtesy_period(mut self, courtesy_period: Duration) -> Self {
        self.courtesy_period = courtesy_period;
        self
    }

    pub fn with_auto_bind_connections(mut self, auto_bind: bool) -> Self {
        self.auto_bind_connections = auto_bind;
        self
    }

    pub fn with_session_limits(mut self, limits: SessionLimits) -> Self {
        self.session_limits = limits;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryStoreConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Opens the recovery store selected by [`StateHandlerConfig::recovery`].
    pub fn open_recovery_store(&self) -> anyhow::Result<Box<dyn ClientRecoveryStore>> {
        match &self.recovery {
            RecoveryStoreConfig::Ephemeral => Ok(Box::new(EphemeralClientRecoveryStore::new())),
            RecoveryStoreConfig::Sled(path) => Ok(Box::new(SledClientRecoveryStore::open(path)?)),
        }
    }
}
