//! Closed error taxonomy of the policy engine.

use thiserror::Error;

pub use respolicy_topology::AllocationError;
pub use respolicy_topology::DiscoveryError;

/// Configuration failure. Surfaced at load; the daemon refuses to activate
/// the offending config and keeps the previous one.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An option value is invalid on its own or against another option.
    #[error("invalid {option}: {reason}")]
    Invalid {
        /// The offending option.
        option: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The configured policy name is not recognized.
    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),
    /// A scheduling class reference points nowhere.
    #[error("unknown scheduling class {0:?}")]
    UnknownSchedulingClass(String),
    /// A balloon class definition contradicts itself.
    #[error("contradictory balloon class {name:?}: {reason}")]
    BadBalloonClass {
        /// Class name.
        name: String,
        /// The contradiction.
        reason: String,
    },
    /// A config file could not be read.
    #[error("config read failed at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A config file could not be parsed.
    #[error("config parse failed at {path}: {source}")]
    Parse {
        /// Offending path.
        path: String,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Controller I/O failure. The delta is marked failed and the container is
/// quarantined; unrelated containers are unaffected.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// A sysfs or cgroupfs write failed.
    #[error("write to {path} failed: {source}")]
    Write {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The controller spent more than its per-step I/O budget.
    #[error("controller {name} exceeded its budget ({spent_ms}ms > {budget_ms}ms)")]
    BudgetExceeded {
        /// Controller name.
        name: String,
        /// Time actually spent, in milliseconds.
        spent_ms: u64,
        /// Allowed budget, in milliseconds.
        budget_ms: u64,
    },
}

/// Cache persistence failure.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The persisted blob carries an incompatible schema version. The
    /// caller rebuilds from the runtime's view; no up-conversion.
    #[error("cache schema version {found} does not match {expected}")]
    SchemaVersion {
        /// Version found in the blob.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// The blob is not valid JSON for the current schema.
    #[error("cache blob corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    /// Reading or writing the blob failed.
    #[error("cache i/o failed at {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Runtime protocol failure.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// An event referenced an entity the cache does not know.
    #[error("malformed event: {0}")]
    Malformed(String),
    /// The event deadline passed before the step completed.
    #[error("deadline exceeded for container {0}")]
    DeadlineExceeded(String),
}

/// Umbrella error of the policy engine.
#[derive(Error, Debug)]
pub enum Error {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// See [`DiscoveryError`].
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// See [`AllocationError`].
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// See [`ControllerError`].
    #[error(transparent)]
    Controller(#[from] ControllerError),
    /// See [`CacheError`].
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
