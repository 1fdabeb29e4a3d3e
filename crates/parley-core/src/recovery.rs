//! Config recovery coordinator.
//!
//! Brings the persisted configuration into a loadable state before the
//! session service is first used. Strategies run cheapest first and each
//! failure only moves on to the next one:
//!
//! 1. read
//! 2. validate, then read
//! 3. recover from backup, then read
//! 4. reinitialize from the default template
//!
//! A one-time schema migration runs beforehand when the persisted layout is
//! older than [`CURRENT_SCHEMA_VERSION`].

use std::fmt;

use tracing::{info, warn};

use crate::config::CURRENT_SCHEMA_VERSION;
use crate::config_store::ConfigStore;
use crate::error::{CoreError, CoreResult};

/// Key read to prove the configuration loads.
pub const PROBE_KEY: &str = "agent.provider";

/// Which strategy left the configuration usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Clean,
    Validated,
    Recovered,
    Reinitialized,
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryOutcome::Clean => write!(f, "config ok"),
            RecoveryOutcome::Validated => write!(f, "config repaired (invalid lines removed)"),
            RecoveryOutcome::Recovered => write!(f, "config restored from backup"),
            RecoveryOutcome::Reinitialized => write!(f, "config reset to defaults"),
        }
    }
}

async fn migrate_if_needed(store: &dyn ConfigStore) {
    let version = match store.schema_version().await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "could not read config schema version");
            return;
        }
    };
    if version >= CURRENT_SCHEMA_VERSION {
        return;
    }

    info!(from = version, to = CURRENT_SCHEMA_VERSION, "migrating config");
    if let Err(e) = store.migrate(version).await {
        warn!(error = %format!("{e:#}"), "config migration failed");
    }
}

/// Runs the recovery chain. Only a failure of every strategy is an error.
pub async fn ensure_config_ready(store: &dyn ConfigStore) -> CoreResult<RecoveryOutcome> {
    migrate_if_needed(store).await;

    let read_err = match store.read(PROBE_KEY, false).await {
        Ok(_) => {
            if let Err(e) = store.backup_config().await {
                warn!(error = %format!("{e:#}"), "config backup failed");
            }
            return Ok(RecoveryOutcome::Clean);
        }
        Err(e) => e,
    };
    warn!(error = %format!("{read_err:#}"), "config read failed, validating");

    let validate_err = match store.validate_config().await {
        Ok(()) => match store.read(PROBE_KEY, false).await {
            Ok(_) => {
                info!("config usable after validation");
                return Ok(RecoveryOutcome::Validated);
            }
            Err(e) => e,
        },
        Err(e) => e,
    };
    warn!(error = %format!("{validate_err:#}"), "config validation failed, recovering from backup");

    if let Err(e) = store.backup_config().await {
        warn!(error = %format!("{e:#}"), "could not set corrupt config aside");
    }
    let recover_err = match store.recover_config().await {
        Ok(()) => match store.read(PROBE_KEY, false).await {
            Ok(_) => {
                info!("config usable after recovery");
                return Ok(RecoveryOutcome::Recovered);
            }
            Err(e) => e,
        },
        Err(e) => e,
    };
    warn!(error = %format!("{recover_err:#}"), "config recovery failed, reinitializing");

    match store.init_config().await {
        Ok(()) => {
            info!("config reinitialized with defaults");
            Ok(RecoveryOutcome::Reinitialized)
        }
        Err(init_err) => Err(CoreError::ConfigCorrupt(format!(
            "read: {read_err:#}; validate: {validate_err:#}; recover: {recover_err:#}; init: {init_err:#}"
        ))),
    }
}
