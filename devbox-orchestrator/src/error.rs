use crate::state_machine::MigrationProgress;
use devbox_common::{ProviderError, ResourceKind};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Failures surfaced by the orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrateError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("cannot {operation}: {kind} {id} is {state}")]
    InvalidState {
        kind: ResourceKind,
        id: String,
        state: String,
        operation: String,
    },

    #[error("{operation} still failing after {attempts} attempts: {source}")]
    Transient {
        operation: String,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("timed out after {waited:?} waiting for {kind} {id} to reach {target} (last observed: {last_observed})")]
    Timeout {
        kind: ResourceKind,
        id: String,
        target: String,
        last_observed: String,
        waited: Duration,
    },

    #[error("{kind} {id} failed: {message}")]
    TerminalProviderError {
        kind: ResourceKind,
        id: String,
        message: String,
    },

    #[error("{operation} failed: {source}")]
    Provider {
        operation: String,
        #[source]
        source: ProviderError,
    },

    /// A fatal failure after the capacity checkpoint. Nothing is rolled back.
    #[error("migration aborted at {step} ({progress}): {source}")]
    MigrationAborted {
        step: String,
        progress: MigrationProgress,
        #[source]
        source: Box<OrchestrateError>,
    },

    #[error("volume relocation failed at {stage} (created so far: {created:?}): {source}")]
    RelocationFailed {
        stage: String,
        created: Vec<String>,
        #[source]
        source: Box<OrchestrateError>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OrchestrateError>;

impl OrchestrateError {
    pub fn invalid_state(
        kind: ResourceKind,
        id: impl Into<String>,
        state: impl fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        OrchestrateError::InvalidState {
            kind,
            id: id.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }
}

/// Attach the failing operation to a provider error.
pub trait ProviderResultExt<T> {
    fn during(self, operation: &str) -> Result<T>;
}

impl<T> ProviderResultExt<T> for std::result::Result<T, ProviderError> {
    fn during(self, operation: &str) -> Result<T> {
        self.map_err(|e| match e {
            ProviderError::NotFound { kind, id } => OrchestrateError::NotFound { kind, id },
            other => OrchestrateError::Provider {
                operation: operation.to_string(),
                source: other,
            },
        })
    }
}

/// A non-critical sub-step that failed after the safety-critical steps succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Degraded {
    VolumeAttach {
        volume_id: String,
        device: String,
        reason: String,
    },
    DnsUpdate {
        reason: String,
    },
    BootConfigPush {
        instance_id: String,
        reason: String,
    },
    SnapshotCleanup {
        snapshot_id: String,
        reason: String,
    },
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degraded::VolumeAttach {
                volume_id,
                device,
                reason,
            } => write!(f, "volume {} not attached at {}: {}", volume_id, device, reason),
            Degraded::DnsUpdate { reason } => write!(f, "DNS not updated: {}", reason),
            Degraded::BootConfigPush {
                instance_id,
                reason,
            } => write!(f, "boot config not pushed to {}: {}", instance_id, reason),
            Degraded::SnapshotCleanup {
                snapshot_id,
                reason,
            } => write!(f, "snapshot {} not deleted: {}", snapshot_id, reason),
        }
    }
}
