use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Instance,
    Volume,
    Snapshot,
    MarketRequest,
    Profile,
    HostedZone,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::MarketRequest => "market request",
            ResourceKind::Profile => "profile",
            ResourceKind::HostedZone => "hosted zone",
        };
        f.write_str(s)
    }
}

/// Error codes the control plane returns while a persistent market request is
/// still catching up with its instance (typically right after a stop).
pub const CONSISTENCY_LAG_CODES: &[&str] = &["IncorrectSpotRequestState"];

/// Errors returned by a control-plane client.
///
/// # Examples
///
/// ```rust
/// use devbox_common::{ProviderError, ResourceKind};
///
/// let err = ProviderError::NotFound { kind: ResourceKind::Volume, id: "vol-1".to_string() };
/// assert!(err.to_string().contains("vol-1"));
/// assert!(!err.is_consistency_lag());
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The referenced resource does not exist (or no longer exists).
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The API rejected the call with a typed error code.
    #[error("API error {code}: {message}")]
    Api { code: String, message: String },

    /// No spot/on-demand capacity for the requested profile in the requested zone.
    #[error("insufficient capacity for {profile} in {zone}")]
    InsufficientCapacity { profile: String, zone: String },

    /// Anything the client could not classify (transport failures, unexpected payloads).
    #[error("{0}")]
    Other(String),
}

/// Convenience alias so callers can write `ProviderResult<T>`.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        ProviderError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Api { code, .. } => Some(code.as_str()),
            ProviderError::InsufficientCapacity { .. } => Some("InsufficientInstanceCapacity"),
            _ => None,
        }
    }

    /// True when the failure is the control plane lagging behind itself and
    /// will resolve by waiting, not by changing the request.
    pub fn is_consistency_lag(&self) -> bool {
        match self {
            ProviderError::Api { code, .. } => CONSISTENCY_LAG_CODES.contains(&code.as_str()),
            ProviderError::Other(message) => legacy_message_signals_consistency_lag(message),
            _ => false,
        }
    }
}

/// Compatibility shim for clients that only surface the error text.
/// Keep all substring matching on error messages here.
fn legacy_message_signals_consistency_lag(message: &str) -> bool {
    CONSISTENCY_LAG_CODES.iter().any(|code| message.contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_code_is_consistency_lag() {
        let err = ProviderError::Api {
            code: "IncorrectSpotRequestState".to_string(),
            message: "spot request is not yet fulfilled".to_string(),
        };
        assert!(err.is_consistency_lag());
    }

    #[test]
    fn other_codes_are_not_transient() {
        let err = ProviderError::Api {
            code: "UnauthorizedOperation".to_string(),
            message: "denied".to_string(),
        };
        assert!(!err.is_consistency_lag());
        let capacity = ProviderError::InsufficientCapacity {
            profile: "c7g.4xlarge".to_string(),
            zone: "us-east-2a".to_string(),
        };
        assert!(!capacity.is_consistency_lag());
        assert_eq!(capacity.code(), Some("InsufficientInstanceCapacity"));
    }

    #[test]
    fn untyped_message_falls_back_to_shim() {
        let err = ProviderError::Other(
            "operation error EC2: StartInstances, api error IncorrectSpotRequestState".to_string(),
        );
        assert!(err.is_consistency_lag());
        assert!(!ProviderError::Other("connection reset".to_string()).is_consistency_lag());
    }
}
