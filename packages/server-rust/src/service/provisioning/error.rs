//! Outcomes and errors that travel from the coordinator back to the caller.

use ffm_core::{EntityId, RequestId, ValidationError};
use serde::Serialize;

use crate::broker::BrokerError;
use crate::storage::StoreError;

/// What a successfully applied provisioning request did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisioningOutcome {
    Created { id: EntityId },
    Updated { id: EntityId },
    Deleted { id: EntityId },
}

impl ProvisioningOutcome {
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Created { id } | Self::Updated { id } | Self::Deleted { id } => *id,
        }
    }
}

/// Why a provisioning request did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("malformed request: {0}")]
    Decode(String),
    #[error("failed to publish request: {0}")]
    Publish(#[from] BrokerError),
    #[error("conflicts with an existing record ({constraint})")]
    Conflict { constraint: String },
    #[error("record not found")]
    NotFound,
    #[error("store failure: {0}")]
    Store(String),
    #[error("no completion within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("provisioning coordinator is not running")]
    CoordinatorDown,
    #[error("too many requests in flight")]
    Overloaded,
}

impl ProvisioningError {
    /// Short error kind for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Decode(_) => "decode",
            Self::Publish(_) => "publish",
            Self::Conflict { .. } => "conflict",
            Self::NotFound => "not_found",
            Self::Store(_) => "store",
            Self::Timeout { .. } => "timeout",
            Self::CoordinatorDown => "coordinator_down",
            Self::Overloaded => "overloaded",
        }
    }
}

impl From<StoreError> for ProvisioningError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { constraint } => Self::Conflict { constraint },
            StoreError::NotFound => Self::NotFound,
            StoreError::TransientConflict
            | StoreError::RetriesExhausted { .. }
            | StoreError::Backend(_) => Self::Store(err.to_string()),
        }
    }
}

/// Posted by the coordinator once a request has been applied or has failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub request_id: RequestId,
    pub outcome: Result<ProvisioningOutcome, ProvisioningError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind() {
        assert_eq!(
            ProvisioningError::from(StoreError::Conflict {
                constraint: "users_email_key".to_string()
            })
            .kind(),
            "conflict"
        );
        assert_eq!(ProvisioningError::from(StoreError::NotFound), ProvisioningError::NotFound);
        assert!(matches!(
            ProvisioningError::from(StoreError::RetriesExhausted { attempts: 3 }),
            ProvisioningError::Store(_)
        ));
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let id = EntityId::new();
        let json = serde_json::to_value(ProvisioningOutcome::Created { id }).unwrap();
        assert_eq!(json["status"], "created");
        assert_eq!(json["id"], id.to_string());
    }
}
