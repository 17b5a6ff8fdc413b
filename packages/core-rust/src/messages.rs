//! Provisioning requests and the broker envelope that carries them.
//!
//! Envelopes are encoded with named `MsgPack` (`rmp_serde::to_vec_named()`) so
//! that fields can be added without breaking consumers still running the
//! previous version.

use serde::{Deserialize, Serialize};

use crate::entities::{NewContract, NewUser, UserChanges};
use crate::id::{EntityId, RequestId};
use crate::validation::ValidationError;

/// A caller-submitted intent to create, change, or remove a durable entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProvisioningRequest {
    CreateUser(NewUser),
    UpdateUser { id: EntityId, changes: UserChanges },
    DeleteUser { id: EntityId },
    CreateContract(NewContract),
    DeleteContract { id: EntityId },
}

impl ProvisioningRequest {
    /// Short operation name used in logs and metric labels.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::CreateUser(_) => "create_user",
            Self::UpdateUser { .. } => "update_user",
            Self::DeleteUser { .. } => "delete_user",
            Self::CreateContract(_) => "create_contract",
            Self::DeleteContract { .. } => "delete_contract",
        }
    }

    /// # Errors
    ///
    /// Returns the first validation failure of the payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::CreateUser(user) => user.validate(),
            Self::UpdateUser { changes, .. } => changes.validate(),
            Self::CreateContract(contract) => contract.validate(),
            Self::DeleteUser { .. } | Self::DeleteContract { .. } => Ok(()),
        }
    }

    /// Replaces any plaintext credential in the payload with `digest(plaintext)`.
    ///
    /// Must run after [`validate`](Self::validate), which checks the plaintext.
    pub fn seal_credentials(&mut self, digest: impl Fn(&str) -> String) {
        match self {
            Self::CreateUser(user) => user.password = digest(&user.password),
            Self::UpdateUser { changes, .. } => {
                if let Some(password) = changes.password.as_mut() {
                    *password = digest(password.as_str());
                }
            }
            Self::DeleteUser { .. } | Self::CreateContract(_) | Self::DeleteContract { .. } => {}
        }
    }
}

/// Broker message body: a provisioning request tagged with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: RequestId,
    /// Millis since epoch at which the gateway published the envelope.
    pub published_at: i64,
    pub request: ProvisioningRequest,
}

/// Failure to encode or decode an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Envelope {
    #[must_use]
    pub fn new(request_id: RequestId, published_at: i64, request: ProvisioningRequest) -> Self {
        Self {
            request_id,
            published_at,
            request,
        }
    }

    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if `bytes` is not a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
