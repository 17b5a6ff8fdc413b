//! Financial file manager core: entities, identifiers, validation, and the
//! provisioning envelope exchanged over the message broker.

pub mod clock;
pub mod entities;
pub mod id;
pub mod messages;
pub mod validation;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use entities::{Contract, File, NewContract, NewUser, UpdateLogEntry, User, UserChanges};
pub use id::{EntityId, RequestId};
pub use messages::{Envelope, EnvelopeError, ProvisioningRequest};
pub use validation::ValidationError;
