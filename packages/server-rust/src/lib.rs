//! `ffm-server`: transaction-correlated provisioning over HTTP, a message
//! broker, and a serializable SQL store.

pub mod broker;
pub mod network;
pub mod service;
pub mod storage;
pub mod traits;

pub use traits::{ContractRepository, CredentialHasher, MessageBroker, Subscription, UserRepository};
