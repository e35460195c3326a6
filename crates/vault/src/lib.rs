//! Team-scoped secret retrieval from the external secret store.

pub mod acl;
pub mod broker;
pub mod error;
pub mod store;
pub mod token;

pub use {
    acl::{Acl, Permission},
    broker::{AccessCandidate, SecretBroker},
    error::VaultError,
    store::{HttpSecretStore, SecretRef, SecretScope, SecretStore},
    token::{ClientCredentialsTokenProvider, TokenProvider},
};
