pub mod credential;
pub(crate) mod disk;
pub mod index;

use std::sync::{Arc, Mutex};

pub use credential::CredentialSource;
pub use index::CredentialStore;

/// Store shared between concurrent sessions.
pub type SharedStore = Arc<Mutex<CredentialStore>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialize: {0}")]
    Serialization(String),
    #[error("Encrypt: {0}")]
    Encryption(String),
    #[error("Corrupt: {0}")]
    Corrupt(String),
    #[error("Lock poisoned")]
    Poisoned,
}

pub fn shared(store: CredentialStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}
