pub mod keys;
pub mod migrate;
pub mod operations;
pub mod trees;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::Db;
use thiserror::Error;

use crate::constants::MAX_CAS_RETRIES;

#[derive(Debug)]
pub struct Store {
    db: Db,
    pub papers: sled::Tree,
    pub subscribers: sled::Tree,
    pub deliveries: sled::Tree,
    pub meta: sled::Tree,
    // Secondary index trees
    pub papers_by_added: sled::Tree,
    pub deliveries_by_recipient: sled::Tree,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: entity={entity}, key={key}")]
    NotFound { entity: String, key: String },
    #[error("conflict: entity={entity}, key={key}")]
    Conflict { entity: String, key: String },
    #[error("CAS retry exhausted after {attempts} attempts: entity={entity}, key={key}")]
    CasRetryExhausted {
        entity: String,
        key: String,
        attempts: u32,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("migration error at version {version}: {message}")]
    Migration { version: u32, message: String },
}

impl Store {
    pub fn open(sled_path: &str) -> Result<Self, StoreError> {
        let db = sled::open(sled_path)?;
        let papers = db.open_tree(trees::PAPERS)?;
        let subscribers = db.open_tree(trees::SUBSCRIBERS)?;
        let deliveries = db.open_tree(trees::DELIVERIES)?;
        let meta = db.open_tree(trees::META)?;
        let papers_by_added = db.open_tree(trees::PAPERS_BY_ADDED)?;
        let deliveries_by_recipient = db.open_tree(trees::DELIVERIES_BY_RECIPIENT)?;

        Ok(Self {
            db,
            papers,
            subscribers,
            deliveries,
            meta,
            papers_by_added,
            deliveries_by_recipient,
        })
    }

    pub fn run_migrations(&self) -> Result<(), StoreError> {
        migrate::run(self)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(value)?)
    }

    pub(crate) fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read-modify-write on a single key with optimistic concurrency.
    ///
    /// `update` receives the current value (if any) and returns the value to
    /// store, or `None` to remove the key. It may run several times when a
    /// concurrent writer wins the race, so it must not have side effects.
    pub(crate) fn cas_update<T, F>(
        tree: &sled::Tree,
        entity: &str,
        key: &str,
        mut update: F,
    ) -> Result<Option<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<Option<T>, StoreError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current_raw = tree.get(key.as_bytes())?;
            let current = match &current_raw {
                Some(raw) => Some(Self::deserialize::<T>(raw)?),
                None => None,
            };

            let next = update(current)?;
            let next_raw = match &next {
                Some(value) => Some(Self::serialize(value)?),
                None => None,
            };

            match tree.compare_and_swap(key.as_bytes(), current_raw, next_raw)? {
                Ok(()) => return Ok(next),
                Err(_) => continue,
            }
        }

        Err(StoreError::CasRetryExhausted {
            entity: entity.to_string(),
            key: key.to_string(),
            attempts: MAX_CAS_RETRIES,
        })
    }
}
