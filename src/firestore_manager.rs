use digit_stats::{TrackerState, DIGIT_COUNT};
use firestore::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DIGIT_CACHE_COLLECTION: &str = "digit_cache";

/// Custom error types for Firestore operations
#[derive(Error, Debug)]
pub enum FirestoreError {
    #[error("Firestore connection error: {0}")]
    ConnectionError(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Firestore not initialized")]
    NotInitialized,
}

/// Cached digit buffer for one symbol, document id = symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigitCacheRecord {
    /// Symbol (e.g., R_100, 1HZ10V)
    pub symbol: String,
    /// Buffer capacity at save time
    pub capacity: usize,
    /// Digits, newest first
    pub items: Vec<u8>,
    /// Occurrences of 0..=9 over the whole buffer
    pub counts: Vec<usize>,
    /// Epoch of the newest digit, 0 if unknown (records written before epochs were kept)
    #[serde(default)]
    pub last_epoch: u64,
    /// Time of save (ISO format)
    pub updated_at: String,
}

impl DigitCacheRecord {
    pub fn from_state(
        symbol: &str,
        state: &TrackerState,
        last_epoch: Option<u64>,
        updated_at: String,
    ) -> Self {
        let mut counts = vec![0usize; DIGIT_COUNT];
        for &d in &state.items {
            if let Some(c) = counts.get_mut(d as usize) {
                *c += 1;
            }
        }
        Self {
            symbol: symbol.to_string(),
            capacity: state.capacity,
            items: state.items.clone(),
            counts,
            last_epoch: last_epoch.unwrap_or(0),
            updated_at,
        }
    }

    pub fn last_epoch(&self) -> Option<u64> {
        Some(self.last_epoch).filter(|&e| e != 0)
    }

    pub fn to_state(&self) -> TrackerState {
        TrackerState {
            capacity: self.capacity,
            items: self.items.clone(),
        }
    }
}

/// Main Firestore Manager struct
pub struct FirestoreManager {
    db: FirestoreDb,
}

impl FirestoreManager {
    /// Create a new Firestore Manager instance
    ///
    /// # Arguments
    /// * `project_id` - Your Google Cloud Project ID
    pub async fn new(project_id: &str) -> Result<Self, FirestoreError> {
        let db = FirestoreDb::new(project_id)
            .await
            .map_err(|e| FirestoreError::ConnectionError(e.to_string()))?;

        Ok(Self { db })
    }

    /// Upsert the cache document for `record.symbol`
    pub async fn save_digit_record(
        &self,
        collection_name: &str,
        record: &DigitCacheRecord,
    ) -> Result<String, FirestoreError> {
        self.db
            .fluent()
            .update()
            .in_col(collection_name)
            .document_id(&record.symbol)
            .object(record)
            .execute::<DigitCacheRecord>()
            .await
            .map_err(|e| FirestoreError::OperationFailed(e.to_string()))?;

        Ok(record.symbol.clone())
    }

    pub async fn load_digit_record(
        &self,
        collection_name: &str,
        symbol: &str,
    ) -> Result<Option<DigitCacheRecord>, FirestoreError> {
        self.db
            .fluent()
            .select()
            .by_id_in(collection_name)
            .obj::<DigitCacheRecord>()
            .one(symbol)
            .await
            .map_err(|e| FirestoreError::OperationFailed(e.to_string()))
    }
}

/// Optional Firestore handle; every call fails with `NotInitialized` when unset
pub struct GlobalFirestore {
    manager: Option<FirestoreManager>,
}

impl GlobalFirestore {
    pub fn new() -> Self {
        Self { manager: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    pub async fn initialize(&mut self, project_id: &str) -> Result<(), FirestoreError> {
        match FirestoreManager::new(project_id).await {
            Ok(manager) => {
                info!("✅ Firestore connected successfully");
                self.manager = Some(manager);
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ Firestore connection failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn save_digits(&self, record: &DigitCacheRecord) -> Result<String, FirestoreError> {
        match &self.manager {
            Some(manager) => manager.save_digit_record(DIGIT_CACHE_COLLECTION, record).await,
            None => Err(FirestoreError::NotInitialized),
        }
    }

    pub async fn load_digits(&self, symbol: &str) -> Result<Option<DigitCacheRecord>, FirestoreError> {
        match &self.manager {
            Some(manager) => manager.load_digit_record(DIGIT_CACHE_COLLECTION, symbol).await,
            None => Err(FirestoreError::NotInitialized),
        }
    }
}
