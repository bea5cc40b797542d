use crate::error::CoreError;
use crate::sinks::{AuditRecord, AuditSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Hash-chained audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub action: String,
    pub resource_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only audit ledger. Entries are never edited; each one commits to its predecessor.
#[derive(Debug, Default, Clone)]
pub struct AuditLedger {
    entries: Vec<AuditEntry>,
}

impl AuditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from exported entries, rejecting gaps and broken links.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, CoreError> {
        let ledger = Self { entries };

        for (expected_index, entry) in ledger.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(CoreError::Storage(format!(
                    "audit ledger index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !ledger.verify_chain() {
            return Err(CoreError::Storage(
                "audit ledger hash-chain verification failed".to_string(),
            ));
        }

        Ok(ledger)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, record: &AuditRecord) -> Result<AuditEntry, CoreError> {
        let payload = serde_json::to_value(record)?;
        let index = self.entries.len() as u64;
        let timestamp = Utc::now();
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            &record.action,
            record.resource_id.as_deref(),
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        let entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            action: record.action.clone(),
            resource_id: record.resource_id.clone(),
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected_hash = compute_entry_hash(
                entry.index,
                &entry.action,
                entry.resource_id.as_deref(),
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(
    index: u64,
    action: &str,
    resource_id: Option<&str>,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "action": action,
        "resource_id": resource_id,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Audit sink backed by an in-process [`AuditLedger`].
#[derive(Debug, Default)]
pub struct LedgerAuditSink {
    ledger: Mutex<AuditLedger>,
}

impl LedgerAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> AuditLedger {
        self.ledger.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.ledger
            .lock()
            .await
            .entries()
            .iter()
            .map(|entry| entry.action.clone())
            .collect()
    }

    pub async fn verify_chain(&self) -> bool {
        self.ledger.lock().await.verify_chain()
    }
}

#[async_trait]
impl AuditSink for LedgerAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), CoreError> {
        self.ledger.lock().await.append(&record)?;
        Ok(())
    }
}
