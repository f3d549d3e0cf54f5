//! Operation journal
//!
//! Append-only audit record of submission outcomes. Each entry carries the
//! SHA-256 of its predecessor so tampering is detectable. When the journal is
//! full the oldest entry is dropped and its hash becomes the new anchor.

use crate::locks::ContextId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

/// One recorded submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique entry id
    pub id: Uuid,
    /// Position in the chain, starting at 0
    pub sequence: u64,
    /// When the submission finished
    pub timestamp: DateTime<Utc>,
    /// Context that ran the submission
    pub context_id: ContextId,
    /// Operation names, in submission order
    pub operations: Vec<String>,
    /// Target addresses, in submission order
    pub addresses: Vec<String>,
    /// `success` or `failed: <kind>`
    pub outcome: String,
    /// Hash of the previous entry; zero for the first
    #[serde(with = "hex_bytes")]
    pub prev_hash: [u8; 32],
    /// Hash over this entry and `prev_hash`
    #[serde(with = "hex_bytes")]
    pub hash: [u8; 32],
}

#[derive(Debug, Default)]
struct Chain {
    entries: VecDeque<JournalEntry>,
    anchor: [u8; 32],
    next_sequence: u64,
}

/// Bounded, hash-chained outcome log
#[derive(Debug)]
pub struct OperationJournal {
    chain: Mutex<Chain>,
    capacity: usize,
}

impl OperationJournal {
    /// Journal keeping at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            chain: Mutex::new(Chain::default()),
            capacity: capacity.max(1),
        }
    }

    /// Append an outcome and return its sequence number
    pub fn record(
        &self,
        context_id: ContextId,
        operations: Vec<String>,
        addresses: Vec<String>,
        outcome: impl Into<String>,
    ) -> u64 {
        let mut chain = self.chain.lock();
        let prev_hash = chain.entries.back().map_or(chain.anchor, |e| e.hash);
        let sequence = chain.next_sequence;
        chain.next_sequence += 1;
        let mut entry = JournalEntry {
            id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            context_id,
            operations,
            addresses,
            outcome: outcome.into(),
            prev_hash,
            hash: [0; 32],
        };
        entry.hash = compute_hash(&entry);
        chain.entries.push_back(entry);
        while chain.entries.len() > self.capacity {
            if let Some(dropped) = chain.entries.pop_front() {
                chain.anchor = dropped.hash;
            }
        }
        sequence
    }

    /// Snapshot of the retained entries
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.chain.lock().entries.iter().cloned().collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.lock().entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute the chain from the anchor
    ///
    /// # Errors
    /// [`JournalError::IntegrityViolation`] naming the first bad sequence.
    pub fn verify_integrity(&self) -> Result<(), JournalError> {
        let chain = self.chain.lock();
        verify_chain(chain.anchor, chain.entries.iter())
    }

    #[cfg(test)]
    fn tamper(&self, sequence: u64, outcome: &str) {
        let mut chain = self.chain.lock();
        if let Some(e) = chain.entries.iter_mut().find(|e| e.sequence == sequence) {
            e.outcome = outcome.to_string();
        }
    }
}

fn verify_chain<'a>(
    anchor: [u8; 32],
    entries: impl Iterator<Item = &'a JournalEntry>,
) -> Result<(), JournalError> {
    let mut prev = anchor;
    for entry in entries {
        if entry.prev_hash != prev || entry.hash != compute_hash(entry) {
            return Err(JournalError::IntegrityViolation(entry.sequence));
        }
        prev = entry.hash;
    }
    Ok(())
}

fn compute_hash(entry: &JournalEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.id.as_bytes());
    hasher.update(entry.sequence.to_le_bytes());
    hasher.update(entry.timestamp.to_rfc3339().as_bytes());
    hasher.update(entry.context_id.as_bytes());
    for op in &entry.operations {
        hasher.update(op.as_bytes());
        hasher.update([0]);
    }
    hasher.update([1]);
    for address in &entry.addresses {
        hasher.update(address.as_bytes());
        hasher.update([0]);
    }
    hasher.update([1]);
    hasher.update(entry.outcome.as_bytes());
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

/// Journal verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    /// Entry with this sequence number breaks the chain
    #[error("journal integrity violation at entry {0}")]
    IntegrityViolation(u64),
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(bytes.len(), &"32 bytes"))
    }
}
