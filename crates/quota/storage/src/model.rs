use crate::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use quota_types::{
    CallerId, ClientSerial, CommissionState, HolderId, HoldingCounters, IssueOutcome, Provision,
    Serial,
};
use serde::{Deserialize, Serialize};

/// Provision log payload. Sequencing and hashes are assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionLogAppend {
    pub serial: Serial,
    pub caller: CallerId,
    pub target: HolderId,
    pub commission_name: String,
    pub issued_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub outcome: CommissionState,
    pub provision: Provision,
    pub target_before: HoldingCounters,
    pub target_after: HoldingCounters,
    #[serde(default)]
    pub source_before: Option<HoldingCounters>,
    #[serde(default)]
    pub source_after: Option<HoldingCounters>,
    #[serde(default)]
    pub reason: String,
}

/// Append-only, hash-linked provision log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionLogRecord {
    pub sequence: u64,
    pub entry: ProvisionLogAppend,
    pub previous_hash: Option<String>,
    pub hash: String,
}

/// Consumed idempotency token and the outcome it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSerialRecord {
    pub caller: CallerId,
    pub client_serial: ClientSerial,
    pub outcome: IssueOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Forward window over the provision log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogWindow {
    /// Only records with a greater sequence are returned.
    pub after_sequence: u64,
    /// Zero means no limit.
    pub limit: usize,
}

/// Hash of a provision log record, linked to its predecessor.
pub fn provision_log_hash(
    entry: &ProvisionLogAppend,
    previous_hash: Option<&str>,
    sequence: u64,
) -> StorageResult<String> {
    let serializable = serde_json::json!({
        "previous_hash": previous_hash,
        "sequence": sequence,
        "entry": entry,
    });
    let serialized = serde_json::to_vec(&serializable)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&serialized).to_hex().to_string())
}

/// Recomputes the chain over `records` (ascending by sequence).
///
/// Returns the sequence of the first record whose hash or link does not
/// match, or `None` when the chain is intact.
pub fn first_broken_link(records: &[ProvisionLogRecord]) -> StorageResult<Option<u64>> {
    let mut previous: Option<&str> = None;
    for record in records {
        if record.previous_hash.as_deref() != previous {
            return Ok(Some(record.sequence));
        }
        let expected = provision_log_hash(&record.entry, previous, record.sequence)?;
        if expected != record.hash {
            return Ok(Some(record.sequence));
        }
        previous = Some(record.hash.as_str());
    }
    Ok(None)
}

pub(crate) fn apply_window(
    records: Vec<ProvisionLogRecord>,
    window: LogWindow,
) -> Vec<ProvisionLogRecord> {
    let iter = records
        .into_iter()
        .filter(|record| record.sequence > window.after_sequence);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}
