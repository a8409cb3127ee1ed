use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use creditbot_contracts::{ChatMessage, ProcessedRecord, StateSnapshot, StateStats};
use creditbot_kernel::parse_rfc3339;
use tracing::{info, warn};

use crate::kv::KvBackend;

/// The key/value backends a state store persists to. At least one must be
/// present for state to survive a restart.
#[derive(Clone, Default)]
pub struct StateBackends {
    pub primary: Option<Arc<dyn KvBackend>>,
    pub fallback: Option<Arc<dyn KvBackend>>,
}

/// Durable set of processed message ids. Every mutation rewrites the whole
/// snapshot: unconditionally to the fallback, best-effort to the primary.
pub struct StateStore {
    key: String,
    backends: StateBackends,
    snapshot: StateSnapshot,
    index: HashSet<String>,
    primary_dirty: bool,
}

impl StateStore {
    /// Never fails: unreadable or corrupt documents are logged and treated as
    /// absent. Backends that disagree with the reconciled snapshot are
    /// rewritten.
    pub async fn load(key: &str, backends: StateBackends) -> Self {
        let (mut store, from_primary, from_fallback) = Self::assemble(key, backends).await;
        let fallback_stale =
            store.backends.fallback.is_some() && from_fallback.is_stale(&store.snapshot);
        let primary_stale =
            store.backends.primary.is_some() && from_primary.is_stale(&store.snapshot);
        if let Ok(bytes) = store.encode() {
            if fallback_stale {
                store.write_fallback(&bytes).await;
            }
            if primary_stale {
                store.write_primary(&bytes).await;
            }
        }
        store
    }

    /// Reads and reconciles like [`StateStore::load`] but writes nothing back.
    pub async fn inspect(key: &str, backends: StateBackends) -> Self {
        Self::assemble(key, backends).await.0
    }

    async fn assemble(key: &str, backends: StateBackends) -> (Self, Loaded, Loaded) {
        let from_primary = match &backends.primary {
            Some(kv) => read_snapshot(kv.as_ref(), key).await,
            None => Loaded::Absent,
        };
        let from_fallback = match &backends.fallback {
            Some(kv) => read_snapshot(kv.as_ref(), key).await,
            None => Loaded::Absent,
        };

        let now = Utc::now();
        let mut snapshot = match (from_primary.snapshot(), from_fallback.snapshot()) {
            (Some(primary), Some(fallback)) => {
                let mut merged = primary.clone();
                let recovered = reconcile(&mut merged, fallback);
                if recovered > 0 {
                    info!(
                        key,
                        recovered, "recovered ids committed only to the fallback backend"
                    );
                }
                merged
            }
            (Some(primary), None) => primary.clone(),
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => StateSnapshot::empty(now.to_rfc3339()),
        };

        let repairs = repair(&mut snapshot, now);
        if !repairs.is_empty() {
            warn!(key, repairs = ?repairs, "repaired loaded state snapshot");
        }

        let primary_dirty =
            backends.primary.is_some() && matches!(from_primary, Loaded::Unavailable);
        let store = Self {
            key: key.to_string(),
            index: snapshot.processed_messages.iter().cloned().collect(),
            snapshot,
            backends,
            primary_dirty,
        };
        (store, from_primary, from_fallback)
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    pub fn filter_unprocessed<'a>(&self, messages: &'a [ChatMessage]) -> Vec<&'a ChatMessage> {
        messages
            .iter()
            .filter(|m| !self.is_processed(&m.id))
            .collect()
    }

    /// Returns false, without touching the backends, when `id` is already
    /// recorded.
    pub async fn mark_processed(&mut self, id: &str, record: ProcessedRecord) -> bool {
        if !self.index.insert(id.to_string()) {
            return false;
        }
        self.snapshot.processed_messages.push(id.to_string());
        self.snapshot
            .processing_details
            .insert(id.to_string(), record);
        self.snapshot.total_processed += 1;
        self.persist().await;
        true
    }

    pub async fn update_last_check(&mut self, at: DateTime<Utc>) {
        self.snapshot.last_check_timestamp = Some(at.to_rfc3339());
        self.persist().await;
    }

    /// Drops the oldest ids beyond `max_entries` together with their
    /// details. Returns the number removed.
    pub async fn prune(&mut self, max_entries: usize) -> usize {
        let len = self.snapshot.processed_messages.len();
        if len <= max_entries {
            return 0;
        }
        let removed: Vec<String> = self
            .snapshot
            .processed_messages
            .drain(..len - max_entries)
            .collect();
        for id in &removed {
            self.index.remove(id);
            self.snapshot.processing_details.remove(id);
        }
        self.snapshot.total_processed = self.snapshot.processed_messages.len() as u64;
        self.snapshot.total_pruned += removed.len() as u64;
        info!(
            key = %self.key,
            removed = removed.len(),
            kept = max_entries,
            "pruned processed message ids"
        );
        self.persist().await;
        removed.len()
    }

    pub fn stats(&self) -> StateStats {
        StateStats {
            total_processed: self.snapshot.total_processed,
            last_check: self.snapshot.last_check_timestamp.clone(),
            created_at: self.snapshot.created_at.clone(),
            processed_count: self.snapshot.processed_messages.len(),
            total_pruned: self.snapshot.total_pruned,
            primary_dirty: self.primary_dirty,
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn record(&self, id: &str) -> Option<&ProcessedRecord> {
        self.snapshot.processing_details.get(id)
    }

    fn encode(&self) -> Result<Vec<u8>, String> {
        let mut bytes = serde_json::to_vec_pretty(&self.snapshot)
            .map_err(|e| format!("encode state snapshot: {e}"))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    async fn persist(&mut self) {
        let bytes = match self.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %self.key, error = %err, "state snapshot not persisted");
                return;
            }
        };
        self.write_fallback(&bytes).await;
        self.write_primary(&bytes).await;
    }

    async fn write_fallback(&self, bytes: &[u8]) {
        if let Some(kv) = &self.backends.fallback {
            if let Err(err) = kv.put(&self.key, bytes).await {
                warn!(
                    key = %self.key,
                    backend = kv.name(),
                    error = %err,
                    "fallback state write failed"
                );
            }
        }
    }

    async fn write_primary(&mut self, bytes: &[u8]) {
        if let Some(kv) = &self.backends.primary {
            match kv.put(&self.key, bytes).await {
                Ok(()) => self.primary_dirty = false,
                Err(err) => {
                    self.primary_dirty = true;
                    warn!(
                        key = %self.key,
                        backend = kv.name(),
                        error = %err,
                        "primary state write failed; fallback remains authoritative until the next successful write"
                    );
                }
            }
        }
    }
}

enum Loaded {
    Found(StateSnapshot),
    Absent,
    Corrupt,
    Unavailable,
}

impl Loaded {
    fn snapshot(&self) -> Option<&StateSnapshot> {
        match self {
            Loaded::Found(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    // An unavailable backend is left alone on load; the next mutation rewrites it.
    fn is_stale(&self, current: &StateSnapshot) -> bool {
        match self {
            Loaded::Found(snapshot) => snapshot != current,
            Loaded::Absent | Loaded::Corrupt => true,
            Loaded::Unavailable => false,
        }
    }
}

async fn read_snapshot(kv: &dyn KvBackend, key: &str) -> Loaded {
    match kv.get(key).await {
        Ok(Some(bytes)) => match serde_json::from_slice::<StateSnapshot>(&bytes) {
            Ok(snapshot) => Loaded::Found(snapshot),
            Err(err) => {
                warn!(key, backend = kv.name(), error = %err, "state snapshot is corrupt; ignoring it");
                Loaded::Corrupt
            }
        },
        Ok(None) => Loaded::Absent,
        Err(err) => {
            warn!(key, backend = kv.name(), error = %err, "state snapshot could not be read");
            Loaded::Unavailable
        }
    }
}

// Appends ids known only to `fallback`, with their details, in fallback order.
fn reconcile(merged: &mut StateSnapshot, fallback: &StateSnapshot) -> usize {
    let mut known: HashSet<String> = merged.processed_messages.iter().cloned().collect();
    let mut recovered = 0;
    for id in &fallback.processed_messages {
        if !known.insert(id.clone()) {
            continue;
        }
        merged.processed_messages.push(id.clone());
        if let Some(record) = fallback.processing_details.get(id) {
            merged
                .processing_details
                .insert(id.clone(), record.clone());
        }
        merged.total_processed += 1;
        recovered += 1;
    }
    if later_check(&fallback.last_check_timestamp, &merged.last_check_timestamp) {
        merged.last_check_timestamp = fallback.last_check_timestamp.clone();
    }
    recovered
}

// Offsets are compared as instants; unparseable values lose to parseable ones.
fn later_check(candidate: &Option<String>, current: &Option<String>) -> bool {
    match (candidate.as_deref(), current.as_deref()) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => match (parse_rfc3339(a), parse_rfc3339(b)) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => a > b,
        },
    }
}

fn repair(snapshot: &mut StateSnapshot, now: DateTime<Utc>) -> Vec<String> {
    let mut repairs = Vec::new();

    let mut seen = HashSet::new();
    let before = snapshot.processed_messages.len();
    snapshot
        .processed_messages
        .retain(|id| seen.insert(id.clone()));
    if snapshot.processed_messages.len() != before {
        repairs.push(format!(
            "dropped {} duplicate ids",
            before - snapshot.processed_messages.len()
        ));
    }

    let orphans = snapshot
        .processing_details
        .keys()
        .filter(|id| !seen.contains(*id))
        .count();
    if orphans > 0 {
        snapshot
            .processing_details
            .retain(|id, _| seen.contains(id));
        repairs.push(format!("dropped {orphans} details without an id"));
    }

    let len = snapshot.processed_messages.len() as u64;
    if snapshot.total_processed != len {
        repairs.push(format!(
            "total_processed {} corrected to {len}",
            snapshot.total_processed
        ));
        snapshot.total_processed = len;
    }

    if snapshot.created_at.trim().is_empty() {
        snapshot.created_at = now.to_rfc3339();
        repairs.push("filled missing created_at".to_string());
    }
    repairs
}
