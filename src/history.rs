//! Merged, time-ordered history.
//!
//! Five sources feed the history view: persisted records, session failures,
//! session batches, recovered tasks, and in-flight work (pending placeholders
//! and streaming batches). [`merge_history`] folds them into one oldest-first
//! list in which every unit of work appears exactly once.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::types::{now_millis, BatchResult, FailedGeneration, GenerationHistory, GenerationItem, GenerationTask};

/// Upper bound on the slots a persisted group is padded to. Groups with
/// more loaded records than this still show every record.
const MAX_BATCH_SLOTS: u32 = 64;

/// What a display row shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DisplayContent {
    /// A persisted single-image record.
    Single { record: GenerationHistory },
    /// A persisted multi-image group. `full_batch_items` always has
    /// `batch_total` entries; `None` marks a record not loaded yet.
    #[serde(rename_all = "camelCase")]
    Batch {
        batch_id: String,
        batch_total: u32,
        full_batch_items: Vec<Option<GenerationHistory>>,
    },
    Failed { failure: FailedGeneration },
    /// A batch finished this session and not yet absorbed by a history reload.
    SessionBatch { batch: BatchResult },
    /// A backend task found processing on mount.
    Recovering { task: GenerationTask },
    Pending { item: GenerationItem },
    Streaming { batch: BatchResult },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDisplayItem {
    /// Stable across recomputations, for list keys.
    pub key: String,
    /// Epoch millis used for ordering.
    pub timestamp: i64,
    pub content: DisplayContent,
}

/// Borrowed inputs of one merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistorySources<'a> {
    /// Persisted records in any order.
    pub history: &'a [GenerationHistory],
    pub failed: &'a [FailedGeneration],
    pub session_batches: &'a [BatchResult],
    pub recovering: &'a [GenerationTask],
    pub pending: &'a [GenerationItem],
    pub streaming: &'a [BatchResult],
}

/// Merge all sources into one list sorted ascending by timestamp.
///
/// Duplicates are suppressed: a pending placeholder disappears once its
/// `task_id` is among the recovering tasks or its `batch_id` is streaming, and
/// a session batch is dropped once the same batch is present in persisted
/// history. Failures and session batches sharing an id are shown once.
pub fn merge_history(sources: HistorySources<'_>) -> Vec<HistoryDisplayItem> {
    let mut items = Vec::new();

    let mut persisted: Vec<&GenerationHistory> = sources.history.iter().collect();
    persisted.sort_by_key(|r| r.created_at);

    let mut groups: HashMap<&str, Vec<&GenerationHistory>> = HashMap::new();
    let mut group_order: Vec<&str> = Vec::new();
    for record in persisted {
        match record.multi_batch_id() {
            Some(batch_id) => {
                let group = groups.entry(batch_id).or_default();
                if group.is_empty() {
                    group_order.push(batch_id);
                }
                group.push(record);
            }
            None => items.push(HistoryDisplayItem {
                key: format!("history-{}", record.id),
                timestamp: record.created_at.timestamp_millis(),
                content: DisplayContent::Single {
                    record: record.clone(),
                },
            }),
        }
    }

    for batch_id in &group_order {
        let Some(records) = groups.get(batch_id) else {
            continue;
        };
        items.push(batch_group(batch_id, records));
    }

    let mut seen_failures: HashSet<&str> = HashSet::new();
    for failure in sources.failed {
        if !seen_failures.insert(failure.id.as_str()) {
            continue;
        }
        items.push(HistoryDisplayItem {
            key: failure.id.clone(),
            timestamp: failure.timestamp,
            content: DisplayContent::Failed {
                failure: failure.clone(),
            },
        });
    }

    let mut seen_batches: HashSet<&str> = group_order.iter().copied().collect();
    for batch in sources.session_batches {
        if !seen_batches.insert(batch.batch_id.as_str()) {
            continue;
        }
        items.push(HistoryDisplayItem {
            key: batch.batch_id.clone(),
            timestamp: batch.timestamp,
            content: DisplayContent::SessionBatch { batch: batch.clone() },
        });
    }

    for task in sources.recovering {
        items.push(HistoryDisplayItem {
            key: format!("recovering-{}", task.task_id),
            timestamp: task.timestamp_or(now_millis()),
            content: DisplayContent::Recovering { task: task.clone() },
        });
    }

    let recovering_ids: HashSet<&str> = sources.recovering.iter().map(|t| t.task_id.as_str()).collect();
    let streaming_ids: HashSet<&str> = sources.streaming.iter().map(|b| b.batch_id.as_str()).collect();
    for item in sources.pending {
        let recovered = item
            .task_id
            .as_deref()
            .is_some_and(|id| recovering_ids.contains(id));
        let streaming = item
            .batch_id
            .as_deref()
            .is_some_and(|id| streaming_ids.contains(id));
        if recovered || streaming {
            continue;
        }
        items.push(HistoryDisplayItem {
            key: format!("pending-{}", item.id),
            timestamp: item.timestamp,
            content: DisplayContent::Pending { item: item.clone() },
        });
    }

    for batch in sources.streaming {
        items.push(HistoryDisplayItem {
            key: format!("streaming-{}", batch.batch_id),
            timestamp: batch.timestamp,
            content: DisplayContent::Streaming { batch: batch.clone() },
        });
    }

    // Stable: ties keep source order.
    items.sort_by_key(|item| item.timestamp);
    items
}

fn batch_group(batch_id: &str, records: &[&GenerationHistory]) -> HistoryDisplayItem {
    let batch_total = records
        .iter()
        .filter_map(|r| r.batch_total)
        .max()
        .unwrap_or(1)
        .min(MAX_BATCH_SLOTS)
        .max(records.len() as u32);
    let mut slots: Vec<Option<GenerationHistory>> = vec![None; batch_total as usize];

    let mut unplaced = Vec::new();
    for record in records {
        match record.batch_index.map(|i| i as usize) {
            Some(i) if i < slots.len() && slots[i].is_none() => slots[i] = Some((*record).clone()),
            _ => unplaced.push(*record),
        }
    }
    for record in unplaced {
        if let Some(free) = slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(record.clone());
        }
    }

    let timestamp = records
        .iter()
        .map(|r| r.created_at.timestamp_millis())
        .min()
        .unwrap_or(0);

    HistoryDisplayItem {
        key: format!("batch-{}", batch_id),
        timestamp,
        content: DisplayContent::Batch {
            batch_id: batch_id.to_string(),
            batch_total,
            full_batch_items: slots,
        },
    }
}

/// Whether every record of `batch_id` has been loaded.
pub fn is_batch_complete(records: &[GenerationHistory], batch_id: &str) -> bool {
    let members: Vec<&GenerationHistory> = records
        .iter()
        .filter(|r| r.batch_id.as_deref() == Some(batch_id))
        .collect();
    match members.first().and_then(|r| r.batch_total) {
        Some(total) => members.len() >= total as usize,
        None => false,
    }
}
