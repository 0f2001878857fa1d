//! Splitting bulk requests into size-bounded batches.
//!
//! Create batches are bounded by the serialized size of their JSON array body.
//! Delete batches are bounded by the length of their comma-joined identifier
//! filter. Both accumulate items in input order and flush when the next item
//! would overflow. An item that is too large on its own still gets a batch of
//! its own; the transport will reject it and that error propagates as usual.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Range;

/// Server-imposed request size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// Maximum serialized request body size for bulk creates
    pub max_payload_bytes: usize,
    /// Maximum length of a comma-joined identifier filter for bulk deletes
    pub max_filter_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            max_filter_length: 2048,
        }
    }
}

/// A batch of create payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBatch {
    /// Positions of the batched items in the input
    pub range: Range<usize>,
    /// Serialized size of the JSON array holding these items
    pub bytes: usize,
}

/// A batch of identifiers for a delete-by-filter request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterBatch {
    /// Positions of the batched identifiers in the input
    pub range: Range<usize>,
    /// Comma-joined identifiers
    pub filter: String,
}

/// Split payloads so each batch's JSON array serializes to at most `max_bytes`.
pub fn partition_payloads(items: &[Value], max_bytes: usize) -> Vec<PayloadBatch> {
    let sizes = items.iter().map(|item| {
        serde_json::to_vec(item)
            .map(|bytes| bytes.len())
            .unwrap_or_default()
    });

    // `[` and `]` around the body, one comma between items.
    accumulate(sizes, 2, max_bytes)
        .into_iter()
        .map(|(range, bytes)| PayloadBatch { range, bytes })
        .collect()
}

/// Split identifiers so each comma-joined filter is at most `max_len` long.
pub fn partition_filter<S: AsRef<str>>(ids: &[S], max_len: usize) -> Vec<FilterBatch> {
    let sizes = ids.iter().map(|id| id.as_ref().len());

    accumulate(sizes, 0, max_len)
        .into_iter()
        .map(|(range, _)| {
            let filter = ids[range.clone()]
                .iter()
                .map(AsRef::as_ref)
                .collect::<Vec<_>>()
                .join(",");
            FilterBatch { range, filter }
        })
        .collect()
}

/// Greedy accumulate-then-flush over item sizes.
///
/// A batch of `n` items costs `overhead + sum(sizes) + (n - 1)`.
fn accumulate(
    sizes: impl Iterator<Item = usize>,
    overhead: usize,
    limit: usize,
) -> Vec<(Range<usize>, usize)> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut current = overhead;
    let mut count = 0;

    for (index, size) in sizes.enumerate() {
        let separator = usize::from(count > 0);
        let grown = current + separator + size;

        if count > 0 && grown > limit {
            batches.push((start..index, current));
            start = index;
            current = overhead + size;
            count = 1;
        } else {
            current = grown;
            count += 1;
        }
    }

    if count > 0 {
        batches.push((start..start + count, current));
    }

    batches
}
