//! The durable keyed store behind the memory.
//!
//! Records live in partitions and are ordered inside a partition by their sort
//! key. Reads are recency queries with cursor pagination; writes are grouped
//! into atomic batches whose per-record conditions are all checked before any
//! record is written.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mnemo_types::{ContextWindowMeta, StoredMessage, UserProfile};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional write rejected for {partition}/{sort}")]
    ConditionFailed { partition: String, sort: String },
    #[error("unexpected record in {partition}: expected {expected}")]
    UnexpectedRecord {
        partition: String,
        expected: &'static str,
    },
    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("storage backend failure: {0:#}")]
    Backend(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordBody {
    Message(StoredMessage),
    Ledger(ContextWindowMeta),
    Profile(UserProfile),
}

impl RecordBody {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            RecordBody::Message(_) => "message",
            RecordBody::Ledger(_) => "ledger",
            RecordBody::Profile(_) => "profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: String,
    pub sort: String,
    /// Compare-and-swap token checked by [`Condition::IfVersion`].
    pub version: u64,
    pub body: RecordBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// No record exists at the same key.
    IfAbsent,
    /// The stored record exists and carries this version.
    IfVersion(u64),
}

impl Condition {
    /// Evaluate against the version currently stored at the key, if any.
    #[must_use]
    pub fn holds(self, current: Option<u64>) -> bool {
        match self {
            Condition::Always => true,
            Condition::IfAbsent => current.is_none(),
            Condition::IfVersion(expected) => current == Some(expected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Write {
    pub record: Record,
    pub condition: Condition,
}

impl Write {
    #[must_use]
    pub fn always(record: Record) -> Self {
        Self {
            record,
            condition: Condition::Always,
        }
    }
}

/// One page of a partition query.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// Cursor for the next page; `None` once the partition is exhausted.
    pub next: Option<String>,
}

pub trait Store: Send + Sync {
    /// Apply every write or none of them.
    fn write_batch(&self, writes: Vec<Write>) -> Result<(), StoreError>;

    /// Read up to `limit` records from `partition`, resuming after `page_token`.
    ///
    /// A backend may return fewer than `limit` records together with a cursor;
    /// callers that need exactly `limit` records loop (see [`query_recent`]).
    fn query(
        &self,
        partition: &str,
        descending: bool,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError>;

    fn put(&self, record: Record) -> Result<(), StoreError> {
        self.write_batch(vec![Write::always(record)])
    }

    fn batch_put(&self, records: Vec<Record>) -> Result<(), StoreError> {
        self.write_batch(records.into_iter().map(Write::always).collect())
    }

    fn put_conditional(&self, record: Record, condition: Condition) -> Result<(), StoreError> {
        self.write_batch(vec![Write { record, condition }])
    }
}

/// Newest-first read of up to `limit` records, following pagination until the
/// limit is met or the partition runs out.
pub fn query_recent(
    store: &dyn Store,
    partition: &str,
    limit: usize,
) -> Result<Vec<Record>, StoreError> {
    let mut records = Vec::with_capacity(limit);
    let mut token: Option<String> = None;

    while records.len() < limit {
        let page = store.query(partition, true, limit - records.len(), token.as_deref())?;
        records.extend(page.records);
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    records.truncate(limit);
    Ok(records)
}

type Partition = BTreeMap<String, (u64, RecordBody)>;

/// In-process store with the same paging behaviour as a remote one.
#[derive(Debug)]
pub struct MemoryStore {
    partitions: Mutex<HashMap<String, Partition>>,
    page_size: usize,
}

impl MemoryStore {
    pub const DEFAULT_PAGE_SIZE: usize = 100;

    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }

    /// Cap every query page at `page_size` records (minimum 1).
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Partition>> {
        // A panicked writer cannot leave a half-applied batch behind: batches are
        // validated before the first insert.
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn write_batch(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let mut partitions = self.lock();

        for write in &writes {
            let current = partitions
                .get(&write.record.partition)
                .and_then(|p| p.get(&write.record.sort))
                .map(|(version, _)| *version);
            if !write.condition.holds(current) {
                return Err(StoreError::ConditionFailed {
                    partition: write.record.partition.clone(),
                    sort: write.record.sort.clone(),
                });
            }
        }

        for Write { record, .. } in writes {
            partitions
                .entry(record.partition)
                .or_default()
                .insert(record.sort, (record.version, record.body));
        }
        Ok(())
    }

    fn query(
        &self,
        partition: &str,
        descending: bool,
        limit: usize,
        page_token: Option<&str>,
    ) -> Result<Page, StoreError> {
        let partitions = self.lock();
        let Some(entries) = partitions.get(partition) else {
            return Ok(Page::default());
        };

        let take = limit.min(self.page_size);
        let to_record = |(sort, (version, body)): (&String, &(u64, RecordBody))| Record {
            partition: partition.to_string(),
            sort: sort.clone(),
            version: *version,
            body: body.clone(),
        };

        let (records, remaining): (Vec<Record>, bool) = if descending {
            let upper = page_token.map_or(Bound::Unbounded, |t| Bound::Excluded(t.to_string()));
            let mut iter = entries.range((Bound::Unbounded, upper)).rev();
            let records = iter.by_ref().take(take).map(to_record).collect();
            (records, iter.next().is_some())
        } else {
            let lower = page_token.map_or(Bound::Unbounded, |t| Bound::Excluded(t.to_string()));
            let mut iter = entries.range((lower, Bound::Unbounded));
            let records = iter.by_ref().take(take).map(to_record).collect();
            (records, iter.next().is_some())
        };

        let next = if remaining {
            records.last().map(|r| r.sort.clone())
        } else {
            None
        };
        Ok(Page { records, next })
    }
}
