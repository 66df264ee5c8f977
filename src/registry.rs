//! Registry of outstanding queries.
//!
//! Queries complete out of order, can be cancelled at any time, and new
//! identifiers must be probed for collisions, so records live in one
//! `BTreeMap` keyed by [`QueryId`]. The map owns every record; everything
//! outside refers to a query only by its id.

use crate::error::{ContextError, Result};
use crate::query::{Answer, Query};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of an outstanding query, unique among pending records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Callback receiving the outcome of an async query exactly once.
pub type Callback = Box<dyn FnOnce(Result<Answer>) + Send + 'static>;

/// Slot a synchronous caller waits on until its outcome is delivered.
#[derive(Debug, Default)]
pub struct ResultSlot(Mutex<Option<Result<Answer>>>);

impl ResultSlot {
    /// Stores the outcome. A second fill replaces nothing and is ignored.
    pub fn fill(&self, outcome: Result<Answer>) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    /// Takes the outcome if it has arrived.
    pub fn take(&self) -> Option<Result<Answer>> {
        self.0.lock().take()
    }
}

/// How the outcome of a query reaches its caller.
pub enum Delivery {
    /// A blocked caller waits on the slot.
    Sync(Arc<ResultSlot>),
    /// The callback is invoked by whichever thread drains the result.
    Async(Callback),
}

impl Delivery {
    #[must_use]
    pub const fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Sync"),
            Self::Async(_) => f.write_str("Async"),
        }
    }
}

/// One outstanding query.
#[derive(Debug)]
pub struct QueryRecord {
    pub id: QueryId,
    pub query: Query,
    pub delivery: Delivery,
}

/// Uniquely keyed index of pending queries.
///
/// Not synchronized by itself; the context keeps it behind its own lock so
/// allocation, lookup and removal are each one atomic step.
#[derive(Debug)]
pub struct QueryRegistry {
    queries: BTreeMap<QueryId, QueryRecord>,
    next_id: u32,
    max_id: u32,
    async_pending: usize,
}

impl QueryRegistry {
    /// Creates an empty registry handing out ids from `1..=max_id`.
    ///
    /// A `max_id` of zero is treated as one.
    #[must_use]
    pub fn new(max_id: u32) -> Self {
        Self {
            queries: BTreeMap::new(),
            next_id: 1,
            max_id: max_id.max(1),
            async_pending: 0,
        }
    }

    /// Picks a free id starting at the next candidate and records the query
    /// under it.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Capacity`] when every id in the space is taken.
    pub fn allocate_and_insert(&mut self, query: Query, delivery: Delivery) -> Result<QueryId> {
        if self.queries.len() >= self.max_id as usize {
            return Err(ContextError::Capacity { max: self.max_id });
        }

        let mut candidate = self.next_id;
        let mut probes = 0u32;
        while self.queries.contains_key(&QueryId(candidate)) {
            probes += 1;
            if probes >= self.max_id {
                return Err(ContextError::Capacity { max: self.max_id });
            }
            candidate = self.successor(candidate);
        }

        let id = QueryId(candidate);
        if delivery.is_async() {
            self.async_pending += 1;
        }
        self.queries.insert(
            id,
            QueryRecord {
                id,
                query,
                delivery,
            },
        );
        self.next_id = self.successor(candidate);
        Ok(id)
    }

    /// Removes and returns the record for `id`, if it is still pending.
    pub fn lookup_and_remove(&mut self, id: QueryId) -> Option<QueryRecord> {
        let record = self.queries.remove(&id)?;
        if record.delivery.is_async() {
            self.async_pending -= 1;
        }
        Some(record)
    }

    /// Removes a pending async record. Sync, finished or unknown ids are left
    /// alone and yield `None`.
    pub fn cancel(&mut self, id: QueryId) -> Option<QueryRecord> {
        if !self.queries.get(&id)?.delivery.is_async() {
            return None;
        }
        self.lookup_and_remove(id)
    }

    /// Removes every record, in id order.
    pub fn drain(&mut self) -> Vec<QueryRecord> {
        self.async_pending = 0;
        std::mem::take(&mut self.queries).into_values().collect()
    }

    #[must_use]
    pub fn contains(&self, id: QueryId) -> bool {
        self.queries.contains_key(&id)
    }

    /// Number of pending records, sync and async.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Number of pending async records.
    #[must_use]
    pub const fn async_pending(&self) -> usize {
        self.async_pending
    }

    const fn successor(&self, id: u32) -> u32 {
        if id >= self.max_id { 1 } else { id + 1 }
    }
}
