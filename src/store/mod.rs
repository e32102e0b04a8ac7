pub mod feed;
pub mod table;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Load, LoadEvent, LoadId, Snapshot, TransitionError, sort_newest_first};
use crate::observability::metrics::Metrics;

pub use feed::{ChangeFeed, FeedError, FeedSubscription};
pub use table::{LoadTable, MemoryTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("load {0} not found")]
    NotFound(LoadId),

    #[error("load {0} already exists")]
    Duplicate(LoadId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of a compare-and-swap. A version mismatch is a race, not a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied { load: Load, sequence: u64 },
    Stale(Load),
}

/// Names one logical write across all of its retries.
///
/// Only the holder of the token that produced an unacknowledged write can
/// later claim it as its own; every other caller sees it as a competing
/// write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteToken(u64);

/// A put that reported failure and whose read-back failed too, so nobody
/// knows yet whether it landed.
struct InDoubt {
    token: WriteToken,
    attempted: Load,
    /// Set once the write was found in the table and published.
    published: Option<LoadEvent>,
}

#[derive(Default)]
struct Ledger {
    in_doubt: HashMap<LoadId, InDoubt>,
}

/// Authoritative load table plus its change feed.
///
/// Every write goes through the commit lock: the table write and the feed
/// append happen under it, so a mutation that reached the table always
/// reached the feed, and snapshots taken under it line up exactly with a
/// feed position. Reads do not take it while nothing is in doubt.
///
/// A write whose outcome cannot be determined is held in doubt. The next
/// read or write that touches the same load settles it against the table:
/// if it landed it is published before anything else is done with it.
pub struct LoadStore {
    table: Arc<dyn LoadTable>,
    feed: ChangeFeed,
    commit: Mutex<Ledger>,
    /// In-doubt writes not yet settled; lets reads skip the lock when zero.
    unsettled: AtomicUsize,
    next_token: AtomicU64,
    metrics: Metrics,
}

impl LoadStore {
    pub fn new(table: Arc<dyn LoadTable>, feed_capacity: usize, metrics: Metrics) -> Self {
        Self {
            table,
            feed: ChangeFeed::new(feed_capacity),
            commit: Mutex::new(Ledger::default()),
            unsettled: AtomicUsize::new(0),
            next_token: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn in_memory(feed_capacity: usize, metrics: Metrics) -> Self {
        Self::new(Arc::new(MemoryTable::new()), feed_capacity, metrics)
    }

    /// A fresh token; reuse it for every retry of the same logical write.
    pub fn write_token(&self) -> WriteToken {
        WriteToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, id: LoadId) -> Result<Load, StoreError> {
        if self.unsettled.load(Ordering::SeqCst) > 0 {
            let mut ledger = self.lock();
            let current = self.table.get(&id)?;
            self.settle(&mut ledger, id, current.as_ref(), None);
            return current.ok_or(StoreError::NotFound(id));
        }
        self.table.get(&id)?.ok_or(StoreError::NotFound(id))
    }

    /// Persists a freshly created record and publishes it.
    pub fn insert(&self, load: Load) -> Result<LoadEvent, StoreError> {
        self.insert_as(self.write_token(), load)
    }

    /// [`insert`](Self::insert) on behalf of `token`. A retry whose earlier
    /// attempt landed unacknowledged gets that attempt's event back instead
    /// of `Duplicate`.
    pub fn insert_as(&self, token: WriteToken, load: Load) -> Result<LoadEvent, StoreError> {
        let mut ledger = self.lock();

        let current = self.table.get(&load.id)?;
        if let Some(event) = self.settle(&mut ledger, load.id, current.as_ref(), Some(token)) {
            return Ok(event);
        }
        if current.is_some() {
            return Err(StoreError::Duplicate(load.id));
        }

        self.write(&mut ledger, token, load.clone())?;
        Ok(self.publish(load))
    }

    /// Applies `mutator` only when the stored version equals
    /// `expected_version`; the stored result carries `version + 1`.
    /// On mismatch the current record is returned untouched. The mutator
    /// must not change `id` or `version`.
    pub fn conditional_update<F>(
        &self,
        id: LoadId,
        expected_version: u64,
        mutator: F,
    ) -> Result<CasOutcome, StoreError>
    where
        F: FnOnce(&mut Load) -> Result<(), TransitionError>,
    {
        self.conditional_update_as(self.write_token(), id, expected_version, mutator)
    }

    /// [`conditional_update`](Self::conditional_update) on behalf of
    /// `token`. A retry whose earlier attempt landed unacknowledged gets
    /// `Applied` for that attempt; anyone else gets `Stale`.
    pub fn conditional_update_as<F>(
        &self,
        token: WriteToken,
        id: LoadId,
        expected_version: u64,
        mutator: F,
    ) -> Result<CasOutcome, StoreError>
    where
        F: FnOnce(&mut Load) -> Result<(), TransitionError>,
    {
        let mut ledger = self.lock();

        let current = self.table.get(&id)?;
        if let Some(event) = self.settle(&mut ledger, id, current.as_ref(), Some(token)) {
            return Ok(CasOutcome::Applied {
                sequence: event.sequence,
                load: event.load,
            });
        }

        let current = current.ok_or(StoreError::NotFound(id))?;
        if current.version != expected_version {
            debug!(
                load_id = %id,
                expected_version,
                current_version = current.version,
                "conditional update lost on version"
            );
            return Ok(CasOutcome::Stale(current));
        }

        let mut next = current.clone();
        mutator(&mut next)?;
        next.id = current.id;
        next.version = current.version + 1;

        self.write(&mut ledger, token, next.clone())?;
        let event = self.publish(next.clone());

        Ok(CasOutcome::Applied {
            load: next,
            sequence: event.sequence,
        })
    }

    /// All loads, newest first.
    pub fn scan(&self) -> Result<Vec<Load>, StoreError> {
        if self.unsettled.load(Ordering::SeqCst) > 0 {
            let mut ledger = self.lock();
            self.settle_all(&mut ledger)?;
        }
        self.scan_table()
    }

    /// Captures a snapshot and a feed subscription at the same feed
    /// position: every mutation is either in the snapshot or delivered by
    /// the subscription, never both. Writes still in doubt are settled
    /// first so the snapshot never holds an unpublished record.
    pub fn snapshot_and_subscribe(&self) -> Result<(Snapshot, FeedSubscription), StoreError> {
        let mut ledger = self.lock();
        self.settle_all(&mut ledger)?;

        let subscription = self.feed.subscribe();
        let loads = self.scan_table()?;
        let snapshot = Snapshot {
            as_of: subscription.last_sequence(),
            loads,
        };

        Ok((snapshot, subscription))
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// A failed put may still have landed (the acknowledgement was lost).
    /// If the table now holds exactly what was written, treat it as written.
    /// If the table cannot be read back either, the write is held in doubt
    /// until a later operation on the same load can settle it.
    fn write(&self, ledger: &mut Ledger, token: WriteToken, load: Load) -> Result<(), StoreError> {
        let Err(err) = self.table.put(load.clone()) else {
            return Ok(());
        };

        match self.table.get(&load.id) {
            Ok(Some(stored)) if stored == load => {
                warn!(load_id = %load.id, error = %err, "write reported failure but landed");
                Ok(())
            }
            Ok(_) => Err(err),
            Err(read_err) => {
                warn!(
                    load_id = %load.id,
                    version = load.version,
                    error = %err,
                    read_error = %read_err,
                    "write outcome unknown; holding it in doubt"
                );
                ledger.in_doubt.insert(
                    load.id,
                    InDoubt {
                        token,
                        attempted: load,
                        published: None,
                    },
                );
                self.unsettled.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Settles the in-doubt write on `id`, if any, against `current`.
    ///
    /// A write that landed is published exactly once. It is handed back
    /// only to `claimant` holding the token that produced it; for everyone
    /// else it stays recorded so its owner can still claim it.
    fn settle(
        &self,
        ledger: &mut Ledger,
        id: LoadId,
        current: Option<&Load>,
        claimant: Option<WriteToken>,
    ) -> Option<LoadEvent> {
        let entry = ledger.in_doubt.get_mut(&id)?;

        if entry.published.is_none() {
            self.unsettled.fetch_sub(1, Ordering::SeqCst);
            if current != Some(&entry.attempted) {
                debug!(load_id = %id, "write held in doubt never landed");
                ledger.in_doubt.remove(&id);
                return None;
            }
            warn!(
                load_id = %id,
                version = entry.attempted.version,
                "publishing unacknowledged write found in the table"
            );
            entry.published = Some(self.publish(entry.attempted.clone()));
        }

        if claimant != Some(entry.token) {
            return None;
        }
        ledger.in_doubt.remove(&id).and_then(|entry| entry.published)
    }

    fn settle_all(&self, ledger: &mut Ledger) -> Result<(), StoreError> {
        let pending: Vec<LoadId> = ledger
            .in_doubt
            .iter()
            .filter(|(_, entry)| entry.published.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            let current = self.table.get(&id)?;
            self.settle(ledger, id, current.as_ref(), None);
        }
        Ok(())
    }

    fn scan_table(&self) -> Result<Vec<Load>, StoreError> {
        let mut loads = self.table.scan()?;
        sort_newest_first(&mut loads);
        Ok(loads)
    }

    fn publish(&self, load: Load) -> LoadEvent {
        let event = self.feed.append(load);
        self.metrics.feed_events_total.inc();
        debug!(load_id = %event.load_id, sequence = event.sequence, "mutation published");
        event
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        // Ledger entries are inserted and removed whole, so a poisoned lock
        // leaves nothing torn.
        self.commit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
