//! In-memory datastore and unit of work.
//!
//! Compensation records and the history ledger live in one [`Datastore`] so
//! that a record write and its ledger entry commit together or not at all.
//! Writes are staged on a [`Transaction`] and applied under a single write
//! lock on commit. Dropping a transaction without committing discards it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use payvault_core::{
    ContentHash, HistoryRecord, LedgerError, Money, PayvaultResult, RecordId, StorageError,
    Timestamp, UserId, GENESIS_HASH,
};
use serde::{Deserialize, Serialize};

/// Current compensation of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    pub user_id: UserId,
    pub money: Money,
    pub department: Option<String>,
    pub updated_at: Timestamp,
}

/// Committed state.
#[derive(Debug, Default)]
pub(crate) struct DataState {
    pub(crate) records: HashMap<UserId, CompensationRecord>,
    pub(crate) history: Vec<HistoryRecord>,
    pub(crate) history_index: HashMap<RecordId, usize>,
}

impl DataState {
    /// Sequence and hash the next appended record must chain onto.
    pub(crate) fn history_tail(&self) -> (u64, ContentHash) {
        match self.history.last() {
            Some(last) => (last.sequence() + 1, *last.record_hash()),
            None => (0, GENESIS_HASH),
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    UpsertRecord(CompensationRecord),
    AppendHistory(HistoryRecord),
}

/// Shared in-memory storage engine.
#[derive(Debug, Default)]
pub struct Datastore {
    state: RwLock<DataState>,
}

impl Datastore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a unit of work against this store.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction {
            store: Arc::clone(self),
            staged: Vec::new(),
            open: true,
        }
    }

    pub(crate) fn read(&self) -> PayvaultResult<RwLockReadGuard<'_, DataState>> {
        self.state
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn apply(&self, staged: Vec<Mutation>) -> PayvaultResult<CommitReceipt> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        // Validate every staged ledger entry against the committed tail
        // before touching anything.
        let (mut next_sequence, mut prev_hash) = state.history_tail();
        for mutation in &staged {
            if let Mutation::AppendHistory(record) = mutation {
                if record.sequence() != next_sequence || record.prev_hash() != &prev_hash {
                    return Err(StorageError::TransactionFailed {
                        reason: format!(
                            "history ledger advanced past sequence {} since the transaction began",
                            record.sequence()
                        ),
                    }
                    .into());
                }
                if !record.verify(&prev_hash)? {
                    return Err(LedgerError::ChainBroken {
                        sequence: record.sequence(),
                    }
                    .into());
                }
                next_sequence += 1;
                prev_hash = *record.record_hash();
            }
        }

        let mut receipt = CommitReceipt::default();
        for mutation in staged {
            match mutation {
                Mutation::UpsertRecord(record) => {
                    receipt.records.push(record.user_id);
                    state.records.insert(record.user_id, record);
                }
                Mutation::AppendHistory(record) => {
                    let position = state.history.len();
                    state.history_index.insert(record.id(), position);
                    receipt.history.push(record.id());
                    state.history.push(record);
                }
            }
        }
        Ok(receipt)
    }
}

/// What a commit applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub records: Vec<UserId>,
    pub history: Vec<RecordId>,
}

/// Pending writes against a [`Datastore`].
#[derive(Debug)]
pub struct Transaction {
    store: Arc<Datastore>,
    staged: Vec<Mutation>,
    open: bool,
}

impl Transaction {
    /// Stage a record write.
    pub fn upsert_record(&mut self, record: CompensationRecord) -> PayvaultResult<()> {
        self.ensure_open()?;
        self.staged.push(Mutation::UpsertRecord(record));
        Ok(())
    }

    /// Stage a sealed ledger entry.
    pub(crate) fn stage_history(&mut self, record: HistoryRecord) -> PayvaultResult<()> {
        self.ensure_open()?;
        self.staged.push(Mutation::AppendHistory(record));
        Ok(())
    }

    /// Tail to chain the next ledger entry onto, including entries staged in
    /// this transaction.
    pub(crate) fn history_tail(&self) -> PayvaultResult<(u64, ContentHash)> {
        self.ensure_open()?;
        let staged = self.staged.iter().rev().find_map(|mutation| match mutation {
            Mutation::AppendHistory(record) => Some(record),
            Mutation::UpsertRecord(_) => None,
        });
        match staged {
            Some(record) => Ok((record.sequence() + 1, *record.record_hash())),
            None => Ok(self.store.read()?.history_tail()),
        }
    }

    /// Staged record for `user_id`, if this transaction wrote one.
    pub fn staged_record(&self, user_id: UserId) -> Option<&CompensationRecord> {
        self.staged.iter().rev().find_map(|mutation| match mutation {
            Mutation::UpsertRecord(record) if record.user_id == user_id => Some(record),
            _ => None,
        })
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Apply every staged write atomically.
    pub fn commit(mut self) -> PayvaultResult<CommitReceipt> {
        self.ensure_open()?;
        self.open = false;
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        let receipt = self.store.apply(staged)?;
        tracing::debug!(writes = count, "Committed transaction");
        Ok(receipt)
    }

    /// Discard every staged write.
    pub fn rollback(mut self) -> PayvaultResult<()> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }

    fn discard(&mut self) {
        self.open = false;
        if !self.staged.is_empty() {
            tracing::debug!(writes = self.staged.len(), "Rolled back transaction");
        }
        self.staged.clear();
    }

    fn ensure_open(&self) -> PayvaultResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(LedgerError::TransactionClosed.into())
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payvault_core::{Decimal, PayvaultError};

    fn record(user: u64, euro: i64) -> CompensationRecord {
        CompensationRecord {
            user_id: UserId::new(user),
            money: Money::from_euro(Decimal::from(euro), Decimal::ZERO),
            department: Some("engineering".to_string()),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_commit_applies_staged_writes() {
        let store = Datastore::new();
        let mut tx = store.begin();
        tx.upsert_record(record(1, 40_000)).expect("stage");
        tx.upsert_record(record(2, 50_000)).expect("stage");
        assert_eq!(tx.len(), 2);
        assert!(store.read().expect("read").records.is_empty());

        let receipt = tx.commit().expect("commit");
        assert_eq!(receipt.records, vec![UserId::new(1), UserId::new(2)]);
        assert_eq!(store.read().expect("read").records.len(), 2);
    }

    #[test]
    fn test_rollback_and_drop_discard() {
        let store = Datastore::new();

        let mut tx = store.begin();
        tx.upsert_record(record(1, 40_000)).expect("stage");
        tx.rollback().expect("rollback");

        {
            let mut tx = store.begin();
            tx.upsert_record(record(2, 40_000)).expect("stage");
        }

        assert!(store.read().expect("read").records.is_empty());
    }

    #[test]
    fn test_staged_record_is_visible_inside_transaction() {
        let store = Datastore::new();
        let mut tx = store.begin();
        tx.upsert_record(record(1, 40_000)).expect("stage");
        tx.upsert_record(record(1, 45_000)).expect("stage");

        let staged = tx.staged_record(UserId::new(1)).expect("staged");
        assert_eq!(staged.money.euro_amount(), Decimal::from(45_000));
        assert!(tx.staged_record(UserId::new(2)).is_none());
    }

    #[test]
    fn test_empty_ledger_tail_is_genesis() {
        let store = Datastore::new();
        let tx = store.begin();
        assert_eq!(tx.history_tail().expect("tail"), (0, GENESIS_HASH));
    }

    #[test]
    fn test_closed_error_is_ledger_error() {
        let err: PayvaultError = LedgerError::TransactionClosed.into();
        assert!(matches!(err, PayvaultError::Ledger(LedgerError::TransactionClosed)));
    }
}
