//! Append-only compensation history ledger.
//!
//! Every change to a compensation record is appended here inside the same
//! [`Transaction`] as the record write. Records are sealed on append: the
//! ledger assigns the id, sequence, timestamp and hash-chain link, and
//! offers no way to alter or remove a record afterwards.

use std::sync::Arc;

use payvault_core::{
    new_record_id, ChangeDraft, ChangeMetadata, ChangeType, Clock, HistoryRecord, LedgerError,
    Money, PayvaultResult, RecordId, TimeRange, UserId, GENESIS_HASH,
};

use crate::unit_of_work::{Datastore, Transaction};

pub struct HistoryLedger {
    store: Arc<Datastore>,
    clock: Arc<dyn Clock>,
}

impl HistoryLedger {
    pub fn new(store: Arc<Datastore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Seal a change into a record and stage it on `tx`.
    ///
    /// The change type is derived from the two money values. The record is
    /// only visible to queries once `tx` commits.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        tx: &mut Transaction,
        subject_id: UserId,
        old_money: Option<Money>,
        new_money: Option<Money>,
        changed_by: UserId,
        reason: Option<String>,
        metadata: ChangeMetadata,
    ) -> PayvaultResult<HistoryRecord> {
        self.append_draft(
            tx,
            ChangeDraft {
                subject_id,
                old_money,
                new_money,
                changed_by,
                reason,
                metadata,
            },
        )
    }

    pub fn append_draft(
        &self,
        tx: &mut Transaction,
        draft: ChangeDraft,
    ) -> PayvaultResult<HistoryRecord> {
        let (sequence, prev_hash) = tx.history_tail()?;
        let record =
            HistoryRecord::seal(draft, new_record_id(), sequence, self.clock.now(), prev_hash)?;
        tx.stage_history(record.clone())?;
        tracing::debug!(
            record_id = %record.id(),
            subject_id = %record.subject_id(),
            sequence,
            change_type = %record.change_type(),
            "Staged history record"
        );
        Ok(record)
    }

    /// History records cannot be changed.
    pub fn update(&self, record_id: RecordId) -> PayvaultResult<()> {
        Err(immutable(record_id, "update"))
    }

    /// History records cannot be removed.
    pub fn delete(&self, record_id: RecordId) -> PayvaultResult<()> {
        Err(immutable(record_id, "delete"))
    }

    pub fn get(&self, record_id: RecordId) -> PayvaultResult<Option<HistoryRecord>> {
        let state = self.store.read()?;
        Ok(state
            .history_index
            .get(&record_id)
            .and_then(|&position| state.history.get(position))
            .cloned())
    }

    /// Records about `subject_id` created within `range`, newest first.
    pub fn query_by_subject(
        &self,
        subject_id: UserId,
        range: TimeRange,
    ) -> PayvaultResult<Vec<HistoryRecord>> {
        self.select(|record| record.subject_id() == subject_id && range.contains(record.created_at()))
    }

    pub fn query_by_change_type(&self, change_type: ChangeType) -> PayvaultResult<Vec<HistoryRecord>> {
        self.select(|record| record.change_type() == change_type)
    }

    /// Records authored by `changed_by`, newest first.
    pub fn query_by_changer(&self, changed_by: UserId) -> PayvaultResult<Vec<HistoryRecord>> {
        self.select(|record| record.changed_by() == changed_by)
    }

    /// The `limit` most recent records across all subjects.
    pub fn recent(&self, limit: usize) -> PayvaultResult<Vec<HistoryRecord>> {
        let mut records = self.select(|_| true)?;
        records.truncate(limit);
        Ok(records)
    }

    pub fn len(&self) -> PayvaultResult<usize> {
        Ok(self.store.read()?.history.len())
    }

    pub fn is_empty(&self) -> PayvaultResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Walk the whole chain and check every link and content hash.
    pub fn verify_chain(&self) -> PayvaultResult<()> {
        let state = self.store.read()?;
        let mut expected_prev = GENESIS_HASH;
        for (position, record) in state.history.iter().enumerate() {
            if record.sequence() != position as u64 || !record.verify(&expected_prev)? {
                tracing::error!(sequence = record.sequence(), "History chain verification failed");
                return Err(LedgerError::ChainBroken {
                    sequence: record.sequence(),
                }
                .into());
            }
            expected_prev = *record.record_hash();
        }
        Ok(())
    }

    fn select<F>(&self, mut keep: F) -> PayvaultResult<Vec<HistoryRecord>>
    where
        F: FnMut(&HistoryRecord) -> bool,
    {
        let state = self.store.read()?;
        let mut records: Vec<HistoryRecord> =
            state.history.iter().filter(|r| keep(r)).cloned().collect();
        records.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.sequence().cmp(&a.sequence()))
        });
        Ok(records)
    }
}

fn immutable(record_id: RecordId, operation: &str) -> payvault_core::PayvaultError {
    tracing::error!(%record_id, operation, "Attempted to modify an immutable history record");
    LedgerError::ImmutableRecord {
        record_id,
        operation: operation.to_string(),
    }
    .into()
}
