//! Compensation history records.
//!
//! A [`HistoryRecord`] is sealed once: every field is private, there are no
//! setters, and the record carries a SHA-256 link to its predecessor so any
//! later edit to stored bytes is detectable.

use crate::enums::ChangeType;
use crate::identity::{compute_content_hash, ContentHash, RecordId, Timestamp, UserId};
use crate::error::LedgerError;
use crate::money::{round_money, Money};
use crate::PayvaultResult;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Request context captured alongside a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: Timestamp,
}

impl ChangeMetadata {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            ip_address: None,
            user_agent: None,
            timestamp,
        }
    }

    pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Inclusive time window for history queries. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn since(from: Timestamp) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

/// Classify a mutation from its before/after figures.
///
/// Salary wins over commission; an absent side differs from a present one.
pub fn classify_change(old: Option<&Money>, new: Option<&Money>) -> ChangeType {
    let euro = |m: Option<&Money>| m.map(Money::euro_amount);
    let commission = |m: Option<&Money>| m.map(Money::commission);

    if euro(old) != euro(new) {
        ChangeType::SalaryChange
    } else if commission(old) != commission(new) {
        ChangeType::CommissionChange
    } else {
        ChangeType::GeneralUpdate
    }
}

/// Everything a caller supplies for one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDraft {
    pub subject_id: UserId,
    pub old_money: Option<Money>,
    pub new_money: Option<Money>,
    pub changed_by: UserId,
    pub reason: Option<String>,
    pub metadata: ChangeMetadata,
}

/// One immutable entry in the compensation ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    id: RecordId,
    sequence: u64,
    subject_id: UserId,
    old_money: Option<Money>,
    new_money: Option<Money>,
    changed_by: UserId,
    reason: Option<String>,
    change_type: ChangeType,
    metadata: ChangeMetadata,
    created_at: Timestamp,
    #[serde(with = "hex_hash")]
    prev_hash: ContentHash,
    #[serde(with = "hex_hash")]
    record_hash: ContentHash,
}

/// Fields covered by `record_hash`.
#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a RecordId,
    sequence: u64,
    subject_id: UserId,
    old_money: &'a Option<Money>,
    new_money: &'a Option<Money>,
    changed_by: UserId,
    reason: &'a Option<String>,
    change_type: ChangeType,
    metadata: &'a ChangeMetadata,
    created_at: &'a Timestamp,
    prev_hash: String,
}

impl HistoryRecord {
    /// Seal a draft into a record linked to `prev_hash`.
    pub fn seal(
        draft: ChangeDraft,
        id: RecordId,
        sequence: u64,
        created_at: Timestamp,
        prev_hash: ContentHash,
    ) -> PayvaultResult<Self> {
        let change_type = classify_change(draft.old_money.as_ref(), draft.new_money.as_ref());
        let mut record = Self {
            id,
            sequence,
            subject_id: draft.subject_id,
            old_money: draft.old_money,
            new_money: draft.new_money,
            changed_by: draft.changed_by,
            reason: draft.reason,
            change_type,
            metadata: draft.metadata,
            created_at,
            prev_hash,
            record_hash: [0u8; 32],
        };
        record.record_hash = record.compute_hash()?;
        Ok(record)
    }

    /// Hash of the record's content and its predecessor link.
    pub fn compute_hash(&self) -> PayvaultResult<ContentHash> {
        let input = HashInput {
            id: &self.id,
            sequence: self.sequence,
            subject_id: self.subject_id,
            old_money: &self.old_money,
            new_money: &self.new_money,
            changed_by: self.changed_by,
            reason: &self.reason,
            change_type: self.change_type,
            metadata: &self.metadata,
            created_at: &self.created_at,
            prev_hash: hex::encode(self.prev_hash),
        };
        let canonical = serde_json::to_vec(&input).map_err(|e| LedgerError::Encoding {
            reason: e.to_string(),
        })?;
        Ok(compute_content_hash(&canonical))
    }

    /// True when the stored hash matches the content and `expected_prev`.
    pub fn verify(&self, expected_prev: &ContentHash) -> PayvaultResult<bool> {
        if &self.prev_hash != expected_prev {
            return Ok(false);
        }
        Ok(self.compute_hash()? == self.record_hash)
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn subject_id(&self) -> UserId {
        self.subject_id
    }

    pub fn old_money(&self) -> Option<&Money> {
        self.old_money.as_ref()
    }

    pub fn new_money(&self) -> Option<&Money> {
        self.new_money.as_ref()
    }

    pub fn changed_by(&self) -> UserId {
        self.changed_by
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn metadata(&self) -> &ChangeMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn prev_hash(&self) -> &ContentHash {
        &self.prev_hash
    }

    pub fn record_hash(&self) -> &ContentHash {
        &self.record_hash
    }

    // ------------------------------------------------------------------------
    // Derived metrics. `None` / `false` when either side is absent.
    // ------------------------------------------------------------------------

    fn both(&self) -> Option<(&Money, &Money)> {
        Some((self.old_money.as_ref()?, self.new_money.as_ref()?))
    }

    pub fn is_increase(&self) -> bool {
        self.both()
            .is_some_and(|(old, new)| new.euro_amount() > old.euro_amount())
    }

    pub fn is_decrease(&self) -> bool {
        self.both()
            .is_some_and(|(old, new)| new.euro_amount() < old.euro_amount())
    }

    pub fn delta_euro(&self) -> Option<Decimal> {
        self.both()
            .map(|(old, new)| round_money(new.euro_amount() - old.euro_amount()))
    }

    pub fn delta_commission(&self) -> Option<Decimal> {
        self.both()
            .map(|(old, new)| round_money(new.commission() - old.commission()))
    }

    pub fn delta_displayed(&self) -> Option<Decimal> {
        self.both()
            .map(|(old, new)| round_money(new.displayed() - old.displayed()))
    }

    /// Relative change of the euro amount in percent. Unavailable when the
    /// previous amount is zero.
    pub fn percentage_change(&self) -> Option<Decimal> {
        let (old, new) = self.both()?;
        if old.euro_amount().is_zero() {
            return None;
        }
        let ratio = (new.euro_amount() - old.euro_amount()) / old.euro_amount();
        Some(round_money(ratio * Decimal::ONE_HUNDRED))
    }
}

mod hex_hash {
    use crate::identity::ContentHash;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &ContentHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ContentHash, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_money() -> impl Strategy<Value = Money> {
        (0i64..100_000_000, 0i64..1_000_000).prop_map(|(euro, commission)| {
            Money::from_euro(Decimal::new(euro, 2), Decimal::new(commission, 2))
        })
    }

    proptest! {
        /// Classification depends only on the two figures and follows the
        /// salary > commission > general precedence.
        #[test]
        fn prop_classification_is_deterministic(old in arb_money(), new in arb_money()) {
            let first = classify_change(Some(&old), Some(&new));
            let second = classify_change(Some(&old), Some(&new));
            prop_assert_eq!(first, second);

            let expected = if old.euro_amount() != new.euro_amount() {
                ChangeType::SalaryChange
            } else if old.commission() != new.commission() {
                ChangeType::CommissionChange
            } else {
                ChangeType::GeneralUpdate
            };
            prop_assert_eq!(first, expected);
        }
    }
}
