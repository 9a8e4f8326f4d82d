//! Named aggregates over compensation data.
//!
//! Aggregates are addressed by name only. Each name doubles as the cache key
//! the aggregate is stored under, so warming and request-time reads share
//! one entry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use payvault_core::{
    round_money, ChangeType, Decimal, HistoryRecord, PayvaultResult, RecordId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};

use crate::unit_of_work::CompensationRecord;

pub const USER_OVERVIEW: &str = "user_overview";
pub const SALARY_OVERVIEW: &str = "salary_overview";
pub const TOP_EARNERS: &str = "top_earners";
pub const CURRENCY_BREAKDOWN: &str = "currency_breakdown";
pub const RECENT_CHANGES: &str = "recent_changes";

/// Persistence collaborator that computes aggregates on demand.
#[async_trait]
pub trait AggregateSource: Send + Sync {
    /// Compute the aggregate called `name` from current data.
    ///
    /// Unknown names fail with `StorageError::UnknownAggregate`.
    async fn load_aggregate(&self, name: &str) -> PayvaultResult<serde_json::Value>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOverview {
    pub headcount: u64,
    /// Headcount per department; users without one count under "unassigned".
    pub departments: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalaryOverview {
    pub count: u64,
    pub total_displayed: Decimal,
    pub average_displayed: Option<Decimal>,
    pub min_displayed: Option<Decimal>,
    pub max_displayed: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEarner {
    pub user_id: UserId,
    pub department: Option<String>,
    pub displayed: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyTotals {
    pub count: u64,
    pub euro_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub record_id: RecordId,
    pub subject_id: UserId,
    pub changed_by: UserId,
    pub change_type: ChangeType,
    pub delta_euro: Option<Decimal>,
    pub delta_displayed: Option<Decimal>,
    pub created_at: Timestamp,
}

const UNASSIGNED: &str = "unassigned";

pub fn user_overview(records: &[CompensationRecord]) -> UserOverview {
    let mut departments = BTreeMap::new();
    for record in records {
        let department = record.department.as_deref().unwrap_or(UNASSIGNED);
        *departments.entry(department.to_string()).or_insert(0) += 1;
    }
    UserOverview {
        headcount: records.len() as u64,
        departments,
    }
}

pub fn salary_overview(records: &[CompensationRecord]) -> SalaryOverview {
    let displayed: Vec<Decimal> = records.iter().map(|r| r.money.displayed()).collect();
    let total: Decimal = displayed.iter().copied().sum();
    let count = displayed.len() as u64;
    SalaryOverview {
        count,
        total_displayed: round_money(total),
        average_displayed: (count > 0).then(|| round_money(total / Decimal::from(count))),
        min_displayed: displayed.iter().copied().min(),
        max_displayed: displayed.iter().copied().max(),
    }
}

/// Highest displayed compensation first; ties by ascending user id.
pub fn top_earners(records: &[CompensationRecord], limit: usize) -> Vec<TopEarner> {
    let mut earners: Vec<TopEarner> = records
        .iter()
        .map(|r| TopEarner {
            user_id: r.user_id,
            department: r.department.clone(),
            displayed: r.money.displayed(),
        })
        .collect();
    earners.sort_by(|a, b| {
        b.displayed
            .cmp(&a.displayed)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    earners.truncate(limit);
    earners
}

pub fn currency_breakdown(records: &[CompensationRecord]) -> BTreeMap<String, CurrencyTotals> {
    let mut breakdown: BTreeMap<String, CurrencyTotals> = BTreeMap::new();
    for record in records {
        let totals = breakdown
            .entry(record.money.currency_code().to_string())
            .or_default();
        totals.count += 1;
        totals.euro_total += record.money.euro_amount();
    }
    breakdown
}

/// `history` is expected newest first.
pub fn recent_changes(history: &[HistoryRecord], limit: usize) -> Vec<RecentChange> {
    history
        .iter()
        .take(limit)
        .map(|record| RecentChange {
            record_id: record.id(),
            subject_id: record.subject_id(),
            changed_by: record.changed_by(),
            change_type: record.change_type(),
            delta_euro: record.delta_euro(),
            delta_displayed: record.delta_displayed(),
            created_at: record.created_at(),
        })
        .collect()
}
