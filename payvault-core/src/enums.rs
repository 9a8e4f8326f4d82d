//! Enum types for PAYVAULT entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// CORE ENUMS
// ============================================================================

/// Freshness tier for cached aggregates.
///
/// Callers pick a tier rather than an arbitrary duration so that
/// time-based expiry stays predictable across the codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTtl {
    /// ~5 minutes; volatile per-user data
    Short,
    /// ~1 hour; aggregates recomputed by the warmer
    Medium,
    /// ~24 hours; slow-moving reference data
    Long,
}

impl CacheTtl {
    pub const SHORT_SECS: u64 = 300;
    pub const MEDIUM_SECS: u64 = 3_600;
    pub const LONG_SECS: u64 = 86_400;

    pub fn duration(&self) -> Duration {
        match self {
            CacheTtl::Short => Duration::from_secs(Self::SHORT_SECS),
            CacheTtl::Medium => Duration::from_secs(Self::MEDIUM_SECS),
            CacheTtl::Long => Duration::from_secs(Self::LONG_SECS),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTtl::Short => "short",
            CacheTtl::Medium => "medium",
            CacheTtl::Long => "long",
        }
    }
}

/// Entity type discriminator used by cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Salary,
    SalaryHistory,
    User,
    Department,
    CurrencyRate,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Salary,
        EntityType::SalaryHistory,
        EntityType::User,
        EntityType::Department,
        EntityType::CurrencyRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Salary => "salary",
            EntityType::SalaryHistory => "salary_history",
            EntityType::User => "user",
            EntityType::Department => "department",
            EntityType::CurrencyRate => "currency_rate",
        }
    }
}

/// Derived classification of a compensation mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    SalaryChange,
    CommissionChange,
    GeneralUpdate,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::SalaryChange => "salary_change",
            ChangeType::CommissionChange => "commission_change",
            ChangeType::GeneralUpdate => "general_update",
        }
    }
}

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl fmt::Display for CacheTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "salary" | "salaries" => Ok(EntityType::Salary),
            "salaryhistory" => Ok(EntityType::SalaryHistory),
            "user" | "users" => Ok(EntityType::User),
            "department" | "departments" => Ok(EntityType::Department),
            "currencyrate" | "currency" => Ok(EntityType::CurrencyRate),
            _ => Err(format!("Invalid EntityType: {}", s)),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "salarychange" => Ok(ChangeType::SalaryChange),
            "commissionchange" => Ok(ChangeType::CommissionChange),
            "generalupdate" => Ok(ChangeType::GeneralUpdate),
            _ => Err(format!("Invalid ChangeType: {}", s)),
        }
    }
}
