//! Relationship-driven cache invalidation.
//!
//! A write to an entity maps to two things: a handful of direct per-user
//! keys, and a set of tags from a static relationship table. The router
//! forgets the keys and evicts the tags. It never fails the write that
//! triggered it: failures are logged and kept as pending work that is
//! retried on the next invalidation of the same entity.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use payvault_core::{EntityType, PayvaultResult, UserId};

use crate::cache::CacheStore;

/// Tag names shared by the router, the warmer and the compensation reads.
pub mod tags {
    pub const SALARIES: &str = "salaries";
    pub const STATISTICS: &str = "statistics";
    pub const USERS: &str = "users";
}

const SALARY_TAGS: &[&str] = &[tags::SALARIES, tags::STATISTICS];
const HISTORY_TAGS: &[&str] = &[tags::STATISTICS];
const USER_TAGS: &[&str] = &[tags::USERS, tags::STATISTICS];

/// Entity type -> tags affected by any write to it.
static RELATIONSHIPS: Lazy<HashMap<EntityType, &'static [&'static str]>> = Lazy::new(|| {
    HashMap::from([
        (EntityType::Salary, SALARY_TAGS),
        (EntityType::SalaryHistory, HISTORY_TAGS),
        (EntityType::User, USER_TAGS),
        (EntityType::Department, USER_TAGS),
        (EntityType::CurrencyRate, SALARY_TAGS),
    ])
});

/// Direct cache keys for one user.
pub fn user_data_key(user_id: UserId) -> String {
    format!("user:{}:data", user_id)
}

pub fn user_salary_key(user_id: UserId) -> String {
    format!("user:{}:salary", user_id)
}

pub fn user_history_key(user_id: UserId) -> String {
    format!("user:{}:history", user_id)
}

/// Extra facts about a write that refine which caches it touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationContext {
    /// User whose per-user keys are affected.
    pub user_id: Option<UserId>,
    /// A `user` write also changed compensation (department move, etc.).
    pub salary_affected: bool,
}

impl InvalidationContext {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            salary_affected: false,
        }
    }

    pub fn with_salary_affected(mut self) -> Self {
        self.salary_affected = true;
        self
    }
}

/// Keys and tags one invalidation resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub keys: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl InvalidationPlan {
    fn merge(&mut self, other: InvalidationPlan) {
        self.keys.extend(other.keys);
        self.tags.extend(other.tags);
    }
}

/// Result of one `invalidate` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub keys_forgotten: u64,
    pub tag_evictions: u64,
    /// The plan could not be applied and was kept for retry.
    pub deferred: bool,
}

/// Resolve the keys and tags for a write, or `None` for an unknown entity
/// type.
pub fn resolve(
    entity_type: &str,
    entity_id: &str,
    context: &InvalidationContext,
) -> Option<InvalidationPlan> {
    let entity = EntityType::from_str(entity_type).ok()?;
    let mut plan = InvalidationPlan::default();

    if let Some(related) = RELATIONSHIPS.get(&entity) {
        plan.tags.extend(related.iter().map(|tag| tag.to_string()));
    }
    if entity == EntityType::User && context.salary_affected {
        plan.tags.insert(tags::SALARIES.to_string());
    }

    let subject = match entity {
        EntityType::User => entity_id.parse::<UserId>().ok().or(context.user_id),
        EntityType::Salary | EntityType::SalaryHistory => context.user_id,
        EntityType::Department | EntityType::CurrencyRate => None,
    };
    if let Some(user_id) = subject {
        plan.keys.insert(user_data_key(user_id));
        plan.keys.insert(user_salary_key(user_id));
        plan.keys.insert(user_history_key(user_id));
    }

    Some(plan)
}

/// Applies invalidation plans to a [`CacheStore`].
pub struct InvalidationRouter {
    cache: Arc<CacheStore>,
    pending: DashMap<(String, String), InvalidationPlan>,
}

impl InvalidationRouter {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            pending: DashMap::new(),
        }
    }

    /// Invalidate everything a write to `entity_type`/`entity_id` affects.
    ///
    /// Unknown entity types are ignored. Cache failures are logged and the
    /// plan is kept for the next invalidation of the same entity; they are
    /// never returned to the caller.
    pub async fn invalidate(
        &self,
        entity_type: &str,
        entity_id: &str,
        context: &InvalidationContext,
    ) -> InvalidationReport {
        let Some(mut plan) = resolve(entity_type, entity_id, context) else {
            tracing::debug!(entity_type, entity_id, "No invalidation rules for entity type");
            return InvalidationReport::default();
        };

        let entity = (entity_type.to_string(), entity_id.to_string());
        if let Some((_, earlier)) = self.pending.remove(&entity) {
            tracing::info!(entity_type, entity_id, "Retrying deferred invalidation");
            plan.merge(earlier);
        }

        match self.apply(&plan).await {
            Ok(report) => {
                tracing::debug!(
                    entity_type,
                    entity_id,
                    keys_forgotten = report.keys_forgotten,
                    tag_evictions = report.tag_evictions,
                    "Invalidated cache"
                );
                report
            }
            Err(e) => {
                tracing::error!(
                    entity_type,
                    entity_id,
                    error = %e,
                    "Cache invalidation failed, deferring"
                );
                self.pending
                    .entry(entity)
                    .and_modify(|existing| existing.merge(plan.clone()))
                    .or_insert(plan);
                InvalidationReport {
                    deferred: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Retry every deferred plan. Returns how many are still pending.
    pub async fn retry_pending(&self) -> usize {
        let entities: Vec<(String, String)> =
            self.pending.iter().map(|entry| entry.key().clone()).collect();
        for entity in entities {
            let Some((_, plan)) = self.pending.remove(&entity) else {
                continue;
            };
            if let Err(e) = self.apply(&plan).await {
                tracing::warn!(entity_type = %entity.0, entity_id = %entity.1, error = %e, "Deferred invalidation still failing");
                self.pending
                    .entry(entity)
                    .and_modify(|existing| existing.merge(plan.clone()))
                    .or_insert(plan);
            }
        }
        self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn apply(&self, plan: &InvalidationPlan) -> PayvaultResult<InvalidationReport> {
        let mut keys_forgotten = 0;
        for key in &plan.keys {
            if self.cache.forget(key).await? {
                keys_forgotten += 1;
            }
        }
        let tags: Vec<&str> = plan.tags.iter().map(String::as_str).collect();
        let tag_evictions = self.cache.forget_by_tags(&tags).await?;
        Ok(InvalidationReport {
            keys_forgotten,
            tag_evictions,
            deferred: false,
        })
    }
}
