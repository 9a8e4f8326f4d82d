//! Tag index: many-to-many back-references between tags and cache keys.
//!
//! The index never owns entry content. It answers "which keys belong to
//! tag T" so invalidation can evict by exact membership instead of guessing
//! key patterns.
//!
//! # Locking
//!
//! Both directions are sharded `DashMap`s, so registering a key under
//! `users` never contends with evicting `salaries` unless the two tags hash
//! to the same shard. No operation holds locks on both maps at once.
//!
//! # Generations
//!
//! Every tag and key carries a generation that is bumped whenever it is
//! invalidated. A writer snapshots the generations before computing a
//! value and checks them again after registering it; if anything moved in
//! between, the write raced an invalidation and must be discarded.
//!
//! Generations are drawn from one monotonic epoch per map. Untracked names
//! read as the map's floor, and pruning raises the floor past every entry it
//! drops, so a pruned name never reads as an older generation. Pruning can
//! make a pending snapshot look stale (its write is discarded) but never
//! makes a stale snapshot look current. The number of tracked generations
//! is bounded by [`GENERATION_PRUNE_THRESHOLD`] per map.

use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracked generations per map before the next bump prunes them.
pub const GENERATION_PRUNE_THRESHOLD: usize = 4096;

/// Generations observed for one key and its tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSnapshot {
    key: u64,
    tags: Vec<(String, u64)>,
}

/// Generation counters for one namespace (tags or keys).
#[derive(Debug, Default)]
struct Generations {
    epoch: AtomicU64,
    floor: AtomicU64,
    by_name: DashMap<String, u64>,
}

impl Generations {
    fn current(&self, name: &str) -> u64 {
        match self.by_name.get(name) {
            Some(generation) => *generation,
            None => self.floor.load(Ordering::SeqCst),
        }
    }

    fn bump(&self, name: &str) {
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.by_name
            .entry(name.to_string())
            .and_modify(|generation| *generation = (*generation).max(next))
            .or_insert(next);
        if self.by_name.len() > GENERATION_PRUNE_THRESHOLD {
            self.prune();
        }
    }

    /// Forget every tracked generation. Names read as the new floor, which
    /// is newer than anything dropped.
    fn prune(&self) {
        let floor = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.floor.fetch_max(floor, Ordering::SeqCst);
        // Entries bumped after the floor was chosen are kept.
        self.by_name.retain(|_, generation| *generation > floor);
    }

    fn len(&self) -> usize {
        self.by_name.len()
    }
}

#[derive(Debug, Default)]
pub struct TagIndex {
    tag_keys: DashMap<String, HashSet<String>>,
    key_tags: DashMap<String, HashSet<String>>,
    tag_generations: Generations,
    key_generations: Generations,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` under `tag`.
    pub fn register(&self, tag: &str, key: &str) {
        self.tag_keys
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
        self.key_tags
            .entry(key.to_string())
            .or_default()
            .insert(tag.to_string());
    }

    /// Remove `key` from every tag it is registered under.
    pub fn unregister_key(&self, key: &str) -> usize {
        let Some((_, tags)) = self.key_tags.remove(key) else {
            return 0;
        };
        for tag in &tags {
            self.remove_from_tag(tag, key);
        }
        tags.len()
    }

    /// Keys currently registered under `tag`.
    pub fn keys_for(&self, tag: &str) -> BTreeSet<String> {
        self.tag_keys
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Keys under `tag` for which `is_live` holds. References failing the
    /// check are pruned from the index.
    pub fn keys_for_live<F>(&self, tag: &str, mut is_live: F) -> BTreeSet<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut live = BTreeSet::new();
        let mut stale = Vec::new();
        for key in self.keys_for(tag) {
            if is_live(&key) {
                live.insert(key);
            } else {
                stale.push(key);
            }
        }
        for key in stale {
            tracing::trace!(tag, key = %key, "Pruning stale tag reference");
            self.unregister_key(&key);
        }
        live
    }

    /// Union of the keys registered under any of `tags`.
    pub fn keys_for_any<S: AsRef<str>>(&self, tags: &[S]) -> BTreeSet<String> {
        tags.iter()
            .flat_map(|tag| self.keys_for(tag.as_ref()))
            .collect()
    }

    /// Tags `key` is registered under.
    pub fn tags_for(&self, key: &str) -> BTreeSet<String> {
        self.key_tags
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every key registered under any of `tags` from the index.
    ///
    /// Returns the number of distinct keys removed. Bumps the generation of
    /// each tag first, so concurrent writers that started earlier notice.
    pub fn evict<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        self.bump_tags(tags);
        let keys = self.keys_for_any(tags);
        for key in &keys {
            self.unregister_key(key);
        }
        keys.len()
    }

    pub fn bump_tags<S: AsRef<str>>(&self, tags: &[S]) {
        for tag in tags {
            self.tag_generations.bump(tag.as_ref());
        }
    }

    pub fn bump_key(&self, key: &str) {
        self.key_generations.bump(key);
    }

    pub fn snapshot<S: AsRef<str>>(&self, key: &str, tags: &[S]) -> GenerationSnapshot {
        GenerationSnapshot {
            key: self.key_generation(key),
            tags: tags
                .iter()
                .map(|tag| (tag.as_ref().to_string(), self.tag_generation(tag.as_ref())))
                .collect(),
        }
    }

    /// True when neither `key` nor any tag in the snapshot was invalidated
    /// since it was taken.
    pub fn is_current(&self, key: &str, snapshot: &GenerationSnapshot) -> bool {
        self.key_generation(key) == snapshot.key
            && snapshot
                .tags
                .iter()
                .all(|(tag, generation)| self.tag_generation(tag) == *generation)
    }

    pub fn tag_count(&self) -> usize {
        self.tag_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_tags.len()
    }

    /// Number of tag and key generations currently tracked.
    pub fn tracked_generations(&self) -> usize {
        self.tag_generations.len() + self.key_generations.len()
    }

    /// Drop every tracked generation. Snapshots taken before this call are
    /// no longer current.
    pub fn prune_generations(&self) {
        self.tag_generations.prune();
        self.key_generations.prune();
    }

    /// Drop every reference and invalidate every outstanding snapshot.
    pub fn clear(&self) {
        self.prune_generations();
        self.tag_keys.clear();
        self.key_tags.clear();
    }

    fn tag_generation(&self, tag: &str) -> u64 {
        self.tag_generations.current(tag)
    }

    fn key_generation(&self, key: &str) -> u64 {
        self.key_generations.current(key)
    }

    fn remove_from_tag(&self, tag: &str, key: &str) {
        if let Some(mut keys) = self.tag_keys.get_mut(tag) {
            keys.remove(key);
        }
        self.tag_keys.remove_if(tag, |_, keys| keys.is_empty());
    }
}
