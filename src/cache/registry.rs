//! Dependency and group registry.
//!
//! Tracks which record keys must be dropped when another key is invalidated
//! (dependency edges) and which keys belong to a named group. Propagation
//! is one hop: dependents of a dependent are not followed.
//!
//! [`InMemoryGraph`] keeps the indexes in process; [`StoreGraph`] keeps them
//! as sets in the shared store so every instance sees the same graph.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::keys::KeyScheme;
use super::lock::{rw_read, rw_write};
use crate::store::{KeyValueStore, StoreError};

const TARGET: &str = "cachekeeper::cache::registry";

/// Sizes of the registry indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphSizes {
    /// Keys with at least one registered dependent.
    pub depended_on: usize,
    /// Groups with at least one member.
    pub groups: usize,
}

/// Storage for dependency edges and group memberships.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Record that `dependent` must be invalidated with `depended_on`.
    /// `ttl` is the lifetime of `dependent`; the edge must outlive it.
    async fn add_edge(
        &self,
        depended_on: &str,
        dependent: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Remove and return every dependent registered under `depended_on`.
    async fn take_dependents(&self, depended_on: &str) -> Result<Vec<String>, StoreError>;

    async fn add_to_group(&self, group: &str, key: &str, ttl: Duration)
    -> Result<(), StoreError>;

    /// Remove and return every member of `group`.
    async fn take_group(&self, group: &str) -> Result<Vec<String>, StoreError>;

    /// Drop `key` from every group it belongs to.
    async fn forget(&self, key: &str) -> Result<(), StoreError>;

    async fn sizes(&self) -> Result<GraphSizes, StoreError>;
}

#[derive(Default)]
struct Indexes {
    dependents: HashMap<String, HashSet<String>>,
    group_members: HashMap<String, HashSet<String>>,
    groups_of: HashMap<String, HashSet<String>>,
}

impl Indexes {
    fn unlink_groups(&mut self, key: &str, groups: impl IntoIterator<Item = String>) {
        for group in groups {
            if let Some(members) = self.group_members.get_mut(&group) {
                members.remove(key);
                if members.is_empty() {
                    self.group_members.remove(&group);
                }
            }
        }
    }
}

/// Process-local registry.
#[derive(Default)]
pub struct InMemoryGraph {
    indexes: RwLock<Indexes>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current dependents of `depended_on` without removing them.
    pub fn dependents_of(&self, depended_on: &str) -> HashSet<String> {
        rw_read(&self.indexes, TARGET, "dependents_of")
            .dependents
            .get(depended_on)
            .cloned()
            .unwrap_or_default()
    }

    /// Groups `key` currently belongs to.
    pub fn groups_of(&self, key: &str) -> HashSet<String> {
        rw_read(&self.indexes, TARGET, "groups_of")
            .groups_of
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut indexes = rw_write(&self.indexes, TARGET, "clear");
        indexes.dependents.clear();
        indexes.group_members.clear();
        indexes.groups_of.clear();
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn add_edge(
        &self,
        depended_on: &str,
        dependent: &str,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        rw_write(&self.indexes, TARGET, "add_edge")
            .dependents
            .entry(depended_on.to_string())
            .or_default()
            .insert(dependent.to_string());
        Ok(())
    }

    async fn take_dependents(&self, depended_on: &str) -> Result<Vec<String>, StoreError> {
        let taken = rw_write(&self.indexes, TARGET, "take_dependents")
            .dependents
            .remove(depended_on)
            .unwrap_or_default();
        Ok(taken.into_iter().collect())
    }

    async fn add_to_group(
        &self,
        group: &str,
        key: &str,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut indexes = rw_write(&self.indexes, TARGET, "add_to_group");
        indexes
            .group_members
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string());
        indexes
            .groups_of
            .entry(key.to_string())
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    async fn take_group(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let mut indexes = rw_write(&self.indexes, TARGET, "take_group");
        let members = indexes.group_members.remove(group).unwrap_or_default();
        for member in &members {
            if let Some(groups) = indexes.groups_of.get_mut(member) {
                groups.remove(group);
                if groups.is_empty() {
                    indexes.groups_of.remove(member);
                }
            }
        }
        Ok(members.into_iter().collect())
    }

    async fn forget(&self, key: &str) -> Result<(), StoreError> {
        let mut indexes = rw_write(&self.indexes, TARGET, "forget");
        if let Some(groups) = indexes.groups_of.remove(key) {
            indexes.unlink_groups(key, groups);
        }
        Ok(())
    }

    async fn sizes(&self) -> Result<GraphSizes, StoreError> {
        let indexes = rw_read(&self.indexes, TARGET, "sizes");
        Ok(GraphSizes {
            depended_on: indexes.dependents.len(),
            groups: indexes.group_members.len(),
        })
    }
}

/// Registry persisted as sets in the shared store.
///
/// Set keys are `graph:deps:{key}`, `graph:group:{name}` and
/// `graph:groups-of:{key}` under the configured namespace. Each set expires
/// no earlier than the longest-lived record added to it.
pub struct StoreGraph {
    store: Arc<dyn KeyValueStore>,
    keys: KeyScheme,
}

impl StoreGraph {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: KeyScheme) -> Self {
        Self { store, keys }
    }

    async fn add_member(
        &self,
        set_key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.store.set_add(set_key, &[member.to_string()]).await?;
        self.store.extend_expiry(set_key, ttl).await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for StoreGraph {
    async fn add_edge(
        &self,
        depended_on: &str,
        dependent: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let set_key = self.keys.graph_dependents(depended_on);
        self.add_member(set_key.as_str(), dependent, ttl).await
    }

    async fn take_dependents(&self, depended_on: &str) -> Result<Vec<String>, StoreError> {
        self.store
            .take_set(self.keys.graph_dependents(depended_on).as_str())
            .await
    }

    async fn add_to_group(
        &self,
        group: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.add_member(self.keys.graph_group(group).as_str(), key, ttl)
            .await?;
        self.add_member(self.keys.graph_groups_of(key).as_str(), group, ttl)
            .await
    }

    async fn take_group(&self, group: &str) -> Result<Vec<String>, StoreError> {
        let members = self
            .store
            .take_set(self.keys.graph_group(group).as_str())
            .await?;
        let group_entry = [group.to_string()];
        for member in &members {
            self.store
                .set_remove(self.keys.graph_groups_of(member).as_str(), &group_entry)
                .await?;
        }
        Ok(members)
    }

    async fn forget(&self, key: &str) -> Result<(), StoreError> {
        let groups = self
            .store
            .take_set(self.keys.graph_groups_of(key).as_str())
            .await?;
        let member = [key.to_string()];
        for group in groups {
            self.store
                .set_remove(self.keys.graph_group(&group).as_str(), &member)
                .await?;
        }
        Ok(())
    }

    async fn sizes(&self) -> Result<GraphSizes, StoreError> {
        let depended_on = self
            .store
            .keys(&self.keys.graph_pattern("deps"))
            .await?
            .len();
        let groups = self
            .store
            .keys(&self.keys.graph_pattern("group"))
            .await?
            .len();
        Ok(GraphSizes {
            depended_on,
            groups,
        })
    }
}
