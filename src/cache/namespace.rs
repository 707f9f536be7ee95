//! Namespace view over the cache manager
//!
//! Binds one namespace so callers can use raw keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::manager::{CacheManager, ClearOptions, EvictOptions, GetOptions, SetOptions};
use super::policy::EvictionStrategy;

/// [`CacheManager`] with every call scoped to `namespace:`
#[derive(Debug, Clone)]
pub struct NamespacedCache {
    manager: Arc<CacheManager>,
    namespace: String,
}

impl NamespacedCache {
    pub(crate) fn new(manager: Arc<CacheManager>, namespace: String) -> Self {
        Self { manager, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    fn get_options(&self) -> GetOptions {
        GetOptions::in_namespace(self.namespace.clone())
    }

    fn set_options(&self) -> SetOptions {
        SetOptions::in_namespace(self.namespace.clone())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.manager.get(key, &self.get_options()).await
    }

    /// Get with extra options; the namespace always wins
    pub async fn get_with(&self, key: &str, mut options: GetOptions) -> Option<Value> {
        options.namespace = Some(self.namespace.clone());
        self.manager.get(key, &options).await
    }

    pub async fn get_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.manager.get_value(key, &self.get_options()).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        self.manager.set(key, value, ttl, &self.set_options()).await
    }

    /// Set with extra options; the namespace always wins
    pub async fn set_with(&self, key: &str, value: Value, ttl: Option<Duration>, mut options: SetOptions) -> bool {
        options.namespace = Some(self.namespace.clone());
        self.manager.set(key, value, ttl, &options).await
    }

    pub async fn set_value<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        self.manager.set_value(key, value, ttl, &self.set_options()).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.manager.delete(key, Some(&self.namespace)).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.manager.exists(key, Some(&self.namespace)).await
    }

    /// Clear the namespace, optionally only raw keys matching `pattern`
    pub async fn clear(&self, pattern: Option<&str>) -> usize {
        let options = ClearOptions {
            namespace: Some(self.namespace.clone()),
            pattern: pattern.map(str::to_string),
        };
        self.manager.clear(&options).await
    }

    pub async fn get_multiple(&self, keys: &[String]) -> HashMap<String, Value> {
        self.manager.get_multiple(keys, &self.get_options()).await
    }

    pub async fn set_multiple(&self, entries: Vec<(String, Value, Option<Duration>)>) -> usize {
        self.manager.set_multiple(entries, &self.set_options()).await
    }

    /// Evict within this namespace only
    pub async fn evict_by_policy(&self, strategy: EvictionStrategy, percentage: Option<f64>) -> usize {
        let options = EvictOptions {
            percentage,
            namespace: Some(self.namespace.clone()),
        };
        self.manager.evict_by_policy(strategy, &options).await
    }
}
