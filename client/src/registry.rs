// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};

/// A user subscription callback. `Arc` rather than `Box` so dispatch
/// can clone the callback list out from under the registry lock
/// without cloning the closures themselves.
pub type Callback = Arc<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

/// Result of removing a subscription: the topic it was registered
/// under, and whether that topic has no remaining local subscribers
/// (meaning the broker-side subscription should be torn down too).
pub struct Removed {
    pub topic: String,
    pub topic_now_empty: bool,
}

/// The subscription registry described in the data model: a
/// topic-to-callbacks map and an id-to-topic map, both kept in sync
/// under whatever lock wraps this struct.
#[derive(Default)]
pub struct Registry {
    by_topic: HashMap<String, Vec<(u64, Callback)>>,
    by_id: HashMap<u64, String>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the broker already has an active subscription for
    /// `topic` on this endpoint's behalf.
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    /// Record a new `(callback, id)` entry under `topic` and return the
    /// freshly issued id. Does not by itself decide whether a wire
    /// `subscribe` frame is needed; callers check `topic_exists` first.
    pub fn insert(&mut self, topic: &str, callback: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_topic
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
        self.by_id.insert(id, topic.to_string());
        id
    }

    /// Remove the subscription with `id`. Fails with
    /// `UnknownSubscription` if no such id is registered.
    pub fn remove(&mut self, id: u64) -> Result<Removed, Error> {
        let topic = self.by_id.remove(&id).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownSubscription,
                &format!("no subscription registered for id {}", id),
            )
        })?;

        if let Some(list) = self.by_topic.get_mut(&topic) {
            if let Some(pos) = list.iter().position(|(entry_id, _)| *entry_id == id) {
                list.remove(pos);
            }
        }

        let topic_now_empty = self
            .by_topic
            .get(&topic)
            .map(|list| list.is_empty())
            .unwrap_or(true);
        if topic_now_empty {
            self.by_topic.remove(&topic);
        }

        Ok(Removed {
            topic,
            topic_now_empty,
        })
    }

    /// Snapshot the callback lists for each topic in a dispatch chain,
    /// most specific first. Cloning an `Arc` per callback is cheap;
    /// this is the copy-under-lock half of the dispatch contract.
    pub fn snapshot_for_chain(&self, chain: &[String]) -> Vec<(String, Vec<(u64, Callback)>)> {
        chain
            .iter()
            .map(|topic| {
                let callbacks = self.by_topic.get(topic).cloned().unwrap_or_default();
                (topic.clone(), callbacks)
            })
            .collect()
    }

    #[cfg(test)]
    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.by_topic.get(topic).map(Vec::len).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn id_count(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Arc::new(|_| {})
    }

    #[test]
    fn insert_issues_increasing_ids() {
        let mut registry = Registry::new();
        let a = registry.insert("x", noop());
        let b = registry.insert("x", noop());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(registry.topic_subscriber_count("x"), 2);
    }

    #[test]
    fn remove_unknown_id_fails() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.remove(42).unwrap_err().kind(),
            ErrorKind::UnknownSubscription
        ));
    }

    #[test]
    fn remove_last_subscriber_empties_topic() {
        let mut registry = Registry::new();
        let id = registry.insert("x", noop());
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.topic, "x");
        assert!(removed.topic_now_empty);
        assert!(!registry.topic_exists("x"));
    }

    #[test]
    fn remove_one_of_several_keeps_topic() {
        let mut registry = Registry::new();
        let a = registry.insert("x", noop());
        let _b = registry.insert("x", noop());
        let removed = registry.remove(a).unwrap();
        assert!(!removed.topic_now_empty);
        assert!(registry.topic_exists("x"));
        assert_eq!(registry.topic_subscriber_count("x"), 1);
    }

    #[test]
    fn by_id_and_by_topic_stay_coherent() {
        let mut registry = Registry::new();
        let a = registry.insert("x", noop());
        let b = registry.insert("y", noop());
        let _c = registry.insert("x", noop());
        assert_eq!(registry.id_count(), 3);
        registry.remove(a).unwrap();
        registry.remove(b).unwrap();
        assert_eq!(registry.id_count(), 1);
        assert!(registry.topic_exists("x"));
        assert!(!registry.topic_exists("y"));
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let mut registry = Registry::new();
        registry.insert("a", noop());
        registry.insert("a", noop());
        let chain = vec!["a".to_string(), String::new()];
        let snapshot = registry.snapshot_for_chain(&chain);
        assert_eq!(snapshot[0].0, "a");
        assert_eq!(snapshot[0].1.len(), 2);
        assert_eq!(snapshot[1].0, "");
        assert_eq!(snapshot[1].1.len(), 0);
    }
}
