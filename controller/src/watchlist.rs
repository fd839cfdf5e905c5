use crate::kubernetes::ObjectKey;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Maps secret keys to the ingresses watching them. Secrets whose last
/// watcher is removed disappear from the map.
#[derive(Debug, Default)]
pub struct SecretWatchlist {
    watch: RwLock<HashMap<ObjectKey, HashSet<ObjectKey>>>,
}

impl SecretWatchlist {
    pub fn add(&self, secret: ObjectKey, watcher: ObjectKey) {
        let mut watch = self.watch.write().unwrap_or_else(|e| e.into_inner());
        watch.entry(secret).or_default().insert(watcher);
    }

    /// Removes the watcher from every secret it is registered for.
    pub fn remove(&self, watcher: &ObjectKey) {
        let mut watch = self.watch.write().unwrap_or_else(|e| e.into_inner());
        watch.retain(|_, watchers| {
            watchers.remove(watcher);
            !watchers.is_empty()
        });
    }

    pub fn watchers(&self, secret: &ObjectKey) -> Vec<ObjectKey> {
        let watch = self.watch.read().unwrap_or_else(|e| e.into_inner());
        watch
            .get(secret)
            .map(|watchers| watchers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ObjectKey {
        s.parse().unwrap()
    }

    #[test]
    fn watchers_are_registered_per_secret() {
        let list = SecretWatchlist::default();
        list.add(key("default/s1"), key("default/ing1"));
        list.add(key("default/s1"), key("default/ing2"));
        list.add(key("default/s2"), key("default/ing1"));

        let mut watchers = list.watchers(&key("default/s1"));
        watchers.sort();
        assert_eq!(watchers, vec![key("default/ing1"), key("default/ing2")]);
        assert_eq!(list.watchers(&key("default/s2")), vec![key("default/ing1")]);
        assert!(list.watchers(&key("default/s3")).is_empty());
    }

    #[test]
    fn adding_the_same_watcher_twice_is_idempotent() {
        let list = SecretWatchlist::default();
        list.add(key("default/s1"), key("default/ing1"));
        list.add(key("default/s1"), key("default/ing1"));
        assert_eq!(list.watchers(&key("default/s1")).len(), 1);
    }

    #[test]
    fn remove_spans_all_secrets() {
        let list = SecretWatchlist::default();
        list.add(key("default/s1"), key("default/ing1"));
        list.add(key("default/s2"), key("default/ing1"));
        list.add(key("default/s2"), key("default/ing2"));

        list.remove(&key("default/ing1"));

        assert!(list.watchers(&key("default/s1")).is_empty());
        assert_eq!(list.watchers(&key("default/s2")), vec![key("default/ing2")]);
    }
}
