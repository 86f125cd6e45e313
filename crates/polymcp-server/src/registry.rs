//! Feature registries.
//!
//! A [`FeatureRegistry`] maps [`FeatureKey`]s to registered features. Reads
//! take a lock-free snapshot (`arc-swap`); mutations are linearized under a
//! write lock and swap in a fresh snapshot, so a reader that starts after a
//! mutation returns always sees its effect. Listeners fire after the new
//! state is observable, `on_feature_updated` per key first, then one
//! `on_list_changed` per mutation.
//!
//! Template keys compile their URI template at insertion; `get` is a scan in
//! insertion order, so template ambiguity resolves deterministically to the
//! first match.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};

use polymcp_protocol::UriTemplate;

/// Key under which a feature is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeatureKey {
    /// Exact-match key (tool/prompt names, concrete resource URIs).
    Literal(String),
    /// Compiled URI template (resource templates).
    Template(UriTemplate),
}

impl FeatureKey {
    /// A literal key.
    pub fn literal(key: impl Into<String>) -> Self {
        Self::Literal(key.into())
    }

    /// A template key.
    pub fn template(template: UriTemplate) -> Self {
        Self::Template(template)
    }

    /// Whether an input key selects this entry.
    pub fn matches(&self, input: &str) -> bool {
        match self {
            Self::Literal(key) => key == input,
            Self::Template(template) => template.matches(input),
        }
    }

    /// The key's source text.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(key) => key,
            Self::Template(template) => template.as_str(),
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer of registry mutations.
///
/// Callbacks may run concurrently with reads but fire at most once per
/// mutation, in the order mutations were linearized.
pub trait RegistryListener<T>: Send + Sync {
    /// One entry changed: `old` is the displaced value, `new` the inserted
    /// one (`None` on removal).
    fn on_feature_updated(&self, key: &FeatureKey, old: Option<&T>, new: Option<&T>);

    /// The overall feature list changed.
    fn on_list_changed(&self);
}

/// A thread-safe map of registered features with change listeners.
pub struct FeatureRegistry<T> {
    entries: ArcSwap<Vec<(FeatureKey, T)>>,
    listeners: SyncRwLock<Vec<Arc<dyn RegistryListener<T>>>>,
    write_lock: SyncMutex<()>,
}

impl<T> Default for FeatureRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for FeatureRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureRegistry")
            .field("len", &self.entries.load().len())
            .finish()
    }
}

impl<T> FeatureRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            listeners: SyncRwLock::new(Vec::new()),
            write_lock: SyncMutex::new(()),
        }
    }

    /// Subscribe to mutations.
    pub fn add_listener(&self, listener: Arc<dyn RegistryListener<T>>) {
        self.listeners.write().push(listener);
    }

    /// Insert or replace one entry. Returns the displaced value.
    pub fn add(&self, key: FeatureKey, value: T) -> Option<T> {
        let _guard = self.write_lock.lock();
        let old = self.upsert(&key, value.clone());
        self.notify_updated(&key, old.as_ref(), Some(&value));
        self.notify_list_changed();
        old
    }

    /// Insert or replace several entries as one atomic mutation: readers see
    /// either none or all, listeners get one update per key and a single
    /// list-changed.
    pub fn add_all(&self, items: Vec<(FeatureKey, T)>) {
        if items.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock();
        let mut next: Vec<(FeatureKey, T)> = (**self.entries.load()).clone();
        let mut displaced: Vec<(FeatureKey, Option<T>, T)> = Vec::with_capacity(items.len());
        for (key, value) in items {
            let old = match next.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => Some(std::mem::replace(&mut slot.1, value.clone())),
                None => {
                    next.push((key.clone(), value.clone()));
                    None
                }
            };
            displaced.push((key, old, value));
        }
        self.entries.store(Arc::new(next));
        for (key, old, new) in &displaced {
            self.notify_updated(key, old.as_ref(), Some(new));
        }
        self.notify_list_changed();
    }

    /// Remove one entry. Returns the removed value; a second removal of the
    /// same key is a no-op and fires no listeners.
    pub fn remove(&self, key: &FeatureKey) -> Option<T> {
        let _guard = self.write_lock.lock();
        let old = self.delete(key);
        if let Some(ref old_value) = old {
            self.notify_updated(key, Some(old_value), None);
            self.notify_list_changed();
        }
        old
    }

    /// Remove several entries as one atomic mutation. Returns how many were
    /// actually removed; listeners fire once per removed key, then one
    /// list-changed (none at all if nothing was removed).
    pub fn remove_all(&self, keys: &[FeatureKey]) -> usize {
        let _guard = self.write_lock.lock();
        let mut next: Vec<(FeatureKey, T)> = (**self.entries.load()).clone();
        let mut removed: Vec<(FeatureKey, T)> = Vec::new();
        for key in keys {
            if let Some(position) = next.iter().position(|(k, _)| k == key) {
                let (key, value) = next.remove(position);
                removed.push((key, value));
            }
        }
        if removed.is_empty() {
            return 0;
        }
        self.entries.store(Arc::new(next));
        for (key, value) in &removed {
            self.notify_updated(key, Some(value), None);
        }
        self.notify_list_changed();
        removed.len()
    }

    /// Look up by input key: literal equality or template match, first
    /// match in insertion order wins.
    pub fn get(&self, input: &str) -> Option<T> {
        self.entries
            .load()
            .iter()
            .find(|(key, _)| key.matches(input))
            .map(|(_, value)| value.clone())
    }

    /// Look up by exact registered key.
    pub fn get_exact(&self, key: &FeatureKey) -> Option<T> {
        self.entries
            .load()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value.clone())
    }

    /// Snapshot of all values in insertion order.
    pub fn values(&self) -> Vec<T> {
        self.entries
            .load()
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Snapshot of all keys in insertion order.
    pub fn keys(&self) -> Vec<FeatureKey> {
        self.entries.load().iter().map(|(key, _)| key.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    fn upsert(&self, key: &FeatureKey, value: T) -> Option<T> {
        let mut next: Vec<(FeatureKey, T)> = (**self.entries.load()).clone();
        let old = match next.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => Some(std::mem::replace(&mut slot.1, value)),
            None => {
                next.push((key.clone(), value));
                None
            }
        };
        self.entries.store(Arc::new(next));
        old
    }

    fn delete(&self, key: &FeatureKey) -> Option<T> {
        let mut next: Vec<(FeatureKey, T)> = (**self.entries.load()).clone();
        let position = next.iter().position(|(k, _)| k == key)?;
        let (_, value) = next.remove(position);
        self.entries.store(Arc::new(next));
        Some(value)
    }

    fn notify_updated(&self, key: &FeatureKey, old: Option<&T>, new: Option<&T>) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener.on_feature_updated(key, old, new);
        }
    }

    fn notify_list_changed(&self) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener.on_list_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        log: Mutex<Vec<String>>,
    }

    impl RegistryListener<i32> for RecordingListener {
        fn on_feature_updated(&self, key: &FeatureKey, old: Option<&i32>, new: Option<&i32>) {
            self.log
                .lock()
                .push(format!("updated {key} {old:?} -> {new:?}"));
        }

        fn on_list_changed(&self) {
            self.log.lock().push("list_changed".to_string());
        }
    }

    #[test]
    fn mutations_are_visible_to_subsequent_reads() {
        let registry = FeatureRegistry::new();
        registry.add(FeatureKey::literal("a"), 1);
        assert_eq!(registry.get("a"), Some(1));

        registry.add(FeatureKey::literal("a"), 2);
        assert_eq!(registry.get("a"), Some(2));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove(&FeatureKey::literal("a")), Some(2));
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn listeners_see_update_then_list_changed() {
        let registry = FeatureRegistry::new();
        let listener = Arc::new(RecordingListener::default());
        registry.add_listener(listener.clone());

        registry.add(FeatureKey::literal("a"), 1);
        assert_eq!(
            *listener.log.lock(),
            vec![
                "updated a None -> Some(1)".to_string(),
                "list_changed".to_string()
            ]
        );
    }

    #[test]
    fn add_all_fires_one_list_changed() {
        let registry = FeatureRegistry::new();
        let listener = Arc::new(RecordingListener::default());
        registry.add_listener(listener.clone());

        registry.add_all(vec![
            (FeatureKey::literal("a"), 1),
            (FeatureKey::literal("b"), 2),
        ]);

        let log = listener.log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], "list_changed");
        assert_eq!(registry.values(), vec![1, 2]);
    }

    #[test]
    fn double_remove_is_a_silent_noop() {
        let registry = FeatureRegistry::new();
        let listener = Arc::new(RecordingListener::default());
        registry.add(FeatureKey::literal("a"), 1);
        registry.add_listener(listener.clone());

        assert_eq!(registry.remove(&FeatureKey::literal("a")), Some(1));
        assert_eq!(registry.remove(&FeatureKey::literal("a")), None);

        // Only the first removal produced events.
        assert_eq!(listener.log.lock().len(), 2);
    }

    #[test]
    fn remove_all_counts_only_present_keys() {
        let registry = FeatureRegistry::new();
        registry.add(FeatureKey::literal("a"), 1);
        registry.add(FeatureKey::literal("b"), 2);

        let removed = registry.remove_all(&[
            FeatureKey::literal("a"),
            FeatureKey::literal("ghost"),
            FeatureKey::literal("b"),
        ]);
        assert_eq!(removed, 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn template_lookup_is_first_match_wins() {
        let registry = FeatureRegistry::new();
        let wide = UriTemplate::parse("mem://{path*}").unwrap();
        let narrow = UriTemplate::parse("mem://{name}").unwrap();
        registry.add(FeatureKey::template(wide), 1);
        registry.add(FeatureKey::template(narrow), 2);

        // Both templates match; insertion order decides.
        assert_eq!(registry.get("mem://x"), Some(1));
        assert_eq!(registry.get("mem://a/b"), Some(1));
    }

    #[test]
    fn literal_and_template_keys_coexist() {
        let registry = FeatureRegistry::new();
        registry.add(FeatureKey::literal("mem://exact"), 1);
        registry.add(
            FeatureKey::template(UriTemplate::parse("mem://{name}").unwrap()),
            2,
        );

        assert_eq!(registry.get("mem://exact"), Some(1));
        assert_eq!(registry.get("mem://other"), Some(2));
        assert_eq!(registry.get("nope"), None);
    }
}
