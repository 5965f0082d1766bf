//! Integer handles derived from document keys.
//!
//! Packages are exposed with a compact `i32` id computed from their string
//! key. The hash is Java's `String.hashCode` over UTF-16 code units, so ids
//! match the ones the Android client has always shown. The mapping is not
//! injective: [`KeyIndex`] records which keys produced which id and reports
//! collisions instead of silently picking one.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Derives the integer handle for a document key.
///
/// `h = 31 * h + unit` for every UTF-16 code unit, wrapping at 32 bits.
pub fn derive_id(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Outcome of looking up a derived id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unique(String),
    /// More than one key hashes to the id. Keys are sorted.
    Ambiguous(Vec<String>),
    Unknown,
}

/// Mapping from derived id to the document keys seen for it.
///
/// Populated from reads; holds no document content. The table is only
/// known to be complete while a live listener keeps rebuilding it, see
/// [`KeyIndex::follow`].
#[derive(Debug, Default)]
pub struct KeyIndex {
    entries: Mutex<HashMap<i32, BTreeSet<String>>>,
    followers: AtomicUsize,
}

/// Marks a [`KeyIndex`] as kept current by a live listener until dropped.
#[derive(Debug)]
pub struct IndexFollower {
    index: Arc<KeyIndex>,
}

impl Drop for IndexFollower {
    fn drop(&mut self) {
        self.index.followers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, BTreeSet<String>>> {
        // The map stays consistent even if a holder panicked mid-update.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the whole table with the keys of a complete collection read.
    ///
    /// Returns the ids that more than one key maps to.
    pub fn rebuild<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<i32> {
        let mut fresh: HashMap<i32, BTreeSet<String>> = HashMap::new();
        for key in keys {
            fresh.entry(derive_id(key)).or_default().insert(key.to_string());
        }

        let mut collisions: Vec<i32> = fresh
            .iter()
            .filter(|(_, keys)| keys.len() > 1)
            .map(|(id, _)| *id)
            .collect();
        collisions.sort_unstable();

        *self.lock() = fresh;
        collisions
    }

    /// Records a single key. Returns its derived id.
    pub fn observe(&self, key: &str) -> i32 {
        let id = derive_id(key);
        self.lock().entry(id).or_default().insert(key.to_string());
        id
    }

    /// Drops a key, for example after it was deleted.
    pub fn forget(&self, key: &str) {
        let id = derive_id(key);
        let mut entries = self.lock();
        if let Some(keys) = entries.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                entries.remove(&id);
            }
        }
    }

    pub fn resolve(&self, id: i32) -> Resolution {
        match self.lock().get(&id) {
            None => Resolution::Unknown,
            Some(keys) if keys.len() == 1 => keys
                .iter()
                .next()
                .map(|key| Resolution::Unique(key.clone()))
                .unwrap_or(Resolution::Unknown),
            Some(keys) => Resolution::Ambiguous(keys.iter().cloned().collect()),
        }
    }

    /// Registers a listener that rebuilds this index on every snapshot.
    pub fn follow(self: &Arc<Self>) -> IndexFollower {
        self.followers.fetch_add(1, Ordering::SeqCst);
        IndexFollower {
            index: Arc::clone(self),
        }
    }

    /// True while at least one live listener keeps the table current.
    pub fn is_live(&self) -> bool {
        self.followers.load(Ordering::SeqCst) > 0
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_matches_java_hash_code() {
        assert_eq!(derive_id(""), 0);
        assert_eq!(derive_id("a"), 97);
        assert_eq!(derive_id("hello"), 99162322);
        // Overflows and wraps negative, like Java.
        assert_eq!(derive_id("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn test_derive_id_hashes_utf16_units() {
        // U+1F600 is the surrogate pair D83D DE00.
        let expected = 0xD83Di32.wrapping_mul(31).wrapping_add(0xDE00);
        assert_eq!(derive_id("\u{1F600}"), expected);
        assert_eq!(derive_id("é"), 0xE9);
    }

    #[test]
    fn test_derive_id_known_collision() {
        assert_eq!(derive_id("Aa"), 2112);
        assert_eq!(derive_id("BB"), 2112);
    }

    #[test]
    fn test_resolve_unique_and_unknown() {
        let index = KeyIndex::new();
        let id = index.observe("doc-1");

        assert_eq!(index.resolve(id), Resolution::Unique("doc-1".into()));
        assert_eq!(index.resolve(id.wrapping_add(1)), Resolution::Unknown);
    }

    #[test]
    fn test_rebuild_reports_collisions() {
        let index = KeyIndex::new();
        let collisions = index.rebuild(["Aa", "BB", "other"]);

        assert_eq!(collisions, vec![2112]);
        assert_eq!(
            index.resolve(2112),
            Resolution::Ambiguous(vec!["Aa".into(), "BB".into()])
        );
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_rebuild_replaces_previous_entries() {
        let index = KeyIndex::new();
        index.observe("gone");
        index.rebuild(["kept"]);

        assert_eq!(index.resolve(derive_id("gone")), Resolution::Unknown);
        assert_eq!(
            index.resolve(derive_id("kept")),
            Resolution::Unique("kept".into())
        );
    }

    #[test]
    fn test_observe_colliding_key_makes_id_ambiguous() {
        let index = KeyIndex::new();
        index.observe("Aa");
        index.observe("BB");

        assert!(matches!(index.resolve(2112), Resolution::Ambiguous(_)));
    }

    #[test]
    fn test_forget() {
        let index = KeyIndex::new();
        index.rebuild(["Aa", "BB"]);

        index.forget("Aa");
        assert_eq!(index.resolve(2112), Resolution::Unique("BB".into()));

        index.forget("BB");
        assert_eq!(index.resolve(2112), Resolution::Unknown);
        assert!(index.is_empty());
    }

    #[test]
    fn test_follow_marks_index_live_until_dropped() {
        let index = Arc::new(KeyIndex::new());
        assert!(!index.is_live());

        let first = index.follow();
        let second = index.follow();
        assert!(index.is_live());

        drop(first);
        assert!(index.is_live());
        drop(second);
        assert!(!index.is_live());
    }
}
