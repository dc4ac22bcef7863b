use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::newt_value::NewtString;
use crate::newt_value::newt_string::WeakString;

/// Complete string interner: every string in the VM family goes through
/// here, so equal content means equal pointer.
///
/// Buckets hold weak handles; strings die with their last strong handle
/// and the dead entries are pruned during garbage collection.
pub struct StringInterner {
    map: HashMap<u64, Vec<WeakString>, RandomState>,
    hash_builder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hash_builder: RandomState::new(),
        }
    }

    /// Intern a string, returning the existing handle when the content is
    /// already present.
    pub fn intern(&mut self, s: &str) -> NewtString {
        let hash = self.hash_str(s);

        if let Some(entries) = self.map.get(&hash) {
            for weak in entries {
                if let Some(existing) = weak.upgrade() {
                    if existing.as_str() == s {
                        return existing;
                    }
                }
            }
        }

        let created = NewtString::new_with_hash(s, hash);
        self.map.entry(hash).or_default().push(created.downgrade());
        created
    }

    #[inline(always)]
    fn hash_str(&self, s: &str) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        s.hash(&mut hasher);
        hasher.finish()
    }

    /// Drop bucket entries whose strings have died. Called by the
    /// collector after the sweep.
    pub fn prune_dead(&mut self) {
        self.map.retain(|_, entries| {
            entries.retain(|weak| weak.upgrade().is_some());
            !entries.is_empty()
        });
    }

    /// Number of live interned strings.
    pub fn live_count(&self) -> usize {
        self.map
            .values()
            .map(|entries| entries.iter().filter(|w| w.upgrade().is_some()).count())
            .sum()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        let c = interner.intern("world");
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(interner.live_count(), 2);
    }

    #[test]
    fn dead_strings_are_pruned() {
        let mut interner = StringInterner::new();
        let keep = interner.intern("keep");
        {
            let _tmp = interner.intern("transient");
        }
        interner.prune_dead();
        assert_eq!(interner.live_count(), 1);
        assert_eq!(keep.as_str(), "keep");
    }
}
