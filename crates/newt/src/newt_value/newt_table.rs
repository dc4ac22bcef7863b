use ahash::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::{GcRef, Marker, Trace};
use crate::newt_value::NewtValue;

/// Minimum node count after the first insertion.
const MIN_NODES: usize = 4;

/// One hash node. An empty node has a Null key; `next` is a relative
/// offset to the following node of the same chain, 0 when the chain ends.
struct Node {
    key: NewtValue,
    value: NewtValue,
    next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        key: NewtValue::Null,
        value: NewtValue::Null,
        next: 0,
    };

    #[inline]
    fn is_free(&self) -> bool {
        self.key.is_null()
    }
}

/// Open hash table with power-of-two bucket count and Brent's-variation
/// collision handling: a colliding insert relocates an occupant that is
/// not in its own main position, keeping every chain anchored at its true
/// home bucket.
///
/// Removed nodes stay linked until the next rebuild, so chains never
/// break mid-iteration; the free-slot scan only hands out nodes that were
/// never occupied since the last rebuild.
///
/// The optional delegate is stored here but consulted by the execution
/// engine, never by the table itself.
pub struct NewtTable {
    nodes: Vec<Node>,
    used: usize,
    /// Free-slot scan position; moves strictly down until the next rebuild.
    free_pos: usize,
    delegate: Option<GcRef<NewtTable>>,
    hash_builder: RandomState,
}

impl NewtTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let size = if capacity == 0 {
            0
        } else {
            capacity.next_power_of_two().max(MIN_NODES)
        };
        let mut nodes = Vec::new();
        nodes.resize_with(size, || Node::EMPTY);
        Self {
            nodes,
            used: 0,
            free_pos: size,
            delegate: None,
            hash_builder: RandomState::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    fn main_position(&self, key: &NewtValue) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.nodes.len() - 1)
    }

    fn find(&self, key: &NewtValue) -> Option<usize> {
        if self.nodes.is_empty() || key.is_null() {
            return None;
        }
        let mut pos = self.main_position(key);
        loop {
            let node = &self.nodes[pos];
            if node.key == *key {
                return Some(pos);
            }
            if node.next == 0 {
                return None;
            }
            pos = (pos as i64 + node.next as i64) as usize;
        }
    }

    pub fn get(&self, key: &NewtValue) -> Option<NewtValue> {
        self.find(key).map(|pos| self.nodes[pos].value.clone())
    }

    pub fn contains_key(&self, key: &NewtValue) -> bool {
        self.find(key).is_some()
    }

    /// Update an existing slot. Returns false when the key is absent so
    /// the engine can continue with delegation.
    pub fn set(&mut self, key: &NewtValue, value: NewtValue) -> bool {
        match self.find(key) {
            Some(pos) => {
                self.nodes[pos].value = value;
                true
            }
            None => false,
        }
    }

    /// Upsert. Returns true when a new slot was created. Null keys are
    /// rejected by the engine before this point.
    pub fn new_slot(&mut self, key: NewtValue, value: NewtValue) -> bool {
        debug_assert!(!key.is_null());
        if key.is_null() {
            return false;
        }
        if let Some(pos) = self.find(&key) {
            self.nodes[pos].value = value;
            return false;
        }
        self.insert_new(key, value);
        true
    }

    fn insert_new(&mut self, key: NewtValue, value: NewtValue) {
        if self.nodes.is_empty() {
            self.rebuild(MIN_NODES);
        } else if (self.used + 1) * 4 > self.nodes.len() * 3 {
            // Keep the load factor at or below 3/4.
            self.rebuild(self.nodes.len() * 2);
        }

        loop {
            let mp = self.main_position(&key);
            if self.nodes[mp].is_free() && self.nodes[mp].next == 0 {
                self.nodes[mp] = Node {
                    key,
                    value,
                    next: 0,
                };
                self.used += 1;
                return;
            }

            let Some(free) = self.take_free_slot() else {
                // No reusable node left below the scan position; rebuild
                // at a size derived from the live count and retry.
                let size = self.size_for(self.used + 1);
                self.rebuild(size);
                continue;
            };

            if !self.nodes[mp].is_free() {
                let occupant_mp = self.main_position(&self.nodes[mp].key);
                if occupant_mp != mp {
                    // Brent's variation: the occupant is a squatter from
                    // another chain. Relocate it to the free node so the
                    // new key can anchor its own chain here.
                    let mut prev = occupant_mp;
                    loop {
                        let next = self.nodes[prev].next;
                        debug_assert!(next != 0);
                        let follow = (prev as i64 + next as i64) as usize;
                        if follow == mp {
                            break;
                        }
                        prev = follow;
                    }
                    self.nodes[prev].next = (free as i64 - prev as i64) as i32;
                    let moved_next = if self.nodes[mp].next != 0 {
                        let target = (mp as i64 + self.nodes[mp].next as i64) as usize;
                        (target as i64 - free as i64) as i32
                    } else {
                        0
                    };
                    let occupant = std::mem::replace(
                        &mut self.nodes[mp],
                        Node {
                            key,
                            value,
                            next: 0,
                        },
                    );
                    self.nodes[free] = Node {
                        key: occupant.key,
                        value: occupant.value,
                        next: moved_next,
                    };
                    self.used += 1;
                    return;
                }
            }

            // The main position anchors a chain (live anchor, or a
            // removed node still wired into one): place the new key at
            // the free node, linked right behind the anchor.
            self.nodes[free] = Node {
                key,
                value,
                next: if self.nodes[mp].next != 0 {
                    let target = (mp as i64 + self.nodes[mp].next as i64) as usize;
                    (target as i64 - free as i64) as i32
                } else {
                    0
                },
            };
            self.nodes[mp].next = (free as i64 - mp as i64) as i32;
            self.used += 1;
            return;
        }
    }

    /// A node is reusable when it holds no key and ends no chain. A
    /// removed tail may still be the target of an incoming link; handing
    /// it out is safe because the truncated chain had nothing beyond it.
    fn take_free_slot(&mut self) -> Option<usize> {
        while self.free_pos > 0 {
            self.free_pos -= 1;
            let node = &self.nodes[self.free_pos];
            if node.is_free() && node.next == 0 {
                return Some(self.free_pos);
            }
        }
        None
    }

    fn size_for(&self, live: usize) -> usize {
        let mut size = self.nodes.len().max(MIN_NODES);
        if live * 4 > size * 3 {
            size *= 2;
        } else if size > MIN_NODES && live * 4 <= size {
            size /= 2;
        }
        size
    }

    fn rebuild(&mut self, new_size: usize) {
        let new_size = new_size.next_power_of_two().max(MIN_NODES);
        let mut live: Vec<(NewtValue, NewtValue)> = Vec::with_capacity(self.used);
        for node in self.nodes.drain(..) {
            if !node.key.is_null() {
                live.push((node.key, node.value));
            }
        }
        self.nodes.resize_with(new_size, || Node::EMPTY);
        self.free_pos = new_size;
        self.used = 0;
        for (key, value) in live {
            self.insert_new(key, value);
        }
    }

    /// Remove a slot, yielding its value. Shrinks the node array once
    /// the load drops to 1/4.
    pub fn remove(&mut self, key: &NewtValue) -> Option<NewtValue> {
        let pos = self.find(key)?;
        let value = std::mem::take(&mut self.nodes[pos].value);
        self.nodes[pos].key = NewtValue::Null;
        self.used -= 1;
        if self.nodes.len() > MIN_NODES && self.used * 4 <= self.nodes.len() {
            self.rebuild(self.nodes.len() / 2);
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        for node in &mut self.nodes {
            *node = Node::EMPTY;
        }
        self.free_pos = self.nodes.len();
        self.used = 0;
    }

    /// Cursor-driven iteration: 0 starts, each call returns the slot and
    /// the cursor for the next one, None when exhausted. Order is
    /// unspecified but stable while the table is not mutated.
    pub fn next(&self, cursor: i64) -> Option<(NewtValue, NewtValue, i64)> {
        if cursor < 0 {
            return None;
        }
        let mut pos = cursor as usize;
        while pos < self.nodes.len() {
            let node = &self.nodes[pos];
            if !node.key.is_null() {
                return Some((node.key.clone(), node.value.clone(), pos as i64 + 1));
            }
            pos += 1;
        }
        None
    }

    /// Shallow copy: same keys, values and delegate, fresh node layout.
    pub fn snapshot(&self) -> NewtTable {
        let mut copy = NewtTable::with_capacity(self.used);
        let mut cursor = 0;
        while let Some((key, value, next)) = self.next(cursor) {
            copy.new_slot(key, value);
            cursor = next;
        }
        copy.delegate = self.delegate.clone();
        copy
    }

    pub fn delegate(&self) -> Option<&GcRef<NewtTable>> {
        self.delegate.as_ref()
    }

    pub(crate) fn set_delegate_unchecked(&mut self, delegate: Option<GcRef<NewtTable>>) {
        self.delegate = delegate;
    }
}

impl Default for NewtTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Install `delegate` on `table`, rejecting any assignment that would
/// make the table its own transitive delegate.
pub fn set_table_delegate(table: &GcRef<NewtTable>, delegate: Option<GcRef<NewtTable>>) -> bool {
    if let Some(ref candidate) = delegate {
        let mut walk = Some(candidate.clone());
        while let Some(current) = walk {
            if current.ptr_eq(table) {
                return false;
            }
            walk = current.borrow().delegate().cloned();
        }
    }
    table.borrow_mut().set_delegate_unchecked(delegate);
    true
}

impl Trace for NewtTable {
    fn trace(&self, marker: &mut Marker) {
        for node in &self.nodes {
            if !node.key.is_null() {
                marker.mark_value(&node.key);
                marker.mark_value(&node.value);
            }
        }
        if let Some(delegate) = &self.delegate {
            marker.mark_object(delegate.as_dyn());
        }
    }

    fn finalize(&mut self) {
        self.nodes.clear();
        self.free_pos = 0;
        self.used = 0;
        self.delegate = None;
    }
}

// ============ tests ============
