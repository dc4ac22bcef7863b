use crate::gc::{Marker, Trace};
use crate::newt_value::NewtValue;

/// Dense, growable sequence. Indexing is bounds-checked here; turning a
/// miss into a runtime error is the engine's job.
pub struct NewtArray {
    items: Vec<NewtValue>,
}

impl NewtArray {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn with_len(len: usize) -> Self {
        let mut items = Vec::new();
        items.resize(len, NewtValue::Null);
        Self { items }
    }

    pub fn from_values(items: Vec<NewtValue>) -> Self {
        Self { items }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<NewtValue> {
        self.items.get(index).cloned()
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: NewtValue) -> bool {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, value: NewtValue) {
        self.items.push(value);
    }

    pub fn pop(&mut self) -> Option<NewtValue> {
        self.items.pop()
    }

    pub fn top(&self) -> Option<NewtValue> {
        self.items.last().cloned()
    }

    /// Insert before `index`; `index == len` appends.
    pub fn insert(&mut self, index: usize, value: NewtValue) -> bool {
        if index > self.items.len() {
            return false;
        }
        self.items.insert(index, value);
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<NewtValue> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    /// Grow with nulls or truncate.
    pub fn resize(&mut self, new_len: usize) {
        self.items.resize(new_len, NewtValue::Null);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn reverse(&mut self) {
        self.items.reverse();
    }

    pub fn extend_from(&mut self, other: &NewtArray) {
        self.items.extend(other.items.iter().cloned());
    }

    pub fn values(&self) -> &[NewtValue] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<NewtValue> {
        self.items.clone()
    }

    /// Cursor-driven iteration in index order; cursor is the next index.
    pub fn next(&self, cursor: i64) -> Option<(NewtValue, NewtValue, i64)> {
        if cursor < 0 {
            return None;
        }
        let index = cursor as usize;
        let value = self.items.get(index)?;
        Some((
            NewtValue::Integer(index as i64),
            value.clone(),
            cursor + 1,
        ))
    }
}

impl Default for NewtArray {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace for NewtArray {
    fn trace(&self, marker: &mut Marker) {
        marker.mark_values(&self.items);
    }

    fn finalize(&mut self) {
        self.items.clear();
    }
}
