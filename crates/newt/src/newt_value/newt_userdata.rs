use std::rc::Rc;

use crate::gc::{GcRef, Marker, Trace};
use crate::newt_value::NewtTable;

/// Host callback fired exactly once, when the owning object's memory is
/// released. Receives the object's user byte buffer.
pub type ReleaseHook = Rc<dyn Fn(&mut [u8])>;

/// Opaque host-owned byte blob with an optional delegate table for
/// script-visible behavior and a type tag for host-side downcasts.
pub struct NewtUserData {
    pub data: Vec<u8>,
    pub delegate: Option<GcRef<NewtTable>>,
    pub type_tag: usize,
    pub release_hook: Option<ReleaseHook>,
}

impl NewtUserData {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            delegate: None,
            type_tag: 0,
            release_hook: None,
        }
    }
}

impl Trace for NewtUserData {
    fn trace(&self, marker: &mut Marker) {
        if let Some(delegate) = &self.delegate {
            marker.mark_object(delegate.as_dyn());
        }
    }

    fn finalize(&mut self) {
        // The byte buffer stays; the release hook still wants it when
        // the memory actually goes away.
        self.delegate = None;
    }
}

impl Drop for NewtUserData {
    fn drop(&mut self) {
        if let Some(hook) = self.release_hook.take() {
            hook(&mut self.data);
        }
    }
}
