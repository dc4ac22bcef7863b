use crate::gc::{Marker, Trace};
use crate::newt_value::weak_ref::weak_ref_value;
use crate::newt_value::{NewtValue, OuterCell};
use crate::newt_vm::call_info::Trap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Captured and waiting for a resume.
    Suspended,
    /// Currently executing on some thread.
    Running,
    /// Returned, errored, or force-killed; resuming is an error.
    Dead,
}

impl GeneratorState {
    pub fn as_str(self) -> &'static str {
        match self {
            GeneratorState::Suspended => "suspended",
            GeneratorState::Running => "running",
            GeneratorState::Dead => "dead",
        }
    }
}

/// Everything a suspended generator needs to pick up where it yielded:
/// instruction pointer, the frame's value window, the traps the frame
/// owned (rebased to window-relative offsets), and the outer cells that
/// were open into the window, closed against their slot's value and
/// remembered by relative slot so resume can re-open them.
pub struct SavedFrame {
    pub ip: usize,
    pub window: Vec<NewtValue>,
    pub traps: Vec<Trap>,
    pub detached_outers: Vec<(usize, OuterCell)>,
}

/// Suspended function activation. The receiver slot of the saved window
/// is weakened so a generator stored inside its own receiver does not pin
/// the pair between collections.
pub struct NewtGenerator {
    pub closure: NewtValue,
    pub state: GeneratorState,
    frame: Option<SavedFrame>,
}

impl NewtGenerator {
    pub fn new(closure: NewtValue) -> Self {
        Self {
            closure,
            state: GeneratorState::Running,
            frame: None,
        }
    }

    /// Park the generator with a captured frame. The caller has already
    /// nulled the live slots it copied out.
    pub fn suspend(&mut self, mut frame: SavedFrame) {
        if let Some(receiver) = frame.window.first_mut() {
            let weakened = weak_ref_value(receiver);
            *receiver = weakened;
        }
        self.frame = Some(frame);
        self.state = GeneratorState::Suspended;
    }

    /// Hand the saved frame back for splicing onto a thread. The receiver
    /// slot is strengthened again; a collected receiver comes back Null.
    pub fn resume_frame(&mut self) -> Option<SavedFrame> {
        let mut frame = self.frame.take()?;
        if let Some(receiver) = frame.window.first_mut() {
            if let NewtValue::WeakRef(w) = receiver {
                *receiver = w.deref_value();
            }
        }
        self.state = GeneratorState::Running;
        Some(frame)
    }

    pub fn kill(&mut self) {
        self.state = GeneratorState::Dead;
        self.frame = None;
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state == GeneratorState::Dead
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state == GeneratorState::Suspended
    }
}

impl Trace for NewtGenerator {
    fn trace(&self, marker: &mut Marker) {
        marker.mark_value(&self.closure);
        if let Some(frame) = &self.frame {
            marker.mark_values(&frame.window);
            for (_, cell) in &frame.detached_outers {
                cell.trace_into(marker);
            }
        }
    }

    fn finalize(&mut self) {
        self.closure = NewtValue::Null;
        self.frame = None;
        self.state = GeneratorState::Dead;
    }
}
