// Scenario tests: each file drives one area of the engine through
// hand-assembled prototypes (see `support`) and the host API.
pub mod support;

pub mod test_bytecode;
pub mod test_gc;
pub mod test_iterate;
pub mod test_slots;
pub mod test_threads;
