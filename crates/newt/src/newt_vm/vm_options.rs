#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Initial size of a thread's value stack, in slots.
    pub initial_stack_size: usize,
    /// Hard cap on the value stack; growth past this is a stack overflow.
    pub max_stack_size: usize,
    /// Maximum script call depth per thread.
    pub max_call_depth: usize,
    /// Maximum recursion through native closures and metamethods.
    /// Guards against runaway host <-> script mutual recursion.
    pub max_native_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            initial_stack_size: 256,
            max_stack_size: 1_000_000,
            max_call_depth: 256,
            max_native_depth: 100,
        }
    }
}
