use std::rc::Rc;

use crate::newt_value::{NewtString, NewtValue};
use crate::newt_vm::Instruction;

/// Where a captured variable lives at closure-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterKind {
    /// A slot of the enclosing frame.
    Local,
    /// An outer already captured by the enclosing closure.
    Outer,
}

/// Capture description; `src` is a frame slot or an index into the
/// enclosing closure's outer list, depending on `kind`.
#[derive(Debug, Clone)]
pub struct OuterDesc {
    pub kind: OuterKind,
    pub src: u32,
    pub name: NewtString,
}

#[derive(Debug, Clone, Copy)]
pub struct LineInfo {
    pub ip: u32,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct LocalVarInfo {
    pub name: NewtString,
    pub slot: u32,
    pub start_ip: u32,
    pub end_ip: u32,
}

/// Immutable description of a compiled function. Shared by every closure
/// instantiated from it; literals hold only scalars, strings and child
/// prototypes, so prototypes sit outside the cycle collector.
pub struct FunctionProto {
    /// Function name for diagnostics, a string or Null for anonymous.
    pub name: NewtValue,
    /// Name of the compilation unit the function came from.
    pub source_name: NewtValue,
    pub code: Vec<Instruction>,
    pub literals: Vec<NewtValue>,
    pub parameters: Vec<NewtString>,
    /// Frame slots the compiler filled with default values; instantiation
    /// copies them into the closure, rightmost parameters first.
    pub default_param_regs: Vec<u32>,
    pub has_varargs: bool,
    /// Calling instantiates a generator instead of running the body.
    pub is_generator: bool,
    pub outer_descs: Vec<OuterDesc>,
    pub child_protos: Vec<Rc<FunctionProto>>,
    pub local_vars: Vec<LocalVarInfo>,
    pub line_info: Vec<LineInfo>,
    /// Frame slots the function needs, parameters included.
    pub stack_size: usize,
}

impl FunctionProto {
    pub fn new(name: NewtValue, source_name: NewtValue) -> Self {
        Self {
            name,
            source_name,
            code: Vec::new(),
            literals: Vec::new(),
            parameters: Vec::new(),
            default_param_regs: Vec::new(),
            has_varargs: false,
            is_generator: false,
            outer_descs: Vec::new(),
            child_protos: Vec::new(),
            local_vars: Vec::new(),
            line_info: Vec::new(),
            stack_size: 0,
        }
    }

    #[inline]
    pub fn param_count(&self) -> usize {
        self.parameters.len()
    }

    #[inline]
    pub fn outer_count(&self) -> usize {
        self.outer_descs.len()
    }

    pub fn name_str(&self) -> &str {
        match &self.name {
            NewtValue::String(s) => s.as_str(),
            _ => "unknown",
        }
    }

    pub fn source_str(&self) -> &str {
        match &self.source_name {
            NewtValue::String(s) => s.as_str(),
            _ => "??",
        }
    }

    /// Source line for an instruction pointer, from the nearest line
    /// record at or before it.
    pub fn line_at(&self, ip: usize) -> u32 {
        let ip = ip as u32;
        let mut line = 0;
        for info in &self.line_info {
            if info.ip > ip {
                break;
            }
            line = info.line;
        }
        line
    }

    /// Name of the local occupying `slot` at `ip`, for diagnostics.
    pub fn local_name_at(&self, slot: u32, ip: usize) -> Option<&NewtString> {
        let ip = ip as u32;
        self.local_vars
            .iter()
            .find(|lv| lv.slot == slot && lv.start_ip <= ip && ip <= lv.end_ip)
            .map(|lv| &lv.name)
    }
}

impl std::fmt::Debug for FunctionProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionProto")
            .field("name", &self.name)
            .field("params", &self.parameters.len())
            .field("code", &self.code.len())
            .field("literals", &self.literals.len())
            .finish()
    }
}
