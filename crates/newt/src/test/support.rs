//! Prototype assembly for scenario tests. The crate ships no compiler,
//! so tests build `FunctionProto` values by hand and feed them to the
//! dispatcher through `closure_from_proto`.

use std::rc::Rc;

use crate::newt_value::{FunctionProto, LineInfo, NewtString, NewtValue, OuterDesc, OuterKind};
use crate::newt_vm::{Instruction, NewtResult, NewtVm};

fn sym(vm: &mut NewtVm, s: &str) -> NewtString {
    match vm.intern(s) {
        NewtValue::String(s) => s,
        _ => unreachable!(),
    }
}

/// Builder over a raw prototype. Parameter slot 0 is always the
/// receiver; scratch registers follow the declared parameters.
pub struct Asm {
    proto: FunctionProto,
}

impl Asm {
    pub fn new(vm: &mut NewtVm, name: &str) -> Asm {
        let name = vm.intern(name);
        let source = vm.intern("test.nt");
        let mut proto = FunctionProto::new(name, source);
        proto.parameters.push(sym(vm, "this"));
        proto.stack_size = 8;
        Asm { proto }
    }

    pub fn param(&mut self, vm: &mut NewtVm, name: &str) {
        self.proto.parameters.push(sym(vm, name));
    }

    /// Register a literal; the returned index goes in `LoadLiteral`'s
    /// wide operand.
    pub fn lit(&mut self, value: NewtValue) -> i32 {
        self.proto.literals.push(value);
        (self.proto.literals.len() - 1) as i32
    }

    pub fn lit_str(&mut self, vm: &mut NewtVm, s: &str) -> i32 {
        let value = vm.intern(s);
        self.lit(value)
    }

    pub fn emit(&mut self, inst: Instruction) {
        self.proto.code.push(inst);
    }

    pub fn stack(&mut self, size: usize) {
        self.proto.stack_size = size;
    }

    pub fn varargs(&mut self) {
        self.proto.has_varargs = true;
    }

    pub fn generator(&mut self) {
        self.proto.is_generator = true;
    }

    /// Fill a missing trailing parameter from this register of the frame
    /// that creates the closure.
    pub fn default_param(&mut self, reg: u32) {
        self.proto.default_param_regs.push(reg);
    }

    /// Capture a stack slot of the enclosing frame as an outer.
    pub fn capture_local(&mut self, vm: &mut NewtVm, name: &str, slot: u32) {
        self.proto.outer_descs.push(OuterDesc {
            kind: OuterKind::Local,
            src: slot,
            name: sym(vm, name),
        });
    }

    /// Re-capture an outer of the enclosing closure.
    pub fn capture_outer(&mut self, vm: &mut NewtVm, name: &str, index: u32) {
        self.proto.outer_descs.push(OuterDesc {
            kind: OuterKind::Outer,
            src: index,
            name: sym(vm, name),
        });
    }

    pub fn line(&mut self, ip: u32, line: u32) {
        self.proto.line_info.push(LineInfo { ip, line });
    }

    /// Nest a function; the returned index goes in `Closure`'s wide
    /// operand.
    pub fn child(&mut self, child: Asm) -> i32 {
        self.proto.child_protos.push(child.build());
        (self.proto.child_protos.len() - 1) as i32
    }

    pub fn build(self) -> Rc<FunctionProto> {
        Rc::new(self.proto)
    }
}

/// Close over the assembled prototype and call it on the main thread
/// with the root table as receiver.
pub fn run(vm: &mut NewtVm, asm: Asm, args: &[NewtValue]) -> NewtResult<NewtValue> {
    let f = vm.closure_from_proto(asm.build());
    let this = vm.root_table();
    vm.call(&f, this, args)
}

/// The pending error value rendered as text.
pub fn error_text(vm: &NewtVm) -> String {
    vm.last_error().to_string()
}
