//! Flat binary form of a function prototype, for shipping precompiled
//! code between processes or caching it on disk. Each function record is
//! a run of tagged sections; nested functions recurse inside their
//! parent's record. Strings are re-interned on the way in.

use std::fmt;
use std::io::{Cursor, Read};
use std::rc::Rc;

use crate::newt_value::{
    FunctionProto, LineInfo, LocalVarInfo, NewtString, NewtValue, OuterDesc, OuterKind,
};
use crate::newt_vm::opcode::{Instruction, Op};
use crate::newt_vm::shared_state::SharedState;

const MAGIC: &[u8] = b"\x1bNewt";
const VERSION: u8 = 1;

// Section tags, one ahead of each section of a function record.
const SEC_NAMES: u8 = b'n';
const SEC_SHAPE: u8 = b's';
const SEC_LITERALS: u8 = b'l';
const SEC_PARAMS: u8 = b'p';
const SEC_OUTERS: u8 = b'o';
const SEC_LOCALS: u8 = b'v';
const SEC_LINES: u8 = b'i';
const SEC_DEFAULTS: u8 = b'd';
const SEC_CODE: u8 = b'c';
const SEC_CHILDREN: u8 = b'f';
const SEC_END: u8 = b'e';

// Literal tags.
const LIT_NULL: u8 = 0;
const LIT_FALSE: u8 = 1;
const LIT_TRUE: u8 = 2;
const LIT_INT: u8 = 3;
const LIT_FLOAT: u8 = 4;
const LIT_STRING: u8 = 5;

/// Why a bytecode stream was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    /// The stream ends in the middle of a record.
    Truncated,
    BadMagic,
    UnsupportedVersion(u8),
    /// A section started with the wrong tag byte.
    BadSection { expected: u8, found: u8 },
    UnknownLiteralTag(u8),
    UnknownOpcode(u8),
    BadOuterKind(u8),
    /// Literal of a kind the flat form cannot carry.
    UnsupportedLiteral(&'static str),
    InvalidUtf8,
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::Truncated => write!(f, "bytecode stream is truncated"),
            SerializeError::BadMagic => write!(f, "not a newt bytecode stream"),
            SerializeError::UnsupportedVersion(v) => {
                write!(f, "unsupported bytecode version {}", v)
            }
            SerializeError::BadSection { expected, found } => write!(
                f,
                "expected section '{}', found '{}'",
                *expected as char, *found as char
            ),
            SerializeError::UnknownLiteralTag(t) => write!(f, "unknown literal tag {}", t),
            SerializeError::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
            SerializeError::BadOuterKind(k) => write!(f, "unknown outer kind {}", k),
            SerializeError::UnsupportedLiteral(t) => {
                write!(f, "a {} literal cannot be serialized", t)
            }
            SerializeError::InvalidUtf8 => write!(f, "string data is not valid utf-8"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Flatten a prototype, nested functions included.
pub fn write_proto(proto: &FunctionProto) -> Result<Vec<u8>, SerializeError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    buf.push(VERSION);
    write_function(&mut buf, proto)?;
    buf.push(SEC_END);
    Ok(buf)
}

/// Rebuild a prototype from `write_proto` output.
pub fn read_proto(
    state: &mut SharedState,
    data: &[u8],
) -> Result<Rc<FunctionProto>, SerializeError> {
    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 5];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| SerializeError::Truncated)?;
    if magic != *MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let version = read_u8(&mut cursor)?;
    if version != VERSION {
        return Err(SerializeError::UnsupportedVersion(version));
    }
    let proto = read_function(state, &mut cursor)?;
    expect_section(&mut cursor, SEC_END)?;
    Ok(Rc::new(proto))
}

fn write_function(buf: &mut Vec<u8>, proto: &FunctionProto) -> Result<(), SerializeError> {
    buf.push(SEC_NAMES);
    write_value(buf, &proto.name)?;
    write_value(buf, &proto.source_name)?;

    buf.push(SEC_SHAPE);
    write_u32(buf, proto.stack_size as u32);
    buf.push(proto.has_varargs as u8);
    buf.push(proto.is_generator as u8);

    buf.push(SEC_LITERALS);
    write_u32(buf, proto.literals.len() as u32);
    for literal in &proto.literals {
        write_value(buf, literal)?;
    }

    buf.push(SEC_PARAMS);
    write_u32(buf, proto.parameters.len() as u32);
    for param in &proto.parameters {
        write_str(buf, param.as_str());
    }

    buf.push(SEC_OUTERS);
    write_u32(buf, proto.outer_descs.len() as u32);
    for desc in &proto.outer_descs {
        buf.push(match desc.kind {
            OuterKind::Local => 0,
            OuterKind::Outer => 1,
        });
        write_u32(buf, desc.src);
        write_str(buf, desc.name.as_str());
    }

    buf.push(SEC_LOCALS);
    write_u32(buf, proto.local_vars.len() as u32);
    for lv in &proto.local_vars {
        write_str(buf, lv.name.as_str());
        write_u32(buf, lv.slot);
        write_u32(buf, lv.start_ip);
        write_u32(buf, lv.end_ip);
    }

    buf.push(SEC_LINES);
    write_u32(buf, proto.line_info.len() as u32);
    for li in &proto.line_info {
        write_u32(buf, li.ip);
        write_u32(buf, li.line);
    }

    buf.push(SEC_DEFAULTS);
    write_u32(buf, proto.default_param_regs.len() as u32);
    for &reg in &proto.default_param_regs {
        write_u32(buf, reg);
    }

    buf.push(SEC_CODE);
    write_u32(buf, proto.code.len() as u32);
    for inst in &proto.code {
        buf.push(inst.op as u8);
        buf.push(inst.a0);
        buf.extend_from_slice(&inst.a1.to_le_bytes());
        buf.push(inst.a2);
        buf.push(inst.a3);
    }

    buf.push(SEC_CHILDREN);
    write_u32(buf, proto.child_protos.len() as u32);
    for child in &proto.child_protos {
        write_function(buf, child)?;
    }
    Ok(())
}

fn read_function(
    state: &mut SharedState,
    cursor: &mut Cursor<&[u8]>,
) -> Result<FunctionProto, SerializeError> {
    expect_section(cursor, SEC_NAMES)?;
    let name = read_value(state, cursor)?;
    let source_name = read_value(state, cursor)?;

    expect_section(cursor, SEC_SHAPE)?;
    let stack_size = read_u32(cursor)? as usize;
    let has_varargs = read_u8(cursor)? != 0;
    let is_generator = read_u8(cursor)? != 0;

    expect_section(cursor, SEC_LITERALS)?;
    let count = read_u32(cursor)? as usize;
    let mut literals = Vec::with_capacity(count);
    for _ in 0..count {
        literals.push(read_value(state, cursor)?);
    }

    expect_section(cursor, SEC_PARAMS)?;
    let count = read_u32(cursor)? as usize;
    let mut parameters = Vec::with_capacity(count);
    for _ in 0..count {
        parameters.push(read_str(state, cursor)?);
    }

    expect_section(cursor, SEC_OUTERS)?;
    let count = read_u32(cursor)? as usize;
    let mut outer_descs = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = match read_u8(cursor)? {
            0 => OuterKind::Local,
            1 => OuterKind::Outer,
            other => return Err(SerializeError::BadOuterKind(other)),
        };
        let src = read_u32(cursor)?;
        let name = read_str(state, cursor)?;
        outer_descs.push(OuterDesc { kind, src, name });
    }

    expect_section(cursor, SEC_LOCALS)?;
    let count = read_u32(cursor)? as usize;
    let mut local_vars = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_str(state, cursor)?;
        let slot = read_u32(cursor)?;
        let start_ip = read_u32(cursor)?;
        let end_ip = read_u32(cursor)?;
        local_vars.push(LocalVarInfo {
            name,
            slot,
            start_ip,
            end_ip,
        });
    }

    expect_section(cursor, SEC_LINES)?;
    let count = read_u32(cursor)? as usize;
    let mut line_info = Vec::with_capacity(count);
    for _ in 0..count {
        let ip = read_u32(cursor)?;
        let line = read_u32(cursor)?;
        line_info.push(LineInfo { ip, line });
    }

    expect_section(cursor, SEC_DEFAULTS)?;
    let count = read_u32(cursor)? as usize;
    let mut default_param_regs = Vec::with_capacity(count);
    for _ in 0..count {
        default_param_regs.push(read_u32(cursor)?);
    }

    expect_section(cursor, SEC_CODE)?;
    let count = read_u32(cursor)? as usize;
    let mut code = Vec::with_capacity(count);
    for _ in 0..count {
        let op_byte = read_u8(cursor)?;
        let op = Op::from_u8(op_byte).ok_or(SerializeError::UnknownOpcode(op_byte))?;
        let a0 = read_u8(cursor)?;
        let a1 = read_i32(cursor)?;
        let a2 = read_u8(cursor)?;
        let a3 = read_u8(cursor)?;
        code.push(Instruction::new(op, a0, a1, a2, a3));
    }

    expect_section(cursor, SEC_CHILDREN)?;
    let count = read_u32(cursor)? as usize;
    let mut child_protos = Vec::with_capacity(count);
    for _ in 0..count {
        child_protos.push(Rc::new(read_function(state, cursor)?));
    }

    Ok(FunctionProto {
        name,
        source_name,
        code,
        literals,
        parameters,
        default_param_regs,
        has_varargs,
        is_generator,
        outer_descs,
        child_protos,
        local_vars,
        line_info,
        stack_size,
    })
}

fn write_value(buf: &mut Vec<u8>, value: &NewtValue) -> Result<(), SerializeError> {
    match value {
        NewtValue::Null => buf.push(LIT_NULL),
        NewtValue::Bool(false) => buf.push(LIT_FALSE),
        NewtValue::Bool(true) => buf.push(LIT_TRUE),
        NewtValue::Integer(i) => {
            buf.push(LIT_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        NewtValue::Float(x) => {
            buf.push(LIT_FLOAT);
            buf.extend_from_slice(&x.to_le_bytes());
        }
        NewtValue::String(s) => {
            buf.push(LIT_STRING);
            write_str(buf, s.as_str());
        }
        other => return Err(SerializeError::UnsupportedLiteral(other.type_name())),
    }
    Ok(())
}

fn read_value(
    state: &mut SharedState,
    cursor: &mut Cursor<&[u8]>,
) -> Result<NewtValue, SerializeError> {
    let tag = read_u8(cursor)?;
    match tag {
        LIT_NULL => Ok(NewtValue::Null),
        LIT_FALSE => Ok(NewtValue::Bool(false)),
        LIT_TRUE => Ok(NewtValue::Bool(true)),
        LIT_INT => Ok(NewtValue::Integer(read_i64(cursor)?)),
        LIT_FLOAT => Ok(NewtValue::Float(read_f64(cursor)?)),
        LIT_STRING => Ok(NewtValue::String(read_str(state, cursor)?)),
        other => Err(SerializeError::UnknownLiteralTag(other)),
    }
}

fn expect_section(cursor: &mut Cursor<&[u8]>, expected: u8) -> Result<(), SerializeError> {
    let found = read_u8(cursor)?;
    if found != expected {
        return Err(SerializeError::BadSection { expected, found });
    }
    Ok(())
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, SerializeError> {
    let mut buf = [0u8; 1];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, SerializeError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, SerializeError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64, SerializeError> {
    let mut buf = [0u8; 8];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f64(cursor: &mut Cursor<&[u8]>) -> Result<f64, SerializeError> {
    let mut buf = [0u8; 8];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_str(
    state: &mut SharedState,
    cursor: &mut Cursor<&[u8]>,
) -> Result<NewtString, SerializeError> {
    let len = read_u32(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| SerializeError::Truncated)?;
    let s = std::str::from_utf8(&buf).map_err(|_| SerializeError::InvalidUtf8)?;
    Ok(state.intern(s))
}
