//=====================================================
// File: image/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript binary image codec
// Objective: Serialize compiled programs (header, metadata, globals, namespace table,
//            instructions) and load them back, re-resolving host bindings
//=====================================================

mod varint;

use std::collections::BTreeMap;

use crate::ast::{BinaryOp, Position, SourceRange, UnaryOp};
use crate::error::ImageError;
use crate::host::{HostRegistry, TypeRef};
use crate::vm::instruction::{Constant, DebugContext, FunctionRef, HostFunctionRef, Instruction};
use crate::vm::program::{CompiledProgram, FunctionEntry, NamespaceNode, NamespaceTable};

pub use varint::{ImageReader, ImageWriter};

pub const MAGIC: &[u8; 4] = b"MRNI";
pub const VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Omit magic, version and metadata.
    pub compact: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// The image is compact and comes from a trusted producer: no header is expected and
    /// jump targets are not re-validated. Host bindings are always re-resolved.
    pub trusted: bool,
}

pub fn encode(program: &CompiledProgram, options: EncodeOptions) -> Vec<u8> {
    let mut writer = ImageWriter::new();
    if !options.compact {
        writer.raw(MAGIC);
        writer.varint(VERSION);
        writer.count(program.metadata.len());
        for (key, value) in &program.metadata {
            writer.string(key);
            writer.string(value);
        }
    }
    writer.strings(&program.globals);
    write_namespaces(&mut writer, &program.namespaces);
    writer.count(program.instructions.len());
    for instruction in &program.instructions {
        write_instruction(&mut writer, instruction);
    }
    let bytes = writer.into_bytes();
    tracing::debug!(
        bytes = bytes.len(),
        instructions = program.instructions.len(),
        compact = options.compact,
        "encoded image"
    );
    bytes
}

/// Decodes an image and binds it against `registry`. Bound host references must resolve
/// to registered descriptors; unbound names stay deferred to run time.
pub fn decode(
    bytes: &[u8],
    registry: &HostRegistry,
    options: DecodeOptions,
) -> Result<CompiledProgram, ImageError> {
    let program = read(bytes, options)?;
    bind(&program.instructions, registry)?;
    Ok(program)
}

/// Parses an image without touching a host registry. Host references keep their
/// recorded signatures but are not checked; used by tooling that only inspects images.
pub fn read(bytes: &[u8], options: DecodeOptions) -> Result<CompiledProgram, ImageError> {
    let mut reader = ImageReader::new(bytes);
    let mut metadata = BTreeMap::new();
    if !options.trusted {
        if reader.raw(MAGIC.len()).map_err(|_| ImageError::InvalidHeader)? != MAGIC {
            return Err(ImageError::InvalidHeader);
        }
        let version = reader.varint()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let count = reader.count()?;
        for _ in 0..count {
            let key = reader.string()?;
            let value = reader.string()?;
            metadata.insert(key, value);
        }
    }

    let globals = reader.strings()?;
    let namespaces = read_namespaces(&mut reader)?;
    let count = reader.count()?;
    let mut instructions = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        instructions.push(read_instruction(&mut reader)?);
    }
    if reader.remaining() > 0 {
        return Err(ImageError::TrailingBytes {
            count: reader.remaining(),
        });
    }

    if !options.trusted {
        validate_jumps(&instructions)?;
    }

    tracing::debug!(
        instructions = instructions.len(),
        trusted = options.trusted,
        "decoded image"
    );
    Ok(CompiledProgram {
        instructions,
        namespaces,
        globals,
        metadata,
    })
}

fn validate_jumps(instructions: &[Instruction]) -> Result<(), ImageError> {
    for (index, instruction) in instructions.iter().enumerate() {
        if let Some(target) = instruction.jump_target()
            && target >= instructions.len()
        {
            return Err(ImageError::InvalidJumpTarget { index, target });
        }
    }
    Ok(())
}

fn bind(instructions: &[Instruction], registry: &HostRegistry) -> Result<(), ImageError> {
    for instruction in instructions {
        match instruction {
            Instruction::CallHost {
                binding: Some(reference),
                ..
            } => {
                if registry
                    .function_by_signature(&reference.name, &reference.signature)
                    .is_none()
                {
                    return Err(ImageError::UnresolvedFunction {
                        signature: reference.to_string(),
                    });
                }
            }
            Instruction::CallStatic {
                type_name,
                bound: true,
                ..
            }
            | Instruction::LoadStatic {
                type_name,
                bound: true,
                ..
            } => {
                if registry.type_named(type_name).is_none() {
                    return Err(ImageError::UnresolvedType {
                        name: type_name.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// Namespace table: nodes in breadth-first order, root first. Each node lists its
// functions and then its children as (name, node index).

fn write_namespaces(writer: &mut ImageWriter, table: &NamespaceTable) {
    let mut order: Vec<&NamespaceNode> = vec![table.root()];
    let mut next = 0;
    while next < order.len() {
        let node = order[next];
        next += 1;
        order.extend(node.children.values());
    }

    writer.count(order.len());
    let mut child_index = 1;
    for node in &order {
        writer.count(node.functions.len());
        for (name, entry) in &node.functions {
            writer.string(name);
            writer.count(entry.offset);
            writer.varint(u64::from(entry.arity));
        }
        writer.count(node.children.len());
        for name in node.children.keys() {
            writer.string(name);
            writer.count(child_index);
            child_index += 1;
        }
    }
}

fn read_namespaces(reader: &mut ImageReader<'_>) -> Result<NamespaceTable, ImageError> {
    let count = reader.count()?;
    if count == 0 {
        return Err(ImageError::MalformedNamespaceTable("missing root node".into()));
    }

    let mut raw = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let function_count = reader.count()?;
        let mut functions = BTreeMap::new();
        for _ in 0..function_count {
            let name = reader.string()?;
            let offset = reader.count()?;
            let arity = reader.u32()?;
            functions.insert(name, FunctionEntry { offset, arity });
        }
        let child_count = reader.count()?;
        let mut children = Vec::with_capacity(child_count.min(reader.remaining()));
        for _ in 0..child_count {
            let name = reader.string()?;
            let index = reader.count()?;
            children.push((name, index));
        }
        raw.push((functions, children));
    }

    // Children always come after their parent, so build from the back.
    let mut built: Vec<Option<NamespaceNode>> = (0..count).map(|_| None).collect();
    let mut claimed = vec![false; count];
    for index in (0..count).rev() {
        let (functions, children) = std::mem::take(&mut raw[index]);
        let mut node = NamespaceNode {
            functions,
            children: BTreeMap::new(),
        };
        for (name, child) in children {
            if child <= index || child >= count || claimed[child] {
                return Err(ImageError::MalformedNamespaceTable(format!(
                    "node {index} has invalid child index {child}"
                )));
            }
            claimed[child] = true;
            let child_node = built[child].take().ok_or_else(|| {
                ImageError::MalformedNamespaceTable(format!("node {child} is missing"))
            })?;
            node.children.insert(name, child_node);
        }
        built[index] = Some(node);
    }
    if let Some(orphan) = claimed.iter().skip(1).position(|claimed| !claimed) {
        return Err(ImageError::MalformedNamespaceTable(format!(
            "node {} is unreachable",
            orphan + 1
        )));
    }

    let root = built
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| ImageError::MalformedNamespaceTable("missing root node".into()))?;
    Ok(NamespaceTable::from_root(root))
}

mod op {
    pub const NOP: u8 = 0;
    pub const PUSH_CONST: u8 = 1;
    pub const LOAD_LOCAL: u8 = 2;
    pub const STORE_LOCAL: u8 = 3;
    pub const LOAD_GLOBAL: u8 = 4;
    pub const STORE_GLOBAL: u8 = 5;
    pub const POP: u8 = 6;
    pub const BINARY: u8 = 7;
    pub const UNARY: u8 = 8;
    pub const JUMP: u8 = 9;
    pub const JUMP_IF_FALSE: u8 = 10;
    pub const JUMP_IF_FALSE_KEEP: u8 = 11;
    pub const JUMP_IF_TRUE_KEEP: u8 = 12;
    pub const CALL: u8 = 13;
    pub const CALL_HOST: u8 = 14;
    pub const CALL_METHOD: u8 = 15;
    pub const CALL_STATIC: u8 = 16;
    pub const INVOKE: u8 = 17;
    pub const MAKE_CLOSURE: u8 = 18;
    pub const LOAD_FIELD: u8 = 19;
    pub const STORE_FIELD: u8 = 20;
    pub const LOAD_STATIC: u8 = 21;
    pub const LOAD_INDEX: u8 = 22;
    pub const STORE_INDEX: u8 = 23;
    pub const MAKE_ARRAY: u8 = 24;
    pub const GET_ITERATOR: u8 = 25;
    pub const ITER_NEXT: u8 = 26;
    pub const ITER_CURRENT: u8 = 27;
    pub const YIELD: u8 = 28;
    pub const RETURN: u8 = 29;
    pub const ALLOC_FRAME: u8 = 30;
    pub const PUSH_DEBUG: u8 = 31;
    pub const POP_DEBUG: u8 = 32;
    pub const CHECK_STEP: u8 = 33;
}

fn write_instruction(writer: &mut ImageWriter, instruction: &Instruction) {
    match instruction {
        Instruction::Nop => writer.byte(op::NOP),
        Instruction::PushConst(constant) => {
            writer.byte(op::PUSH_CONST);
            write_constant(writer, constant);
        }
        Instruction::LoadLocal(slot) => write_u32_op(writer, op::LOAD_LOCAL, *slot),
        Instruction::StoreLocal(slot) => write_u32_op(writer, op::STORE_LOCAL, *slot),
        Instruction::LoadGlobal(slot) => write_u32_op(writer, op::LOAD_GLOBAL, *slot),
        Instruction::StoreGlobal(slot) => write_u32_op(writer, op::STORE_GLOBAL, *slot),
        Instruction::Pop => writer.byte(op::POP),
        Instruction::Binary(binary) => {
            writer.byte(op::BINARY);
            writer.byte(binary_tag(*binary));
        }
        Instruction::Unary(unary) => {
            writer.byte(op::UNARY);
            writer.byte(match unary {
                UnaryOp::Neg => 0,
                UnaryOp::Not => 1,
            });
        }
        Instruction::Jump(target) => write_jump(writer, op::JUMP, *target),
        Instruction::JumpIfFalse(target) => write_jump(writer, op::JUMP_IF_FALSE, *target),
        Instruction::JumpIfFalseKeep(target) => {
            write_jump(writer, op::JUMP_IF_FALSE_KEEP, *target)
        }
        Instruction::JumpIfTrueKeep(target) => write_jump(writer, op::JUMP_IF_TRUE_KEEP, *target),
        Instruction::CallFunction { target, argc } => {
            writer.byte(op::CALL);
            write_function_ref(writer, target);
            writer.varint(u64::from(*argc));
        }
        Instruction::CallHost {
            name,
            argc,
            binding,
        } => {
            writer.byte(op::CALL_HOST);
            writer.string(name);
            writer.varint(u64::from(*argc));
            writer.flag(binding.is_some());
            if let Some(binding) = binding {
                writer.string(&binding.name);
                writer.count(binding.signature.len());
                for ty in &binding.signature {
                    write_type(writer, ty);
                }
            }
        }
        Instruction::CallMethod { name, argc } => {
            writer.byte(op::CALL_METHOD);
            writer.string(name);
            writer.varint(u64::from(*argc));
        }
        Instruction::CallStatic {
            type_name,
            name,
            argc,
            bound,
        } => {
            writer.byte(op::CALL_STATIC);
            writer.string(type_name);
            writer.string(name);
            writer.varint(u64::from(*argc));
            writer.flag(*bound);
        }
        Instruction::InvokeClosure { argc } => write_u32_op(writer, op::INVOKE, *argc),
        Instruction::MakeClosure { function } => {
            writer.byte(op::MAKE_CLOSURE);
            write_function_ref(writer, function);
        }
        Instruction::LoadField(name) => {
            writer.byte(op::LOAD_FIELD);
            writer.string(name);
        }
        Instruction::StoreField(name) => {
            writer.byte(op::STORE_FIELD);
            writer.string(name);
        }
        Instruction::LoadStatic {
            type_name,
            member,
            bound,
        } => {
            writer.byte(op::LOAD_STATIC);
            writer.string(type_name);
            writer.string(member);
            writer.flag(*bound);
        }
        Instruction::LoadIndex => writer.byte(op::LOAD_INDEX),
        Instruction::StoreIndex => writer.byte(op::STORE_INDEX),
        Instruction::MakeArray(count) => write_u32_op(writer, op::MAKE_ARRAY, *count),
        Instruction::GetIterator => writer.byte(op::GET_ITERATOR),
        Instruction::IterMoveNext => writer.byte(op::ITER_NEXT),
        Instruction::IterCurrent => writer.byte(op::ITER_CURRENT),
        Instruction::Yield => writer.byte(op::YIELD),
        Instruction::Return { params } => write_u32_op(writer, op::RETURN, *params),
        Instruction::AllocFrame(locals) => write_u32_op(writer, op::ALLOC_FRAME, *locals),
        Instruction::PushDebugContext(context) => {
            writer.byte(op::PUSH_DEBUG);
            writer.string(&context.unit);
            writer.string(&context.function);
            for value in [
                context.range.start.line,
                context.range.start.column,
                context.range.end.line,
                context.range.end.column,
            ] {
                writer.varint(u64::from(value));
            }
        }
        Instruction::PopDebugContext => writer.byte(op::POP_DEBUG),
        Instruction::CheckStep => writer.byte(op::CHECK_STEP),
    }
}

fn write_u32_op(writer: &mut ImageWriter, opcode: u8, operand: u32) {
    writer.byte(opcode);
    writer.varint(u64::from(operand));
}

fn write_jump(writer: &mut ImageWriter, opcode: u8, target: usize) {
    writer.byte(opcode);
    writer.count(target);
}

fn write_function_ref(writer: &mut ImageWriter, function: &FunctionRef) {
    writer.strings(&function.namespace);
    writer.string(&function.name);
}

fn write_constant(writer: &mut ImageWriter, constant: &Constant) {
    match constant {
        Constant::Unit => writer.byte(0),
        Constant::Bool(value) => {
            writer.byte(1);
            writer.flag(*value);
        }
        Constant::Int(value) => {
            writer.byte(2);
            writer.zigzag(*value);
        }
        Constant::Float(value) => {
            writer.byte(3);
            writer.f64(*value);
        }
        Constant::Str(value) => {
            writer.byte(4);
            writer.string(value);
        }
    }
}

fn write_type(writer: &mut ImageWriter, ty: &TypeRef) {
    match ty {
        TypeRef::Any => writer.byte(0),
        TypeRef::Named(name) => {
            writer.byte(1);
            writer.string(name);
        }
        TypeRef::Nullable(inner) => {
            writer.byte(2);
            write_type(writer, inner);
        }
        TypeRef::Generic(name) => {
            writer.byte(3);
            writer.string(name);
        }
        TypeRef::Instance { base, args } => {
            writer.byte(4);
            writer.string(base);
            writer.count(args.len());
            for arg in args {
                write_type(writer, arg);
            }
        }
    }
}

const BINARY_OPS: [BinaryOp; 13] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Mod,
    BinaryOp::Eq,
    BinaryOp::Ne,
    BinaryOp::Lt,
    BinaryOp::Le,
    BinaryOp::Gt,
    BinaryOp::Ge,
    BinaryOp::And,
    BinaryOp::Or,
];

fn binary_tag(op: BinaryOp) -> u8 {
    BINARY_OPS
        .iter()
        .position(|candidate| *candidate == op)
        .unwrap_or_default() as u8
}

fn read_instruction(reader: &mut ImageReader<'_>) -> Result<Instruction, ImageError> {
    let offset = reader.offset();
    let opcode = reader.byte()?;
    let instruction = match opcode {
        op::NOP => Instruction::Nop,
        op::PUSH_CONST => Instruction::PushConst(read_constant(reader)?),
        op::LOAD_LOCAL => Instruction::LoadLocal(reader.u32()?),
        op::STORE_LOCAL => Instruction::StoreLocal(reader.u32()?),
        op::LOAD_GLOBAL => Instruction::LoadGlobal(reader.u32()?),
        op::STORE_GLOBAL => Instruction::StoreGlobal(reader.u32()?),
        op::POP => Instruction::Pop,
        op::BINARY => {
            let offset = reader.offset();
            let tag = reader.byte()?;
            let binary = BINARY_OPS.get(tag as usize).copied().ok_or(
                ImageError::UnknownDiscriminator {
                    kind: "binary operator",
                    value: tag,
                    offset,
                },
            )?;
            Instruction::Binary(binary)
        }
        op::UNARY => {
            let offset = reader.offset();
            match reader.byte()? {
                0 => Instruction::Unary(UnaryOp::Neg),
                1 => Instruction::Unary(UnaryOp::Not),
                value => {
                    return Err(ImageError::UnknownDiscriminator {
                        kind: "unary operator",
                        value,
                        offset,
                    });
                }
            }
        }
        op::JUMP => Instruction::Jump(reader.count()?),
        op::JUMP_IF_FALSE => Instruction::JumpIfFalse(reader.count()?),
        op::JUMP_IF_FALSE_KEEP => Instruction::JumpIfFalseKeep(reader.count()?),
        op::JUMP_IF_TRUE_KEEP => Instruction::JumpIfTrueKeep(reader.count()?),
        op::CALL => Instruction::CallFunction {
            target: read_function_ref(reader)?,
            argc: reader.u32()?,
        },
        op::CALL_HOST => {
            let name = reader.string()?;
            let argc = reader.u32()?;
            let binding = if reader.flag()? {
                let binding_name = reader.string()?;
                let count = reader.count()?;
                let mut signature = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    signature.push(read_type(reader)?);
                }
                Some(HostFunctionRef::new(binding_name, signature))
            } else {
                None
            };
            Instruction::CallHost {
                name,
                argc,
                binding,
            }
        }
        op::CALL_METHOD => Instruction::CallMethod {
            name: reader.string()?,
            argc: reader.u32()?,
        },
        op::CALL_STATIC => Instruction::CallStatic {
            type_name: reader.string()?,
            name: reader.string()?,
            argc: reader.u32()?,
            bound: reader.flag()?,
        },
        op::INVOKE => Instruction::InvokeClosure {
            argc: reader.u32()?,
        },
        op::MAKE_CLOSURE => Instruction::MakeClosure {
            function: read_function_ref(reader)?,
        },
        op::LOAD_FIELD => Instruction::LoadField(reader.string()?),
        op::STORE_FIELD => Instruction::StoreField(reader.string()?),
        op::LOAD_STATIC => Instruction::LoadStatic {
            type_name: reader.string()?,
            member: reader.string()?,
            bound: reader.flag()?,
        },
        op::LOAD_INDEX => Instruction::LoadIndex,
        op::STORE_INDEX => Instruction::StoreIndex,
        op::MAKE_ARRAY => Instruction::MakeArray(reader.u32()?),
        op::GET_ITERATOR => Instruction::GetIterator,
        op::ITER_NEXT => Instruction::IterMoveNext,
        op::ITER_CURRENT => Instruction::IterCurrent,
        op::YIELD => Instruction::Yield,
        op::RETURN => Instruction::Return {
            params: reader.u32()?,
        },
        op::ALLOC_FRAME => Instruction::AllocFrame(reader.u32()?),
        op::PUSH_DEBUG => {
            let unit = reader.string()?;
            let function = reader.string()?;
            let start = Position::new(reader.u32()?, reader.u32()?);
            let end = Position::new(reader.u32()?, reader.u32()?);
            Instruction::PushDebugContext(DebugContext::new(
                unit,
                function,
                SourceRange::new(start, end),
            ))
        }
        op::POP_DEBUG => Instruction::PopDebugContext,
        op::CHECK_STEP => Instruction::CheckStep,
        value => {
            return Err(ImageError::UnknownDiscriminator {
                kind: "instruction",
                value,
                offset,
            });
        }
    };
    Ok(instruction)
}

fn read_function_ref(reader: &mut ImageReader<'_>) -> Result<FunctionRef, ImageError> {
    let namespace = reader.strings()?;
    let name = reader.string()?;
    Ok(FunctionRef::new(namespace, name))
}

fn read_constant(reader: &mut ImageReader<'_>) -> Result<Constant, ImageError> {
    let offset = reader.offset();
    let constant = match reader.byte()? {
        0 => Constant::Unit,
        1 => Constant::Bool(reader.flag()?),
        2 => Constant::Int(reader.zigzag()?),
        3 => Constant::Float(reader.f64()?),
        4 => Constant::Str(reader.string()?),
        value => {
            return Err(ImageError::UnknownDiscriminator {
                kind: "constant",
                value,
                offset,
            });
        }
    };
    Ok(constant)
}

fn read_type(reader: &mut ImageReader<'_>) -> Result<TypeRef, ImageError> {
    let offset = reader.offset();
    let ty = match reader.byte()? {
        0 => TypeRef::Any,
        1 => TypeRef::Named(reader.string()?),
        2 => TypeRef::Nullable(Box::new(read_type(reader)?)),
        3 => TypeRef::Generic(reader.string()?),
        4 => {
            let base = reader.string()?;
            let count = reader.count()?;
            let mut args = Vec::with_capacity(count.min(reader.remaining()));
            for _ in 0..count {
                args.push(read_type(reader)?);
            }
            TypeRef::Instance { base, args }
        }
        value => {
            return Err(ImageError::UnknownDiscriminator {
                kind: "type",
                value,
                offset,
            });
        }
    };
    Ok(ty)
}


//=====================================================
// End of file
//=====================================================
