//=====================================================
// File: vm/instruction.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineIL instruction set
// Objective: Closed set of operand-carrying instructions executed by the engine,
//            plus the function/host references and debug contexts they embed
//=====================================================

use std::fmt;

use once_cell::unsync::OnceCell;

use crate::ast::{BinaryOp, SourceRange, UnaryOp};
use crate::host::TypeRef;
use crate::vm::program::FunctionEntry;
use crate::vm::value::Value;

/// Constant operand of `PUSH_CONST`.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Unit => Value::Unit,
            Constant::Bool(value) => Value::Bool(*value),
            Constant::Int(value) => Value::Int(*value),
            Constant::Float(value) => Value::Float(*value),
            Constant::Str(value) => Value::Str(value.clone()),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Unit => f.write_str("unit"),
            Constant::Bool(value) => write!(f, "{value}"),
            Constant::Int(value) => write!(f, "{value}"),
            Constant::Float(value) => write!(f, "{value:?}"),
            Constant::Str(value) => write!(f, "{value:?}"),
        }
    }
}

/// Reference to an in-language function. The namespace table entry is resolved on first
/// execution and cached afterwards.
#[derive(Debug, Clone)]
pub struct FunctionRef {
    pub namespace: Vec<String>,
    pub name: String,
    resolved: OnceCell<FunctionEntry>,
}

impl FunctionRef {
    pub fn new(namespace: Vec<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
            resolved: OnceCell::new(),
        }
    }

    pub fn resolved(&self) -> Option<FunctionEntry> {
        self.resolved.get().copied()
    }

    pub fn cache(&self, entry: FunctionEntry) {
        // A second resolution always yields the same entry.
        let _ = self.resolved.set(entry);
    }

    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace.join("."), self.name)
        }
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// Host function bound by fully-qualified name plus parameter signature.
#[derive(Debug, Clone, PartialEq)]
pub struct HostFunctionRef {
    pub name: String,
    pub signature: Vec<TypeRef>,
}

impl HostFunctionRef {
    pub fn new(name: impl Into<String>, signature: Vec<TypeRef>) -> Self {
        Self {
            name: name.into(),
            signature,
        }
    }
}

impl fmt::Display for HostFunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (index, ty) in self.signature.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ty}")?;
        }
        f.write_str(")")
    }
}

/// Entry of the debug context stack used for fault attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugContext {
    pub unit: String,
    pub function: String,
    pub range: SourceRange,
}

impl DebugContext {
    pub fn new(unit: impl Into<String>, function: impl Into<String>, range: SourceRange) -> Self {
        Self {
            unit: unit.into(),
            function: function.into(),
            range,
        }
    }
}

impl fmt::Display for DebugContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} ({})", self.unit, self.function, self.range)
    }
}

/// MarineIL. Slot operands of the `*_LOCAL` family are frame-relative, `*_GLOBAL` slots
/// are absolute. Jump operands are absolute instruction indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,
    PushConst(Constant),
    LoadLocal(u32),
    StoreLocal(u32),
    LoadGlobal(u32),
    StoreGlobal(u32),
    Pop,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Jump(usize),
    JumpIfFalse(usize),
    /// Jumps keeping the tested value when it is false, otherwise pops it.
    JumpIfFalseKeep(usize),
    /// Jumps keeping the tested value when it is true, otherwise pops it.
    JumpIfTrueKeep(usize),
    CallFunction {
        target: FunctionRef,
        argc: u32,
    },
    CallHost {
        name: String,
        argc: u32,
        binding: Option<HostFunctionRef>,
    },
    /// Receiver sits below the arguments.
    CallMethod {
        name: String,
        argc: u32,
    },
    CallStatic {
        type_name: String,
        name: String,
        argc: u32,
        bound: bool,
    },
    /// Closure sits below the arguments.
    InvokeClosure {
        argc: u32,
    },
    /// Pops the capture array and pushes a closure over `function`.
    MakeClosure {
        function: FunctionRef,
    },
    LoadField(String),
    StoreField(String),
    LoadStatic {
        type_name: String,
        member: String,
        bound: bool,
    },
    LoadIndex,
    StoreIndex,
    MakeArray(u32),
    GetIterator,
    IterMoveNext,
    IterCurrent,
    Yield,
    Return {
        params: u32,
    },
    AllocFrame(u32),
    /// Faults when the numeric loop step on top of the stack is zero. Leaves it in place.
    CheckStep,
    PushDebugContext(DebugContext),
    PopDebugContext,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Nop => "NOP",
            Instruction::PushConst(_) => "PUSH_CONST",
            Instruction::LoadLocal(_) => "LOAD_LOCAL",
            Instruction::StoreLocal(_) => "STORE_LOCAL",
            Instruction::LoadGlobal(_) => "LOAD_GLOBAL",
            Instruction::StoreGlobal(_) => "STORE_GLOBAL",
            Instruction::Pop => "POP",
            Instruction::Binary(_) => "BINARY",
            Instruction::Unary(_) => "UNARY",
            Instruction::Jump(_) => "JUMP",
            Instruction::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Instruction::JumpIfFalseKeep(_) => "JUMP_IF_FALSE_KEEP",
            Instruction::JumpIfTrueKeep(_) => "JUMP_IF_TRUE_KEEP",
            Instruction::CallFunction { .. } => "CALL",
            Instruction::CallHost { .. } => "CALL_HOST",
            Instruction::CallMethod { .. } => "CALL_METHOD",
            Instruction::CallStatic { .. } => "CALL_STATIC",
            Instruction::InvokeClosure { .. } => "INVOKE",
            Instruction::MakeClosure { .. } => "MAKE_CLOSURE",
            Instruction::LoadField(_) => "LOAD_FIELD",
            Instruction::StoreField(_) => "STORE_FIELD",
            Instruction::LoadStatic { .. } => "LOAD_STATIC",
            Instruction::LoadIndex => "LOAD_INDEX",
            Instruction::StoreIndex => "STORE_INDEX",
            Instruction::MakeArray(_) => "MAKE_ARRAY",
            Instruction::GetIterator => "GET_ITER",
            Instruction::IterMoveNext => "ITER_NEXT",
            Instruction::IterCurrent => "ITER_CURRENT",
            Instruction::Yield => "YIELD",
            Instruction::Return { .. } => "RETURN",
            Instruction::AllocFrame(_) => "ALLOC_FRAME",
            Instruction::CheckStep => "CHECK_STEP",
            Instruction::PushDebugContext(_) => "PUSH_DEBUG",
            Instruction::PopDebugContext => "POP_DEBUG",
        }
    }

    pub fn jump_target(&self) -> Option<usize> {
        match self {
            Instruction::Jump(target)
            | Instruction::JumpIfFalse(target)
            | Instruction::JumpIfFalseKeep(target)
            | Instruction::JumpIfTrueKeep(target) => Some(*target),
            _ => None,
        }
    }

    /// Overwrites the target of a jump placeholder. Non-jumps are left untouched.
    pub fn set_jump_target(&mut self, value: usize) {
        match self {
            Instruction::Jump(target)
            | Instruction::JumpIfFalse(target)
            | Instruction::JumpIfFalseKeep(target)
            | Instruction::JumpIfTrueKeep(target) => *target = value,
            _ => {}
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Instruction::PushConst(constant) => write!(f, "{name} {constant}"),
            Instruction::LoadLocal(slot)
            | Instruction::StoreLocal(slot)
            | Instruction::LoadGlobal(slot)
            | Instruction::StoreGlobal(slot)
            | Instruction::AllocFrame(slot)
            | Instruction::MakeArray(slot) => write!(f, "{name} {slot}"),
            Instruction::Binary(op) => write!(f, "{name} {op}"),
            Instruction::Unary(op) => write!(f, "{name} {op}"),
            Instruction::Jump(target)
            | Instruction::JumpIfFalse(target)
            | Instruction::JumpIfFalseKeep(target)
            | Instruction::JumpIfTrueKeep(target) => write!(f, "{name} -> {target:04}"),
            Instruction::CallFunction { target, argc } => write!(f, "{name} {target}/{argc}"),
            Instruction::CallHost {
                name: host,
                argc,
                binding,
            } => match binding {
                Some(binding) => write!(f, "{name} {binding}"),
                None => write!(f, "{name} {host}/{argc}"),
            },
            Instruction::CallMethod { name: method, argc } => {
                write!(f, "{name} .{method}/{argc}")
            }
            Instruction::CallStatic {
                type_name,
                name: member,
                argc,
                ..
            } => write!(f, "{name} {type_name}.{member}/{argc}"),
            Instruction::InvokeClosure { argc } => write!(f, "{name} {argc}"),
            Instruction::MakeClosure { function } => write!(f, "{name} {function}"),
            Instruction::LoadField(field) | Instruction::StoreField(field) => {
                write!(f, "{name} .{field}")
            }
            Instruction::LoadStatic {
                type_name, member, ..
            } => write!(f, "{name} {type_name}.{member}"),
            Instruction::Return { params } => write!(f, "{name} params={params}"),
            Instruction::PushDebugContext(context) => write!(f, "{name} {context}"),
            _ => f.write_str(name),
        }
    }
}


//=====================================================
// End of file
//=====================================================
