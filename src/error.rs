//=====================================================
// File: error.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript error taxonomy
// Objective: Compile faults, runtime faults, image codec errors, configuration errors,
//            and the single host-facing fault shape carrying the debug context stack
//=====================================================

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::vm::instruction::DebugContext;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("undefined variable '{name}' in function '{function}'")]
    UndefinedVariable { name: String, function: String },
    #[error("'break' outside of a loop in function '{function}'")]
    BreakOutsideLoop { function: String },
    #[error("duplicate function '{name}'")]
    DuplicateFunction { name: String },
    #[error("function '{function}' declares {count} parameters (limit {limit})")]
    TooManyParameters {
        function: String,
        count: usize,
        limit: usize,
    },
    #[error("no program units loaded")]
    NoUnits,
}

/// Faults raised while the engine is interpreting MarineIL.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeFault {
    #[error("host function '{name}' not found")]
    HostFunctionNotFound { name: String },
    #[error("member '{member}' not found on '{owner}'")]
    MemberNotFound { owner: String, member: String },
    #[error("member '{member}' of '{owner}' is private")]
    PrivateMemberAccess { owner: String, member: String },
    #[error("type '{type_name}' has no indexer")]
    IndexerNotFound { type_name: String },
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("operator '{operator}' is not defined for ({})", .operands.join(", "))]
    OperatorNotFound {
        operator: String,
        operands: Vec<String>,
    },
    #[error("ambiguous call to '{name}': {}", .candidates.join(" | "))]
    AmbiguousOverload {
        name: String,
        candidates: Vec<String>,
    },
    #[error("no overload of '{name}' accepts ({})", .arguments.join(", "))]
    NoMatchingOverload {
        name: String,
        arguments: Vec<String>,
    },
    #[error("function '{name}' not found")]
    FunctionNotFound { name: String },
    #[error("function '{function}' expects {expected} arguments but received {found}")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("value of type '{type_name}' is not callable")]
    NotCallable { type_name: String },
    #[error("value of type '{type_name}' is not iterable")]
    NotIterable { type_name: String },
    #[error("expected {expected} but found {found}")]
    TypeMismatch { expected: String, found: String },
    #[error("type '{name}' is not registered")]
    UnresolvedType { name: String },
    #[error("division by zero")]
    DivisionByZero,
    #[error("'for' step is zero")]
    ZeroForStep,
    #[error("stack capacity of {capacity} slots exceeded")]
    StackOverflow { capacity: usize },
    #[error("engine is {state} and cannot be resumed")]
    NotResumable { state: String },
    #[error("global '{name}' is not registered")]
    GlobalNotFound { name: String },
    #[error("{message}")]
    Unknown { message: String },
}

impl RuntimeFault {
    pub fn unknown(message: impl Into<String>) -> Self {
        RuntimeFault::Unknown {
            message: message.into(),
        }
    }

    /// Converts an error returned by a host callable. Faults raised deliberately by the
    /// host keep their kind, everything else becomes `Unknown`.
    pub fn from_host(error: anyhow::Error) -> Self {
        match error.downcast::<RuntimeFault>() {
            Ok(fault) => fault,
            Err(other) => RuntimeFault::Unknown {
                message: format!("{other:#}"),
            },
        }
    }
}

/// The single runtime exception shape handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct MarineFault {
    pub fault: RuntimeFault,
    /// Rendered form of the failing instruction.
    pub instruction: Option<String>,
    pub ip: usize,
    pub debug_stack: Vec<DebugContext>,
}

impl MarineFault {
    pub fn new(fault: RuntimeFault) -> Self {
        Self {
            fault,
            instruction: None,
            ip: 0,
            debug_stack: Vec::new(),
        }
    }

    pub fn kind(&self) -> &RuntimeFault {
        &self.fault
    }

    /// Innermost function active when the fault was raised.
    pub fn innermost(&self) -> Option<&DebugContext> {
        self.debug_stack.last()
    }
}

impl fmt::Display for MarineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}", self.fault)?;
        if let Some(instruction) = &self.instruction {
            write!(f, "\n    instruction {:04}: {}", self.ip, instruction)?;
        }
        for frame in self.debug_stack.iter().rev() {
            write!(f, "\n    at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MarineFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.fault)
    }
}

impl From<RuntimeFault> for MarineFault {
    fn from(fault: RuntimeFault) -> Self {
        MarineFault::new(fault)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("invalid image header")]
    InvalidHeader,
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u64),
    #[error("unexpected end of image at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("invalid utf-8 sequence at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid varint at byte {offset}")]
    InvalidVarint { offset: usize },
    #[error("unknown {kind} discriminator {value} at byte {offset}")]
    UnknownDiscriminator {
        kind: &'static str,
        value: u8,
        offset: usize,
    },
    #[error("malformed namespace table: {0}")]
    MalformedNamespaceTable(String),
    #[error("instruction {index} jumps to {target} outside the program")]
    InvalidJumpTarget { index: usize, target: usize },
    #[error("type '{name}' does not resolve against the host registry")]
    UnresolvedType { name: String },
    #[error("host function '{signature}' does not resolve against the host registry")]
    UnresolvedFunction { signature: String },
    #[error("{count} trailing bytes after image")]
    TrailingBytes { count: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("stack capacity must be greater than zero")]
    ZeroStackCapacity,
}

/// Host-facing error returned by the embedding API.
#[derive(Debug, Error)]
pub enum MarineError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Fault(#[from] MarineFault),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("program has not been compiled")]
    NotCompiled,
}

impl MarineError {
    pub fn as_fault(&self) -> Option<&MarineFault> {
        match self {
            MarineError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}


//=====================================================
// End of file
//=====================================================
