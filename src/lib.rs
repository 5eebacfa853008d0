//=====================================================
// File: lib.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript library main interface
// Objective: Export the AST contract, bytecode compiler, MarineIL virtual machine,
//            host registry, overload resolver, and binary image codec
//=====================================================

pub mod api;
pub mod ast;
pub mod compiler;
pub mod config;
pub mod error;
pub mod host;
pub mod image;
pub mod vm;

pub use api::{Marine, RunOutcome, Sequence, UnitId};
pub use config::RuntimeOptions;
pub use error::{CompileError, ImageError, MarineError, MarineFault, RuntimeFault};
pub use host::{HostFunction, HostObject, HostRegistry, HostType, TypeRef};
pub use vm::value::Value;
pub use vm::{TelemetryCollector, TelemetryEvent, TelemetryEventKind, TelemetryHook, TelemetryRecord};

//=====================================================
// End of file
//=====================================================
