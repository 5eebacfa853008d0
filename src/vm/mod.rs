//=====================================================
// File: vm/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineIL virtual machine module root
// Objective: Wire together the instruction set, compiled program tables, value model,
//            fixed-capacity stack, execution engine, and telemetry
//=====================================================

pub mod instruction;
pub mod metrics;
pub mod program;
pub mod runtime;
pub mod stack;
pub mod value;

pub use instruction::{Constant, DebugContext, FunctionRef, HostFunctionRef, Instruction};
pub use metrics::{
    TelemetryCollector, TelemetryEvent, TelemetryEventKind, TelemetryHook, TelemetryRecord,
};
pub use program::{CompiledProgram, FunctionEntry, NamespaceNode, NamespaceTable};
pub use runtime::{Engine, EngineState, StepOutcome};
pub use value::Value;

//=====================================================
// End of file
//=====================================================
