//=====================================================
// File: api/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript host embedding API
// Objective: One embedding context owning the host registry, loaded units and compiled
//            program; runs functions as plain values or resumable sequences
//=====================================================

use std::rc::Rc;

use crate::ast::ProgramUnit;
use crate::compiler::{bind_host_references, compile_units};
use crate::config::RuntimeOptions;
use crate::error::{MarineError, MarineFault};
use crate::host::{HostFunction, HostRegistry, HostType};
use crate::image::{self, DecodeOptions, EncodeOptions};
use crate::vm::program::CompiledProgram;
use crate::vm::runtime::{Engine, EngineState, StepOutcome};
use crate::vm::value::Value;

/// Opaque handle for a loaded program unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Embedding context. Registrations are scoped to this value; dropping it tears down
/// the registry together with any program compiled against it.
#[derive(Debug, Default)]
pub struct Marine {
    registry: Rc<HostRegistry>,
    units: Vec<ProgramUnit>,
    program: Option<Rc<CompiledProgram>>,
    options: RuntimeOptions,
}

impl Marine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: RuntimeOptions) {
        self.options = options;
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn register_function(&self, function: HostFunction) {
        self.registry.register_function(function);
    }

    pub fn register_type(&self, ty: HostType) {
        self.registry.register_type(ty);
    }

    pub fn register_global(&self, name: impl Into<String>, value: Value) {
        self.registry.register_global(name, value);
    }

    /// Updates an already registered global. Returns false when `name` is unknown.
    pub fn set_global(&self, name: &str, value: Value) -> bool {
        self.registry.set_global(name, value)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.registry.global(name)
    }

    /// Adds a unit to the next compilation. Any previously compiled program is dropped.
    pub fn load_unit(&mut self, unit: ProgramUnit) -> UnitId {
        tracing::debug!(unit = %unit.name, "loaded program unit");
        self.units.push(unit);
        self.program = None;
        UnitId(self.units.len() - 1)
    }

    pub fn unit(&self, id: UnitId) -> Option<&ProgramUnit> {
        self.units.get(id.0)
    }

    /// Compiles every loaded unit together against the currently registered globals,
    /// then binds host calls that have a single candidate. A bound call goes back to
    /// overload resolution once more overloads of its name are registered, so late
    /// registrations need no recompile.
    pub fn compile(&mut self) -> Result<(), MarineError> {
        let globals = self.registry.global_names();
        let mut program = compile_units(&self.units, &globals)?;
        bind_host_references(&mut program, &self.registry);
        self.program = Some(Rc::new(program));
        Ok(())
    }

    pub fn program(&self) -> Option<&CompiledProgram> {
        self.program.as_deref()
    }

    pub fn run(&self, name: &str, args: Vec<Value>) -> Result<RunOutcome, MarineError> {
        self.run_in(Vec::<String>::new(), name, args)
    }

    pub fn run_in<I, S>(&self, namespace: I, name: &str, args: Vec<Value>) -> Result<RunOutcome, MarineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self.program.clone().ok_or(MarineError::NotCompiled)?;
        let namespace: Vec<String> = namespace.into_iter().map(Into::into).collect();
        let mut engine = Engine::new(program, Rc::clone(&self.registry), self.options.clone());
        let outcome = match engine.start(&namespace, name, args)? {
            StepOutcome::Completed(value) => RunOutcome::Value(value),
            StepOutcome::Yielded(value) => RunOutcome::Sequence(Sequence {
                engine,
                pending: Some(value),
                finished: false,
            }),
        };
        Ok(outcome)
    }

    pub fn encode_image(&self, options: EncodeOptions) -> Result<Vec<u8>, MarineError> {
        let program = self.program.as_deref().ok_or(MarineError::NotCompiled)?;
        Ok(image::encode(program, options))
    }

    /// Replaces the compiled program with a decoded image bound to this registry.
    pub fn load_image(&mut self, bytes: &[u8], options: DecodeOptions) -> Result<(), MarineError> {
        let program = image::decode(bytes, &self.registry, options)?;
        self.program = Some(Rc::new(program));
        Ok(())
    }
}

/// Result of running a function.
#[derive(Debug)]
pub enum RunOutcome {
    /// The function returned without yielding.
    Value(Value),
    /// The function yielded at least once.
    Sequence(Sequence),
}

impl RunOutcome {
    /// The function's return value, driving a sequence to completion if needed.
    pub fn into_value(self) -> Result<Value, MarineFault> {
        match self {
            RunOutcome::Value(value) => Ok(value),
            RunOutcome::Sequence(sequence) => sequence.into_last(),
        }
    }

    /// Every value observed by the host: yields in order, then the return value.
    pub fn into_values(self) -> Result<Vec<Value>, MarineFault> {
        match self {
            RunOutcome::Value(value) => Ok(vec![value]),
            RunOutcome::Sequence(sequence) => sequence.collect_values(),
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, RunOutcome::Sequence(_))
    }
}

/// Lazy, resumable view over a suspended engine. Yields each suspended value in order;
/// the final element is the function's return value.
#[derive(Debug)]
pub struct Sequence {
    engine: Engine,
    pending: Option<Value>,
    finished: bool,
}

impl Sequence {
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn collect_values(self) -> Result<Vec<Value>, MarineFault> {
        self.collect()
    }

    pub fn into_last(self) -> Result<Value, MarineFault> {
        let mut last = Value::Unit;
        for value in self {
            last = value?;
        }
        Ok(last)
    }
}

impl Iterator for Sequence {
    type Item = Result<Value, MarineFault>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(value) = self.pending.take() {
            return Some(Ok(value));
        }
        if self.finished {
            return None;
        }
        match self.engine.resume() {
            Ok(StepOutcome::Yielded(value)) => Some(Ok(value)),
            Ok(StepOutcome::Completed(value)) => {
                self.finished = true;
                Some(Ok(value))
            }
            Err(fault) => {
                self.finished = true;
                Some(Err(fault))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FunctionDef, Stmt};
    use crate::error::RuntimeFault;

    fn unit(functions: Vec<FunctionDef>) -> ProgramUnit {
        ProgramUnit::new("api.mrn", functions)
    }

    #[test]
    fn running_before_compile_is_an_error() {
        let mut marine = Marine::new();
        marine.load_unit(unit(vec![FunctionDef::new("main", Vec::<String>::new(), vec![])]));
        assert!(matches!(
            marine.run("main", vec![]),
            Err(MarineError::NotCompiled)
        ));
    }

    #[test]
    fn loading_a_unit_invalidates_the_program() {
        let mut marine = Marine::new();
        let first = marine.load_unit(unit(vec![FunctionDef::new("main", Vec::<String>::new(), vec![])]));
        marine.compile().expect("compile");
        assert!(marine.program().is_some());
        let second = marine.load_unit(ProgramUnit::new("other.mrn", vec![]));
        assert_ne!(first, second);
        assert!(marine.program().is_none());
        assert_eq!(marine.unit(second).map(|u| u.name.as_str()), Some("other.mrn"));
    }

    #[test]
    fn plain_functions_return_values() {
        let mut marine = Marine::new();
        marine.load_unit(unit(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::string("ok"))],
        )]));
        marine.compile().expect("compile");
        let outcome = marine.run("main", vec![]).expect("run");
        assert!(!outcome.is_sequence());
        assert_eq!(outcome.into_value().expect("value"), Value::string("ok"));
    }

    #[test]
    fn sequence_stops_after_a_fault() {
        let mut marine = Marine::new();
        marine.load_unit(unit(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![
                Stmt::yield_(Expr::int(1)),
                Stmt::ret(Expr::call("missing", vec![])),
            ],
        )]));
        marine.compile().expect("compile");
        let RunOutcome::Sequence(mut sequence) = marine.run("main", vec![]).expect("run") else {
            panic!("expected a sequence");
        };
        assert_eq!(sequence.next().map(|v| v.ok()), Some(Some(Value::Int(1))));
        let fault = sequence.next().expect("fault item").expect_err("fault");
        assert!(matches!(fault.fault, RuntimeFault::HostFunctionNotFound { .. }));
        assert!(sequence.next().is_none());
        assert_eq!(sequence.state(), EngineState::Faulted);
    }
}

//=====================================================
// End of file
//=====================================================
