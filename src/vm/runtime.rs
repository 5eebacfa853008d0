//=====================================================
// File: vm/runtime.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript execution engine
// Objective: Stack machine over MarineIL with frame-relative addressing, the call/return
//            protocol, whole-engine suspend/resume on yield and fault capture
//=====================================================

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::ast::{BinaryOp, UnaryOp};
use crate::config::RuntimeOptions;
use crate::error::{MarineFault, RuntimeFault};
use crate::host::{overload, HostFunction, HostRegistry};
use crate::vm::instruction::{DebugContext, FunctionRef, Instruction};
use crate::vm::metrics::{TelemetryEvent, TelemetryEventKind};
use crate::vm::program::CompiledProgram;
use crate::vm::stack::ValueStack;
use crate::vm::value::{Closure, Value};

/// Lifecycle of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Ready,
    Running,
    Suspended,
    Completed,
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Ready => "ready",
            EngineState::Running => "running",
            EngineState::Suspended => "suspended",
            EngineState::Completed => "completed",
            EngineState::Faulted => "faulted",
        };
        f.write_str(label)
    }
}

/// What the host sees each time control comes back from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Yielded(Value),
    Completed(Value),
}

enum Control {
    Continue,
    Yield(Value),
    Complete(Value),
}

/// One invocation of a compiled program. The whole coroutine state (value stack,
/// instruction pointer, frame base, call depth) lives here, so a suspended engine can be
/// stored by the host and resumed later.
pub struct Engine {
    program: Rc<CompiledProgram>,
    registry: Rc<HostRegistry>,
    options: RuntimeOptions,
    stack: ValueStack,
    ip: usize,
    base: usize,
    depth: usize,
    debug_stack: Vec<DebugContext>,
    state: EngineState,
    entry: String,
    yielded: usize,
}

impl Engine {
    pub fn new(
        program: Rc<CompiledProgram>,
        registry: Rc<HostRegistry>,
        options: RuntimeOptions,
    ) -> Self {
        let stack = ValueStack::new(options.stack_capacity);
        Self {
            program,
            registry,
            options,
            stack,
            ip: 0,
            base: 0,
            depth: 0,
            debug_stack: Vec::new(),
            state: EngineState::Ready,
            entry: String::new(),
            yielded: 0,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Runs `namespace.name(args)` until it yields or returns.
    pub fn start(
        &mut self,
        namespace: &[String],
        name: &str,
        args: Vec<Value>,
    ) -> Result<StepOutcome, MarineFault> {
        if self.state != EngineState::Ready {
            return Err(MarineFault::new(RuntimeFault::NotResumable {
                state: self.state.to_string(),
            }));
        }
        self.entry = FunctionRef::new(namespace.to_vec(), name).qualified_name();

        if let Err(fault) = self.enter(namespace, name, args) {
            self.state = EngineState::Faulted;
            self.emit_event(TelemetryEventKind::Faulted, Some(fault.to_string()));
            return Err(MarineFault::new(fault));
        }

        self.state = EngineState::Running;
        tracing::debug!(function = %self.entry, "engine started");
        self.emit_event(TelemetryEventKind::Started, None);
        self.execute()
    }

    /// Continues a suspended engine from the instruction after its last yield.
    pub fn resume(&mut self) -> Result<StepOutcome, MarineFault> {
        if self.state != EngineState::Suspended {
            return Err(MarineFault::new(RuntimeFault::NotResumable {
                state: self.state.to_string(),
            }));
        }
        self.state = EngineState::Running;
        self.emit_event(TelemetryEventKind::Resumed, None);
        self.execute()
    }

    fn enter(&mut self, namespace: &[String], name: &str, args: Vec<Value>) -> Result<(), RuntimeFault> {
        let entry = self
            .program
            .lookup(namespace, name)
            .ok_or_else(|| RuntimeFault::FunctionNotFound {
                name: self.entry.clone(),
            })?;
        if entry.arity as usize != args.len() {
            return Err(RuntimeFault::ArgumentCount {
                function: self.entry.clone(),
                expected: entry.arity as usize,
                found: args.len(),
            });
        }

        // Globals occupy absolute slots in declaration order.
        let program = Rc::clone(&self.program);
        for global in &program.globals {
            let value = self
                .registry
                .global(global)
                .ok_or_else(|| RuntimeFault::GlobalNotFound {
                    name: global.clone(),
                })?;
            self.stack.push(value)?;
        }

        self.base = self.stack.len();
        for arg in args {
            self.stack.push(arg)?;
        }
        self.stack.push(Value::Int(0))?;
        self.stack.push(Value::Int(0))?;
        self.depth = 1;
        self.ip = entry.offset;
        Ok(())
    }

    fn execute(&mut self) -> Result<StepOutcome, MarineFault> {
        let program = Rc::clone(&self.program);
        loop {
            let ip = self.ip;
            let Some(instruction) = program.instructions.get(ip) else {
                let fault =
                    RuntimeFault::unknown(format!("instruction pointer {ip} out of range"));
                return Err(self.raise(fault, None, ip));
            };
            if self.options.trace {
                self.emit_trace(ip, instruction);
            }
            self.ip = ip + 1;

            match self.step(instruction) {
                Ok(Control::Continue) => {}
                Ok(Control::Yield(value)) => {
                    self.state = EngineState::Suspended;
                    self.yielded += 1;
                    self.emit_event(TelemetryEventKind::Suspended, None);
                    return Ok(StepOutcome::Yielded(value));
                }
                Ok(Control::Complete(value)) => {
                    self.state = EngineState::Completed;
                    tracing::debug!(function = %self.entry, yielded = self.yielded, "engine completed");
                    self.emit_event(TelemetryEventKind::Completed, None);
                    return Ok(StepOutcome::Completed(value));
                }
                Err(fault) => return Err(self.raise(fault, Some(instruction), ip)),
            }
        }
    }

    fn step(&mut self, instruction: &Instruction) -> Result<Control, RuntimeFault> {
        match instruction {
            Instruction::Nop => {}
            Instruction::PushConst(constant) => self.stack.push(constant.to_value())?,
            Instruction::LoadLocal(slot) => {
                let value = self.stack.get(self.base + *slot as usize)?.clone();
                self.stack.push(value)?;
            }
            Instruction::StoreLocal(slot) => {
                let value = self.stack.pop()?;
                self.stack.set(self.base + *slot as usize, value)?;
            }
            Instruction::LoadGlobal(slot) => {
                let value = self.stack.get(*slot as usize)?.clone();
                self.stack.push(value)?;
            }
            Instruction::StoreGlobal(slot) => {
                let value = self.stack.pop()?;
                if let Some(name) = self.program.globals.get(*slot as usize) {
                    self.registry.set_global(name, value.clone());
                }
                self.stack.set(*slot as usize, value)?;
            }
            Instruction::Pop => {
                self.stack.pop()?;
            }
            Instruction::Binary(op) => {
                let rhs = self.stack.pop()?;
                let lhs = self.stack.pop()?;
                let value = self.binary(*op, lhs, rhs)?;
                self.stack.push(value)?;
            }
            Instruction::Unary(op) => {
                let operand = self.stack.pop()?;
                let value = unary(*op, &operand)?;
                self.stack.push(value)?;
            }
            Instruction::Jump(target) => self.ip = *target,
            Instruction::JumpIfFalse(target) => {
                if !self.stack.pop()?.is_truthy() {
                    self.ip = *target;
                }
            }
            Instruction::JumpIfFalseKeep(target) => {
                if self.stack.peek()?.is_truthy() {
                    self.stack.pop()?;
                } else {
                    self.ip = *target;
                }
            }
            Instruction::JumpIfTrueKeep(target) => {
                if self.stack.peek()?.is_truthy() {
                    self.ip = *target;
                } else {
                    self.stack.pop()?;
                }
            }
            Instruction::CallFunction { target, argc } => {
                let offset = self.resolve_function(target, *argc as usize)?;
                self.enter_call(offset, *argc as usize)?;
            }
            Instruction::CallHost {
                name,
                argc,
                binding,
            } => {
                let args = self.stack.pop_many(*argc as usize)?;
                // Overloads registered after binding reopen resolution.
                let bound = binding.as_ref().and_then(|reference| {
                    self.registry
                        .sole_function(&reference.name, &reference.signature)
                });
                let resolved = match bound {
                    Some(function) => overload::resolve(name, &[function], args, self.registry.as_ref())?,
                    None => self.registry.resolve_function(name, args)?,
                };
                let value = self.registry.invoke(resolved)?;
                self.stack.push(value)?;
            }
            Instruction::CallMethod { name, argc } => {
                let args = self.stack.pop_many(*argc as usize)?;
                let receiver = self.stack.pop()?;
                self.call_method(receiver, name, args)?;
            }
            Instruction::CallStatic {
                type_name,
                name,
                argc,
                ..
            } => {
                let args = self.stack.pop_many(*argc as usize)?;
                let ty = self
                    .registry
                    .type_named(type_name)
                    .ok_or_else(|| RuntimeFault::UnresolvedType {
                        name: type_name.clone(),
                    })?;
                if ty.is_private(name) {
                    return Err(RuntimeFault::PrivateMemberAccess {
                        owner: type_name.clone(),
                        member: name.clone(),
                    });
                }
                let candidates = ty.static_functions(name);
                if candidates.is_empty() {
                    return Err(RuntimeFault::MemberNotFound {
                        owner: type_name.clone(),
                        member: name.clone(),
                    });
                }
                let qualified = format!("{type_name}.{name}");
                let resolved = overload::resolve(&qualified, candidates, args, self.registry.as_ref())?;
                let value = self.registry.invoke(resolved)?;
                self.stack.push(value)?;
            }
            Instruction::InvokeClosure { argc } => {
                let argc = *argc as usize;
                let callee_slot = self
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(|| RuntimeFault::unknown("value stack underflow"))?;
                let closure = match self.stack.get(callee_slot)? {
                    Value::Closure(closure) => Rc::clone(closure),
                    other => {
                        return Err(RuntimeFault::NotCallable {
                            type_name: other.type_name(),
                        });
                    }
                };
                // The callee slot becomes the hidden carrier argument.
                self.stack
                    .set(callee_slot, Value::Array(Rc::clone(&closure.captures)))?;
                let offset = self.resolve_function(&closure.function, argc + 1)?;
                self.enter_call(offset, argc + 1)?;
            }
            Instruction::MakeClosure { function } => {
                let captures = match self.stack.pop()? {
                    Value::Array(items) => items,
                    other => {
                        return Err(RuntimeFault::TypeMismatch {
                            expected: "array".into(),
                            found: other.type_name(),
                        });
                    }
                };
                self.stack.push(Value::Closure(Rc::new(Closure {
                    function: function.clone(),
                    captures,
                })))?;
            }
            Instruction::LoadField(name) => {
                let target = self.stack.pop()?;
                let value = self.load_field(&target, name)?;
                self.stack.push(value)?;
            }
            Instruction::StoreField(name) => {
                let value = self.stack.pop()?;
                let target = self.stack.pop()?;
                self.store_field(&target, name, value)?;
            }
            Instruction::LoadStatic {
                type_name, member, ..
            } => {
                let ty = self
                    .registry
                    .type_named(type_name)
                    .ok_or_else(|| RuntimeFault::UnresolvedType {
                        name: type_name.clone(),
                    })?;
                if ty.is_private(member) {
                    return Err(RuntimeFault::PrivateMemberAccess {
                        owner: type_name.clone(),
                        member: member.clone(),
                    });
                }
                let value = ty
                    .static_field(member)
                    .ok_or_else(|| RuntimeFault::MemberNotFound {
                        owner: type_name.clone(),
                        member: member.clone(),
                    })?;
                self.stack.push(value)?;
            }
            Instruction::LoadIndex => {
                let index = self.stack.pop()?;
                let target = self.stack.pop()?;
                let value = self.load_index(target, index)?;
                self.stack.push(value)?;
            }
            Instruction::StoreIndex => {
                let value = self.stack.pop()?;
                let index = self.stack.pop()?;
                let target = self.stack.pop()?;
                self.store_index(target, index, value)?;
            }
            Instruction::MakeArray(count) => {
                let items = self.stack.pop_many(*count as usize)?;
                self.stack.push(Value::array(items))?;
            }
            Instruction::GetIterator => {
                let value = self.stack.pop()?;
                self.stack.push(value.to_iterator()?)?;
            }
            Instruction::IterMoveNext => {
                let Value::Iterator(cell) = self.stack.pop()? else {
                    return Err(RuntimeFault::unknown("ITER_NEXT on a non-iterator"));
                };
                let advanced = cell
                    .borrow_mut()
                    .move_next()
                    .map_err(RuntimeFault::from_host)?;
                self.stack.push(Value::Bool(advanced))?;
            }
            Instruction::IterCurrent => {
                let Value::Iterator(cell) = self.stack.pop()? else {
                    return Err(RuntimeFault::unknown("ITER_CURRENT on a non-iterator"));
                };
                let current = cell.borrow().current();
                self.stack.push(current)?;
            }
            Instruction::Yield => {
                let value = self.stack.pop()?;
                return Ok(Control::Yield(value));
            }
            Instruction::Return { params } => return self.return_from(*params as usize),
            Instruction::AllocFrame(locals) => {
                for _ in 0..*locals {
                    self.stack.push(Value::Unit)?;
                }
            }
            Instruction::CheckStep => match self.stack.peek()? {
                Value::Int(0) => return Err(RuntimeFault::ZeroForStep),
                Value::Float(step) if *step == 0.0 => return Err(RuntimeFault::ZeroForStep),
                _ => {}
            },
            Instruction::PushDebugContext(context) => self.debug_stack.push(context.clone()),
            Instruction::PopDebugContext => {
                self.debug_stack.pop();
            }
        }
        Ok(Control::Continue)
    }

    /// Call protocol: the arguments are already on the stack; push the caller's frame
    /// base and resume pointer, then jump.
    fn enter_call(&mut self, offset: usize, argc: usize) -> Result<(), RuntimeFault> {
        let base = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| RuntimeFault::unknown("value stack underflow"))?;
        self.stack.push(Value::Int(self.base as i64))?;
        self.stack.push(Value::Int(self.ip as i64))?;
        self.base = base;
        self.depth += 1;
        self.ip = offset;
        Ok(())
    }

    fn return_from(&mut self, params: usize) -> Result<Control, RuntimeFault> {
        let value = self.stack.pop()?;
        let header = self.base + params;
        let saved_base = frame_word(self.stack.get(header)?)?;
        let return_ip = frame_word(self.stack.get(header + 1)?)?;
        self.stack.truncate(self.base);
        self.depth = self.depth.saturating_sub(1);
        self.stack.push(value.clone())?;
        if self.depth == 0 {
            return Ok(Control::Complete(value));
        }
        self.base = saved_base;
        self.ip = return_ip;
        Ok(Control::Continue)
    }

    /// Offset of an in-language function; the table entry is cached on the reference.
    fn resolve_function(&self, target: &FunctionRef, argc: usize) -> Result<usize, RuntimeFault> {
        let entry = match target.resolved() {
            Some(entry) => entry,
            None => {
                let entry = self
                    .program
                    .lookup(&target.namespace, &target.name)
                    .ok_or_else(|| RuntimeFault::FunctionNotFound {
                        name: target.qualified_name(),
                    })?;
                target.cache(entry);
                entry
            }
        };
        if entry.arity as usize != argc {
            return Err(RuntimeFault::ArgumentCount {
                function: target.qualified_name(),
                expected: entry.arity as usize,
                found: argc,
            });
        }
        Ok(entry.offset)
    }

    fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> Result<(), RuntimeFault> {
        let argc = args.len() + 1;
        let offset = self.resolve_function(&closure.function, argc)?;
        self.stack.push(Value::Array(Rc::clone(&closure.captures)))?;
        for arg in args {
            self.stack.push(arg)?;
        }
        self.enter_call(offset, argc)
    }

    fn call_host(
        &mut self,
        name: &str,
        candidates: &[Rc<HostFunction>],
        args: Vec<Value>,
    ) -> Result<(), RuntimeFault> {
        let resolved = overload::resolve(name, candidates, args, self.registry.as_ref())?;
        let value = self.registry.invoke(resolved)?;
        self.stack.push(value)
    }

    fn call_method(&mut self, receiver: Value, name: &str, args: Vec<Value>) -> Result<(), RuntimeFault> {
        if let Value::Object(object) = &receiver {
            let type_name = object.type_name().to_string();
            if self.registry.is_private(&type_name, name) {
                return Err(RuntimeFault::PrivateMemberAccess {
                    owner: type_name,
                    member: name.to_string(),
                });
            }
            let methods = self.registry.methods(&type_name, name);
            if !methods.is_empty() {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver.clone());
                full.extend(args);
                return self.call_host(&format!("{type_name}.{name}"), &methods, full);
            }
            if let Some(Value::Closure(closure)) = object.field(name) {
                return self.call_closure(&closure, args);
            }
            return Err(RuntimeFault::MemberNotFound {
                owner: type_name,
                member: name.to_string(),
            });
        }

        // Free host functions double as methods on built-in values.
        let candidates = self.registry.functions(name);
        if candidates.is_empty() {
            return Err(RuntimeFault::MemberNotFound {
                owner: receiver.type_name(),
                member: name.to_string(),
            });
        }
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver);
        full.extend(args);
        self.call_host(name, &candidates, full)
    }

    fn load_field(&self, target: &Value, name: &str) -> Result<Value, RuntimeFault> {
        match target {
            Value::Object(object) => {
                if self.registry.is_private(object.type_name(), name) {
                    return Err(RuntimeFault::PrivateMemberAccess {
                        owner: object.type_name().to_string(),
                        member: name.to_string(),
                    });
                }
                object.field(name).ok_or_else(|| RuntimeFault::MemberNotFound {
                    owner: object.type_name().to_string(),
                    member: name.to_string(),
                })
            }
            Value::Array(items) if name == "length" => Ok(Value::Int(items.borrow().len() as i64)),
            Value::Str(text) if name == "length" => Ok(Value::Int(text.chars().count() as i64)),
            other => Err(RuntimeFault::MemberNotFound {
                owner: other.type_name(),
                member: name.to_string(),
            }),
        }
    }

    fn store_field(&self, target: &Value, name: &str, value: Value) -> Result<(), RuntimeFault> {
        let Value::Object(object) = target else {
            return Err(RuntimeFault::MemberNotFound {
                owner: target.type_name(),
                member: name.to_string(),
            });
        };
        if self.registry.is_private(object.type_name(), name) {
            return Err(RuntimeFault::PrivateMemberAccess {
                owner: object.type_name().to_string(),
                member: name.to_string(),
            });
        }
        if object.set_field(name, value) {
            Ok(())
        } else {
            Err(RuntimeFault::MemberNotFound {
                owner: object.type_name().to_string(),
                member: name.to_string(),
            })
        }
    }

    fn load_index(&self, target: Value, index: Value) -> Result<Value, RuntimeFault> {
        match &target {
            Value::Array(items) => {
                let items = items.borrow();
                let position = element_index(&index, items.len())?;
                Ok(items[position].clone())
            }
            Value::Str(text) => {
                let len = text.chars().count();
                let position = element_index(&index, len)?;
                Ok(text
                    .chars()
                    .nth(position)
                    .map(|c| Value::Str(c.to_string()))
                    .unwrap_or(Value::Unit))
            }
            Value::Object(object) => {
                let getter = self.registry.indexer(object.type_name(), false).ok_or_else(|| {
                    RuntimeFault::IndexerNotFound {
                        type_name: object.type_name().to_string(),
                    }
                })?;
                let name = format!("{}[]", object.type_name());
                let resolved =
                    overload::resolve(&name, &[getter], vec![target.clone(), index], self.registry.as_ref())?;
                self.registry.invoke(resolved)
            }
            other => Err(RuntimeFault::IndexerNotFound {
                type_name: other.type_name(),
            }),
        }
    }

    fn store_index(&self, target: Value, index: Value, value: Value) -> Result<(), RuntimeFault> {
        match &target {
            Value::Array(items) => {
                let mut items = items.borrow_mut();
                let position = element_index(&index, items.len())?;
                items[position] = value;
                Ok(())
            }
            Value::Object(object) => {
                let setter = self.registry.indexer(object.type_name(), true).ok_or_else(|| {
                    RuntimeFault::IndexerNotFound {
                        type_name: object.type_name().to_string(),
                    }
                })?;
                let name = format!("{}[]=", object.type_name());
                let resolved = overload::resolve(
                    &name,
                    &[setter],
                    vec![target.clone(), index, value],
                    self.registry.as_ref(),
                )?;
                self.registry.invoke(resolved).map(|_| ())
            }
            other => Err(RuntimeFault::IndexerNotFound {
                type_name: other.type_name(),
            }),
        }
    }

    /// Host operator overloads win over the built-in semantics when either side is a
    /// host object.
    fn binary(&self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, RuntimeFault> {
        let overloads = self.registry.operators(op, &[&lhs, &rhs]);
        if !overloads.is_empty() {
            let resolved = overload::resolve(op.symbol(), &overloads, vec![lhs, rhs], self.registry.as_ref())?;
            return self.registry.invoke(resolved);
        }
        match lhs.binary(op, &rhs) {
            Some(result) => result,
            None => Err(RuntimeFault::OperatorNotFound {
                operator: op.symbol().to_string(),
                operands: vec![lhs.type_name(), rhs.type_name()],
            }),
        }
    }

    fn raise(&mut self, fault: RuntimeFault, instruction: Option<&Instruction>, ip: usize) -> MarineFault {
        self.state = EngineState::Faulted;
        let fault = MarineFault {
            fault,
            instruction: instruction.map(ToString::to_string),
            ip,
            debug_stack: self.debug_stack.clone(),
        };
        tracing::debug!(function = %self.entry, ip, "engine faulted: {}", fault.fault);
        self.emit_event(TelemetryEventKind::Faulted, Some(fault.fault.to_string()));
        fault
    }

    fn emit_event(&self, kind: TelemetryEventKind, detail: Option<String>) {
        if let Some(hook) = &self.options.telemetry_hook {
            let event = TelemetryEvent {
                kind,
                function: self.entry.clone(),
                stack_depth: self.stack.len(),
                yielded: self.yielded,
                detail,
                timestamp: Instant::now(),
            };
            hook(&event);
        }
    }

    fn emit_trace(&self, ip: usize, instruction: &Instruction) {
        let frame = self
            .debug_stack
            .last()
            .map(|context| context.function.as_str())
            .unwrap_or(self.entry.as_str());
        tracing::trace!("[frame={}] {:04}: {}", frame, ip, instruction);
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("entry", &self.entry)
            .field("state", &self.state)
            .field("ip", &self.ip)
            .field("base", &self.base)
            .field("depth", &self.depth)
            .field("stack_len", &self.stack.len())
            .finish()
    }
}

fn unary(op: UnaryOp, operand: &Value) -> Result<Value, RuntimeFault> {
    match operand.unary(op) {
        Some(result) => result,
        // `!` falls back to truthiness for non-bool operands.
        None if op == UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        None => Err(RuntimeFault::OperatorNotFound {
            operator: op.to_string(),
            operands: vec![operand.type_name()],
        }),
    }
}

fn frame_word(value: &Value) -> Result<usize, RuntimeFault> {
    value
        .as_int()
        .and_then(|word| usize::try_from(word).ok())
        .ok_or_else(|| RuntimeFault::unknown("corrupt call frame header"))
}

fn element_index(index: &Value, len: usize) -> Result<usize, RuntimeFault> {
    let raw = index.as_int().ok_or_else(|| RuntimeFault::TypeMismatch {
        expected: "int".into(),
        found: index.type_name(),
    })?;
    usize::try_from(raw)
        .ok()
        .filter(|position| *position < len)
        .ok_or(RuntimeFault::IndexOutOfRange { index: raw, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FunctionDef, ProgramUnit, Stmt};
    use crate::compiler::compile_units;
    use crate::host::TypeRef;

    fn engine_for(functions: Vec<FunctionDef>, registry: HostRegistry, options: RuntimeOptions) -> Engine {
        let program = compile_units(
            &[ProgramUnit::new("test.mrn", functions)],
            &registry.global_names(),
        )
        .expect("compile");
        Engine::new(Rc::new(program), Rc::new(registry), options)
    }

    fn completed(outcome: Result<StepOutcome, MarineFault>) -> Value {
        match outcome.expect("run") {
            StepOutcome::Completed(value) => value,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn nested_calls_leave_one_value_per_call() {
        let functions = vec![
            FunctionDef::new(
                "twice",
                vec!["x"],
                vec![Stmt::ret(Expr::binary(BinaryOp::Mul, Expr::var("x"), Expr::int(2)))],
            ),
            FunctionDef::new(
                "main",
                Vec::<String>::new(),
                vec![
                    Stmt::let_("a", Expr::call("twice", vec![Expr::int(3)])),
                    Stmt::ret(Expr::binary(
                        BinaryOp::Add,
                        Expr::var("a"),
                        Expr::call("twice", vec![Expr::int(4)]),
                    )),
                ],
            ),
        ];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        assert_eq!(completed(engine.start(&[], "main", vec![])), Value::Int(14));
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(engine.stack_len(), 1);
    }

    #[test]
    fn globals_sit_below_the_entry_frame() {
        let registry = HostRegistry::new();
        registry.register_global("bonus", Value::Int(10));
        let functions = vec![FunctionDef::new(
            "main",
            vec!["x"],
            vec![
                Stmt::assign("bonus", Expr::binary(BinaryOp::Add, Expr::var("bonus"), Expr::var("x"))),
                Stmt::ret(Expr::var("bonus")),
            ],
        )];
        let registry = Rc::new(registry);
        let program = compile_units(
            &[ProgramUnit::new("g.mrn", functions)],
            &registry.global_names(),
        )
        .expect("compile");
        let mut engine = Engine::new(Rc::new(program), Rc::clone(&registry), RuntimeOptions::default());
        assert_eq!(completed(engine.start(&[], "main", vec![Value::Int(5)])), Value::Int(15));
        assert_eq!(engine.stack_len(), 2);
        assert_eq!(registry.global("bonus"), Some(Value::Int(15)));
    }

    #[test]
    fn unbounded_recursion_overflows_the_stack() {
        let functions = vec![FunctionDef::new(
            "dive",
            vec!["n"],
            vec![Stmt::ret(Expr::call(
                "dive",
                vec![Expr::binary(BinaryOp::Add, Expr::var("n"), Expr::int(1))],
            ))],
        )];
        let options = RuntimeOptions::default().with_stack_capacity(64);
        let mut engine = engine_for(functions, HostRegistry::new(), options);
        let fault = engine.start(&[], "dive", vec![Value::Int(0)]).expect_err("overflow");
        assert_eq!(fault.fault, RuntimeFault::StackOverflow { capacity: 64 });
        assert_eq!(engine.state(), EngineState::Faulted);
        assert!(fault.debug_stack.len() > 1);
    }

    #[test]
    fn faults_capture_instruction_and_debug_stack() {
        let functions = vec![
            FunctionDef::new(
                "divide",
                vec!["a", "b"],
                vec![Stmt::ret(Expr::binary(BinaryOp::Div, Expr::var("a"), Expr::var("b")))],
            ),
            FunctionDef::new(
                "main",
                Vec::<String>::new(),
                vec![Stmt::ret(Expr::call("divide", vec![Expr::int(1), Expr::int(0)]))],
            ),
        ];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        let fault = engine.start(&[], "main", vec![]).expect_err("division");
        assert_eq!(fault.fault, RuntimeFault::DivisionByZero);
        assert_eq!(
            fault.instruction,
            Some(Instruction::Binary(BinaryOp::Div).to_string())
        );
        let frames: Vec<&str> = fault.debug_stack.iter().map(|c| c.function.as_str()).collect();
        assert_eq!(frames, vec!["main", "divide"]);
        assert_eq!(fault.innermost().map(|c| c.function.as_str()), Some("divide"));
    }

    #[test]
    fn yield_suspends_and_resume_continues() {
        let functions = vec![FunctionDef::new(
            "count",
            Vec::<String>::new(),
            vec![
                Stmt::yield_(Expr::int(1)),
                Stmt::yield_(Expr::int(2)),
                Stmt::ret(Expr::int(3)),
            ],
        )];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        assert_eq!(
            engine.start(&[], "count", vec![]).expect("start"),
            StepOutcome::Yielded(Value::Int(1))
        );
        assert_eq!(engine.state(), EngineState::Suspended);
        assert_eq!(engine.resume().expect("resume"), StepOutcome::Yielded(Value::Int(2)));
        assert_eq!(engine.resume().expect("resume"), StepOutcome::Completed(Value::Int(3)));
        let fault = engine.resume().expect_err("not resumable");
        assert_eq!(
            fault.fault,
            RuntimeFault::NotResumable {
                state: "completed".into()
            }
        );
    }

    #[test]
    fn unknown_entry_points_fault() {
        let mut engine = engine_for(
            vec![FunctionDef::new("main", Vec::<String>::new(), vec![])],
            HostRegistry::new(),
            RuntimeOptions::default(),
        );
        let fault = engine.start(&[], "missing", vec![]).expect_err("missing");
        assert_eq!(
            fault.fault,
            RuntimeFault::FunctionNotFound {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn host_calls_resolve_at_run_time() {
        let registry = HostRegistry::new();
        registry.register_function(HostFunction::new(
            "add_one",
            vec![TypeRef::int()],
            |call| Ok(Value::Int(call.int(0)? + 1)),
        ));
        let functions = vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::call("add_one", vec![Expr::int(41)]))],
        )];
        let mut engine = engine_for(functions, registry, RuntimeOptions::default());
        assert_eq!(completed(engine.start(&[], "main", vec![])), Value::Int(42));
    }

    #[test]
    fn missing_host_function_is_a_runtime_fault() {
        let functions = vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::call("nowhere", vec![]))],
        )];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        let fault = engine.start(&[], "main", vec![]).expect_err("missing host");
        assert_eq!(
            fault.fault,
            RuntimeFault::HostFunctionNotFound {
                name: "nowhere".into()
            }
        );
    }

    #[test]
    fn short_circuit_keeps_the_deciding_operand() {
        let functions = vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::binary(
                BinaryOp::Or,
                Expr::int(7),
                Expr::call("never_called", vec![]),
            ))],
        )];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        assert_eq!(completed(engine.start(&[], "main", vec![])), Value::Int(7));
    }

    #[test]
    fn numeric_for_counts_down_with_negative_step() {
        let functions = vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![
                Stmt::let_("sum", Expr::int(0)),
                Stmt::For {
                    var: "i".into(),
                    start: Expr::int(5),
                    end: Expr::int(1),
                    step: Some(Expr::int(-2)),
                    body: vec![Stmt::assign(
                        "sum",
                        Expr::binary(BinaryOp::Add, Expr::var("sum"), Expr::var("i")),
                    )],
                },
                Stmt::ret(Expr::var("sum")),
            ],
        )];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        // 5 + 3 + 1
        assert_eq!(completed(engine.start(&[], "main", vec![])), Value::Int(9));
    }

    #[test]
    fn zero_step_faults_before_the_first_iteration() {
        let functions = vec![FunctionDef::new(
            "main",
            vec!["step"],
            vec![
                Stmt::For {
                    var: "i".into(),
                    start: Expr::int(1),
                    end: Expr::int(3),
                    step: Some(Expr::var("step")),
                    body: vec![Stmt::yield_(Expr::var("i"))],
                },
                Stmt::ret(Expr::int(0)),
            ],
        )];
        for step in [Value::Int(0), Value::Float(0.0)] {
            let mut engine = engine_for(functions.clone(), HostRegistry::new(), RuntimeOptions::default());
            let fault = engine.start(&[], "main", vec![step]).expect_err("zero step");
            assert_eq!(fault.fault, RuntimeFault::ZeroForStep);
            assert_eq!(fault.instruction, Some("CHECK_STEP".to_string()));
            assert_eq!(engine.state(), EngineState::Faulted);
        }
    }

    #[test]
    fn calls_closures_and_breaks_keep_the_frame_balanced() {
        let add = |lhs, rhs| Expr::binary(BinaryOp::Add, lhs, rhs);
        let functions = vec![
            FunctionDef::new(
                "twice",
                vec!["x"],
                vec![Stmt::ret(Expr::binary(BinaryOp::Mul, Expr::var("x"), Expr::int(2)))],
            ),
            FunctionDef::new(
                "main",
                Vec::<String>::new(),
                vec![
                    Stmt::let_("total", Expr::int(0)),
                    Stmt::let_("i", Expr::int(0)),
                    Stmt::yield_(Expr::int(0)),
                    // total = total + twice(i) + (if i >= 3 then break else 0 end)
                    Stmt::while_(
                        Expr::bool(true),
                        vec![
                            Stmt::assign("i", add(Expr::var("i"), Expr::int(1))),
                            Stmt::assign(
                                "total",
                                add(
                                    add(Expr::var("total"), Expr::call("twice", vec![Expr::var("i")])),
                                    Expr::if_else(
                                        Expr::binary(BinaryOp::Ge, Expr::var("i"), Expr::int(3)),
                                        vec![Stmt::Break],
                                        Some(vec![Stmt::expr(Expr::int(0))]),
                                    ),
                                ),
                            ),
                        ],
                    ),
                    Stmt::yield_(Expr::var("total")),
                    Stmt::let_(
                        "offset",
                        Expr::action(vec!["x"], vec![Stmt::ret(add(Expr::var("x"), Expr::var("total")))]),
                    ),
                    // 100 + (if true then while true: 5 + (if true then break end) end; offset(1) end)
                    Stmt::ret(add(
                        Expr::int(100),
                        Expr::if_else(
                            Expr::bool(true),
                            vec![
                                Stmt::while_(
                                    Expr::bool(true),
                                    vec![Stmt::expr(add(
                                        Expr::int(5),
                                        Expr::if_else(Expr::bool(true), vec![Stmt::Break], None),
                                    ))],
                                ),
                                Stmt::expr(Expr::call("offset", vec![Expr::int(1)])),
                            ],
                            None,
                        ),
                    )),
                ],
            ),
        ];
        let mut engine = engine_for(functions, HostRegistry::new(), RuntimeOptions::default());
        assert_eq!(
            engine.start(&[], "main", vec![]).expect("start"),
            StepOutcome::Yielded(Value::Int(0))
        );
        let before_loop = engine.stack_len();
        assert_eq!(engine.resume().expect("resume"), StepOutcome::Yielded(Value::Int(6)));
        assert_eq!(engine.stack_len(), before_loop);
        // total is 6, offset(1) is 7
        assert_eq!(completed(engine.resume()), Value::Int(107));
        assert_eq!(engine.stack_len(), 1);
    }
}

//=====================================================
// End of file
//=====================================================
