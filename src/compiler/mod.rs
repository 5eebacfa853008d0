//=====================================================
// File: compiler/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript bytecode compiler
// Objective: Lower program units to a flat MarineIL instruction list and namespace
//            table: slot allocation, jump backpatching, closure and await lowering
//=====================================================

pub mod captures;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::ast::{BinaryOp, Expr, FunctionDef, Literal, ProgramUnit, SourceRange, Stmt};
use crate::error::CompileError;
use crate::host::HostRegistry;
use crate::vm::instruction::{Constant, DebugContext, FunctionRef, Instruction};
use crate::vm::program::{CompiledProgram, FunctionEntry, NamespaceTable};

/// Frame header between the arguments and the locals: saved frame base, return pointer.
pub const FRAME_HEADER: u32 = 2;

const MAX_PARAMS: usize = u16::MAX as usize;

/// Placeholder target of a jump that has not been patched yet.
const UNPATCHED: usize = usize::MAX;

/// Compiles every unit together. `globals` lists the host global names in the order
/// they occupy absolute stack slots.
pub fn compile_units(
    units: &[ProgramUnit],
    globals: &[String],
) -> Result<CompiledProgram, CompileError> {
    if units.is_empty() {
        return Err(CompileError::NoUnits);
    }

    let mut compiler = ProgramCompiler::new(globals);
    compiler.index_functions(units)?;

    for unit in units {
        for function in &unit.functions {
            compiler.compile_function(PendingFunction::declared(unit, function))?;
        }
    }
    while let Some(action) = compiler.pending.pop_front() {
        compiler.compile_function(action)?;
    }

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "compiler".to_string(),
        format!("marinescript {}", env!("CARGO_PKG_VERSION")),
    );
    metadata.insert(
        "units".to_string(),
        units
            .iter()
            .map(|unit| unit.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
    );

    tracing::debug!(
        units = units.len(),
        instructions = compiler.instructions.len(),
        "compiled program"
    );

    Ok(CompiledProgram {
        instructions: compiler.instructions,
        namespaces: compiler.namespaces,
        globals: globals.to_vec(),
        metadata,
    })
}

/// Binds host calls whose name has exactly one registered descriptor, and static
/// accesses to registered types. Unbound names stay resolved at run time. A binding
/// only short-cuts resolution while its descriptor remains the only one for the name.
pub fn bind_host_references(program: &mut CompiledProgram, registry: &HostRegistry) -> usize {
    let mut bound = 0;
    for instruction in &mut program.instructions {
        match instruction {
            Instruction::CallHost { name, binding, .. } if binding.is_none() => {
                let candidates = registry.functions(name);
                if let [only] = candidates.as_slice() {
                    *binding = Some(only.reference());
                    bound += 1;
                }
            }
            Instruction::CallStatic {
                type_name, bound: is_bound, ..
            }
            | Instruction::LoadStatic {
                type_name, bound: is_bound, ..
            } if !*is_bound => {
                if registry.type_named(type_name).is_some() {
                    *is_bound = true;
                    bound += 1;
                }
            }
            _ => {}
        }
    }
    tracing::debug!(bound, "bound host references");
    bound
}

/// A function body waiting to be compiled: declared functions first, then action
/// bodies discovered while compiling.
struct PendingFunction {
    unit: String,
    namespace: Vec<String>,
    name: String,
    params: Vec<String>,
    body: Vec<Stmt>,
    range: SourceRange,
    /// Capture list for action bodies; `None` for declared functions.
    captures: Option<Vec<String>>,
}

impl PendingFunction {
    fn declared(unit: &ProgramUnit, function: &FunctionDef) -> Self {
        Self {
            unit: unit.name.clone(),
            namespace: unit.namespace.clone(),
            name: function.name.clone(),
            params: function.params.clone(),
            body: function.body.clone(),
            range: function.range,
            captures: None,
        }
    }
}

struct ProgramCompiler {
    globals: HashMap<String, u32>,
    declared: HashSet<(Vec<String>, String)>,
    instructions: Vec<Instruction>,
    namespaces: NamespaceTable,
    pending: VecDeque<PendingFunction>,
}

impl ProgramCompiler {
    fn new(globals: &[String]) -> Self {
        Self {
            globals: globals
                .iter()
                .enumerate()
                .map(|(slot, name)| (name.clone(), slot as u32))
                .collect(),
            declared: HashSet::new(),
            instructions: Vec::new(),
            namespaces: NamespaceTable::new(),
            pending: VecDeque::new(),
        }
    }

    fn index_functions(&mut self, units: &[ProgramUnit]) -> Result<(), CompileError> {
        for unit in units {
            for function in &unit.functions {
                let key = (unit.namespace.clone(), function.name.clone());
                if !self.declared.insert(key) {
                    return Err(CompileError::DuplicateFunction {
                        name: FunctionRef::new(unit.namespace.clone(), &function.name)
                            .qualified_name(),
                    });
                }
            }
        }
        Ok(())
    }

    fn is_declared(&self, namespace: &[String], name: &str) -> bool {
        self.declared
            .contains(&(namespace.to_vec(), name.to_string()))
    }

    /// Namespace of the in-language function a call refers to, if any.
    fn find_function(&self, current: &[String], namespace: &[String], name: &str) -> Option<Vec<String>> {
        if namespace.is_empty() {
            if self.is_declared(current, name) {
                return Some(current.to_vec());
            }
            return self.is_declared(&[], name).then(Vec::new);
        }
        if self.is_declared(namespace, name) {
            return Some(namespace.to_vec());
        }
        let mut relative = current.to_vec();
        relative.extend(namespace.iter().cloned());
        self.is_declared(&relative, name).then_some(relative)
    }

    fn compile_function(&mut self, source: PendingFunction) -> Result<(), CompileError> {
        let carrier = usize::from(source.captures.is_some());
        let param_count = source.params.len() + carrier;
        let qualified = FunctionRef::new(source.namespace.clone(), &source.name).qualified_name();
        if param_count > MAX_PARAMS {
            return Err(CompileError::TooManyParameters {
                function: qualified,
                count: param_count,
                limit: MAX_PARAMS,
            });
        }

        let offset = self.instructions.len();
        self.namespaces.insert(
            &source.namespace,
            &source.name,
            FunctionEntry {
                offset,
                arity: param_count as u32,
            },
        );

        let mut function = FunctionCompiler::new(self, &source, param_count as u32);
        function.compile_body(&source.body)?;

        tracing::trace!(
            function = %qualified,
            offset,
            len = self.instructions.len() - offset,
            "compiled function"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Binding {
    Local(u32),
    Capture(u32),
    Global(u32),
}

/// Break jumps of one loop and the operand depth at its entry.
struct LoopExits {
    breaks: Vec<usize>,
    operands: usize,
}

struct FunctionCompiler<'a> {
    program: &'a mut ProgramCompiler,
    unit: String,
    namespace: Vec<String>,
    name: String,
    range: SourceRange,
    scopes: Vec<HashMap<String, u32>>,
    params: u32,
    locals: u32,
    captures: Vec<String>,
    loops: Vec<LoopExits>,
    /// Values pushed by enclosing expressions that are still waiting for their consumer.
    operands: usize,
    actions: u32,
}

impl<'a> FunctionCompiler<'a> {
    fn new(program: &'a mut ProgramCompiler, source: &PendingFunction, params: u32) -> Self {
        let captures = source.captures.clone().unwrap_or_default();
        let first_param = params - source.params.len() as u32;
        let parameters = source
            .params
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), first_param + index as u32))
            .collect();

        Self {
            program,
            unit: source.unit.clone(),
            namespace: source.namespace.clone(),
            name: source.name.clone(),
            range: source.range,
            scopes: vec![parameters],
            params,
            locals: 0,
            captures,
            loops: Vec::new(),
            operands: 0,
            actions: 0,
        }
    }

    fn compile_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        let alloc = self.emit(Instruction::AllocFrame(0));
        let qualified = FunctionRef::new(self.namespace.clone(), &self.name).qualified_name();
        self.emit(Instruction::PushDebugContext(DebugContext::new(
            self.unit.clone(),
            qualified,
            self.range,
        )));

        self.compile_statements(body)?;

        self.emit(Instruction::PushConst(Constant::Unit));
        self.emit_return();
        self.program.instructions[alloc] = Instruction::AllocFrame(self.locals);
        Ok(())
    }

    fn compile_statements(&mut self, statements: &[Stmt]) -> Result<(), CompileError> {
        for stmt in statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, value } => {
                self.compile_expr(value)?;
                let slot = self.declare_local(name);
                self.emit(Instruction::StoreLocal(slot));
            }
            Stmt::Assign { name, value } => self.compile_assign(name, value)?,
            Stmt::FieldAssign {
                target,
                field,
                value,
            } => {
                self.compile_operands([&*target, value])?;
                self.emit(Instruction::StoreField(field.clone()));
            }
            Stmt::IndexAssign {
                target,
                index,
                value,
            } => {
                self.compile_operands([&*target, &*index, value])?;
                self.emit(Instruction::StoreIndex);
            }
            Stmt::While { cond, body } => self.compile_while(cond, body)?,
            Stmt::For {
                var,
                start,
                end,
                step,
                body,
            } => self.compile_numeric_for(var, start, end, step.as_ref(), body)?,
            Stmt::ForEach {
                var,
                iterable,
                body,
            } => self.compile_for_each(var, iterable, body)?,
            Stmt::Break => {
                let Some(entry_operands) = self.loops.last().map(|exits| exits.operands) else {
                    return Err(CompileError::BreakOutsideLoop {
                        function: self.name.clone(),
                    });
                };
                // Drop operands of the expressions the break leaves unfinished.
                for _ in entry_operands..self.operands {
                    self.emit(Instruction::Pop);
                }
                let jump = self.emit_jump(Instruction::Jump(UNPATCHED));
                if let Some(exits) = self.loops.last_mut() {
                    exits.breaks.push(jump);
                }
            }
            Stmt::Yield(value) => {
                self.compile_optional(value.as_ref())?;
                self.emit(Instruction::Yield);
            }
            Stmt::Return(value) => {
                self.compile_optional(value.as_ref())?;
                self.emit_return();
            }
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Instruction::Pop);
            }
        }
        Ok(())
    }

    fn compile_optional(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        match value {
            Some(expr) => self.compile_expr(expr),
            None => {
                self.emit(Instruction::PushConst(Constant::Unit));
                Ok(())
            }
        }
    }

    fn compile_assign(&mut self, name: &str, value: &Expr) -> Result<(), CompileError> {
        match self.resolve(name) {
            Some(Binding::Local(slot)) => {
                self.compile_expr(value)?;
                self.emit(Instruction::StoreLocal(slot));
            }
            Some(Binding::Capture(index)) => {
                self.emit(Instruction::LoadLocal(0));
                self.emit(Instruction::PushConst(Constant::Int(i64::from(index))));
                self.operands += 2;
                self.compile_expr(value)?;
                self.operands -= 2;
                self.emit(Instruction::StoreIndex);
            }
            Some(Binding::Global(slot)) => {
                self.compile_expr(value)?;
                self.emit(Instruction::StoreGlobal(slot));
            }
            None => return Err(self.undefined(name)),
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let loop_start = self.program.instructions.len();
        self.compile_expr(cond)?;
        let exit_jump = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));
        self.push_loop();
        self.begin_scope();
        self.compile_statements(body)?;
        self.end_scope();
        self.emit(Instruction::Jump(loop_start));
        self.patch_jump(exit_jump);
        self.patch_breaks();
        Ok(())
    }

    /// `for var = start, end[, step]`: inclusive bound, counting down when step < 0.
    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.begin_scope();
        self.compile_expr(end)?;
        let end_slot = self.declare_hidden();
        self.emit(Instruction::StoreLocal(end_slot));
        match step {
            Some(step) => self.compile_expr(step)?,
            None => {
                self.emit(Instruction::PushConst(Constant::Int(1)));
            }
        }
        self.emit(Instruction::CheckStep);
        let step_slot = self.declare_hidden();
        self.emit(Instruction::StoreLocal(step_slot));
        self.compile_expr(start)?;
        let var_slot = self.declare_local(var);
        self.emit(Instruction::StoreLocal(var_slot));

        let loop_start = self.program.instructions.len();
        self.emit(Instruction::LoadLocal(step_slot));
        self.emit(Instruction::PushConst(Constant::Int(0)));
        self.emit(Instruction::Binary(BinaryOp::Lt));
        let ascending = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));
        self.emit(Instruction::LoadLocal(var_slot));
        self.emit(Instruction::LoadLocal(end_slot));
        self.emit(Instruction::Binary(BinaryOp::Ge));
        let test = self.emit_jump(Instruction::Jump(UNPATCHED));
        self.patch_jump(ascending);
        self.emit(Instruction::LoadLocal(var_slot));
        self.emit(Instruction::LoadLocal(end_slot));
        self.emit(Instruction::Binary(BinaryOp::Le));
        self.patch_jump(test);
        let exit_jump = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));

        self.push_loop();
        self.begin_scope();
        self.compile_statements(body)?;
        self.end_scope();

        self.emit(Instruction::LoadLocal(var_slot));
        self.emit(Instruction::LoadLocal(step_slot));
        self.emit(Instruction::Binary(BinaryOp::Add));
        self.emit(Instruction::StoreLocal(var_slot));
        self.emit(Instruction::Jump(loop_start));
        self.patch_jump(exit_jump);
        self.patch_breaks();
        self.end_scope();
        Ok(())
    }

    fn compile_for_each(
        &mut self,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.begin_scope();
        self.compile_expr(iterable)?;
        self.emit(Instruction::GetIterator);
        let iterator = self.declare_hidden();
        self.emit(Instruction::StoreLocal(iterator));
        let var_slot = self.declare_local(var);

        let loop_start = self.program.instructions.len();
        self.emit(Instruction::LoadLocal(iterator));
        self.emit(Instruction::IterMoveNext);
        let exit_jump = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));
        self.emit(Instruction::LoadLocal(iterator));
        self.emit(Instruction::IterCurrent);
        self.emit(Instruction::StoreLocal(var_slot));

        self.push_loop();
        self.begin_scope();
        self.compile_statements(body)?;
        self.end_scope();

        self.emit(Instruction::Jump(loop_start));
        self.patch_jump(exit_jump);
        self.patch_breaks();
        self.end_scope();
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(literal) => {
                self.emit(Instruction::PushConst(literal_constant(literal)));
            }
            Expr::Variable(name) => self.compile_load(name)?,
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    self.compile_expr(lhs)?;
                    let short_circuit = if *op == BinaryOp::And {
                        Instruction::JumpIfFalseKeep(UNPATCHED)
                    } else {
                        Instruction::JumpIfTrueKeep(UNPATCHED)
                    };
                    let jump = self.emit_jump(short_circuit);
                    self.compile_expr(rhs)?;
                    self.patch_jump(jump);
                }
                _ => {
                    self.compile_operands([&**lhs, &**rhs])?;
                    self.emit(Instruction::Binary(*op));
                }
            },
            Expr::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(Instruction::Unary(*op));
            }
            Expr::Call {
                namespace,
                name,
                args,
            } => self.compile_call(namespace, name, args)?,
            Expr::MethodCall {
                receiver,
                name,
                args,
            } => {
                let argc = args.len() as u32;
                if let Some(type_name) = self.static_receiver(receiver) {
                    self.compile_args(args)?;
                    self.emit(Instruction::CallStatic {
                        type_name,
                        name: name.clone(),
                        argc,
                        bound: false,
                    });
                } else {
                    self.compile_operands(std::iter::once(&**receiver).chain(args))?;
                    self.emit(Instruction::CallMethod {
                        name: name.clone(),
                        argc,
                    });
                }
            }
            Expr::Invoke { callee, args } => {
                self.compile_operands(std::iter::once(&**callee).chain(args))?;
                self.emit(Instruction::InvokeClosure {
                    argc: args.len() as u32,
                });
            }
            Expr::Field { target, name } => {
                if let Some(type_name) = self.static_receiver(target) {
                    self.emit(Instruction::LoadStatic {
                        type_name,
                        member: name.clone(),
                        bound: false,
                    });
                } else {
                    self.compile_expr(target)?;
                    self.emit(Instruction::LoadField(name.clone()));
                }
            }
            Expr::Index { target, index } => {
                self.compile_operands([&**target, &**index])?;
                self.emit(Instruction::LoadIndex);
            }
            Expr::If {
                cond,
                then_body,
                else_body,
            } => {
                self.compile_expr(cond)?;
                let jump_if_false = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));
                self.compile_block_value(then_body)?;
                let jump_end = self.emit_jump(Instruction::Jump(UNPATCHED));
                self.patch_jump(jump_if_false);
                self.compile_block_value(else_body.as_deref().unwrap_or_default())?;
                self.patch_jump(jump_end);
            }
            Expr::Action { params, body } => self.compile_action(params, body)?,
            Expr::Array(items) => {
                self.compile_args(items)?;
                self.emit(Instruction::MakeArray(items.len() as u32));
            }
            Expr::Await(inner) => self.compile_await(inner)?,
        }
        Ok(())
    }

    fn compile_args(&mut self, args: &[Expr]) -> Result<(), CompileError> {
        self.compile_operands(args)
    }

    /// Evaluates left to right, each value staying pending while the rest compile.
    fn compile_operands<'e>(
        &mut self,
        exprs: impl IntoIterator<Item = &'e Expr>,
    ) -> Result<(), CompileError> {
        let depth = self.operands;
        for expr in exprs {
            self.compile_expr(expr)?;
            self.operands += 1;
        }
        self.operands = depth;
        Ok(())
    }

    /// Leaves exactly one value: the trailing expression statement's, otherwise unit.
    fn compile_block_value(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.begin_scope();
        match body.split_last() {
            Some((Stmt::Expr(last), rest)) => {
                self.compile_statements(rest)?;
                self.compile_expr(last)?;
            }
            _ => {
                self.compile_statements(body)?;
                self.emit(Instruction::PushConst(Constant::Unit));
            }
        }
        self.end_scope();
        Ok(())
    }

    fn compile_call(
        &mut self,
        namespace: &[String],
        name: &str,
        args: &[Expr],
    ) -> Result<(), CompileError> {
        let argc = args.len() as u32;
        if namespace.is_empty() && self.resolve(name).is_some() {
            self.compile_load(name)?;
            self.operands += 1;
            self.compile_args(args)?;
            self.operands -= 1;
            self.emit(Instruction::InvokeClosure { argc });
            return Ok(());
        }

        self.compile_args(args)?;
        match self.program.find_function(&self.namespace, namespace, name) {
            Some(target_namespace) => {
                self.emit(Instruction::CallFunction {
                    target: FunctionRef::new(target_namespace, name),
                    argc,
                });
            }
            None => {
                // Host names are checked when the call executes.
                let mut qualified = namespace.to_vec();
                qualified.push(name.to_string());
                self.emit(Instruction::CallHost {
                    name: qualified.join("."),
                    argc,
                    binding: None,
                });
            }
        }
        Ok(())
    }

    fn compile_action(&mut self, params: &[String], body: &[Stmt]) -> Result<(), CompileError> {
        let captured: Vec<String> = captures::free_variables(params, body)
            .into_iter()
            .filter(|name| {
                matches!(
                    self.resolve(name),
                    Some(Binding::Local(_) | Binding::Capture(_))
                )
            })
            .collect();
        for name in &captured {
            self.compile_load(name)?;
        }
        self.emit(Instruction::MakeArray(captured.len() as u32));

        let synthetic = format!("{}$action{}", self.name, self.actions);
        self.actions += 1;
        self.program.pending.push_back(PendingFunction {
            unit: self.unit.clone(),
            namespace: self.namespace.clone(),
            name: synthetic.clone(),
            params: params.to_vec(),
            body: body.to_vec(),
            range: self.range,
            captures: Some(captured),
        });
        self.emit(Instruction::MakeClosure {
            function: FunctionRef::new(self.namespace.clone(), synthetic),
        });
        Ok(())
    }

    /// Drains the iterator, yielding each element, and leaves the last one.
    fn compile_await(&mut self, inner: &Expr) -> Result<(), CompileError> {
        self.compile_expr(inner)?;
        self.emit(Instruction::GetIterator);
        let iterator = self.declare_hidden();
        self.emit(Instruction::StoreLocal(iterator));
        let current = self.declare_hidden();
        self.emit(Instruction::PushConst(Constant::Unit));
        self.emit(Instruction::StoreLocal(current));

        let loop_start = self.program.instructions.len();
        self.emit(Instruction::LoadLocal(iterator));
        self.emit(Instruction::IterMoveNext);
        let exit_jump = self.emit_jump(Instruction::JumpIfFalse(UNPATCHED));
        self.emit(Instruction::LoadLocal(iterator));
        self.emit(Instruction::IterCurrent);
        self.emit(Instruction::StoreLocal(current));
        self.emit(Instruction::LoadLocal(current));
        self.emit(Instruction::Yield);
        self.emit(Instruction::Jump(loop_start));
        self.patch_jump(exit_jump);
        self.emit(Instruction::LoadLocal(current));
        Ok(())
    }

    fn compile_load(&mut self, name: &str) -> Result<(), CompileError> {
        match self.resolve(name) {
            Some(Binding::Local(slot)) => {
                self.emit(Instruction::LoadLocal(slot));
            }
            Some(Binding::Capture(index)) => {
                self.emit(Instruction::LoadLocal(0));
                self.emit(Instruction::PushConst(Constant::Int(i64::from(index))));
                self.emit(Instruction::LoadIndex);
            }
            Some(Binding::Global(slot)) => {
                self.emit(Instruction::LoadGlobal(slot));
            }
            None => return Err(self.undefined(name)),
        }
        Ok(())
    }

    /// A bare name that is not a variable names a host type.
    fn static_receiver(&self, receiver: &Expr) -> Option<String> {
        match receiver {
            Expr::Variable(name) if self.resolve(name).is_none() => Some(name.clone()),
            _ => None,
        }
    }

    fn resolve(&self, name: &str) -> Option<Binding> {
        for scope in self.scopes.iter().rev() {
            if let Some(slot) = scope.get(name) {
                return Some(Binding::Local(*slot));
            }
        }
        if let Some(index) = self.captures.iter().position(|capture| capture == name) {
            return Some(Binding::Capture(index as u32));
        }
        self.program.globals.get(name).copied().map(Binding::Global)
    }

    fn undefined(&self, name: &str) -> CompileError {
        CompileError::UndefinedVariable {
            name: name.to_string(),
            function: self.name.clone(),
        }
    }

    fn declare_local(&mut self, name: &str) -> u32 {
        let slot = self.declare_hidden();
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), slot);
        }
        slot
    }

    /// Allocates an unnamed local slot.
    fn declare_hidden(&mut self) -> u32 {
        let slot = self.params + FRAME_HEADER + self.locals;
        self.locals += 1;
        slot
    }

    fn begin_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn end_scope(&mut self) {
        self.scopes.pop();
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        let index = self.program.instructions.len();
        self.program.instructions.push(instruction);
        index
    }

    fn emit_return(&mut self) {
        self.emit(Instruction::PopDebugContext);
        self.emit(Instruction::Return {
            params: self.params,
        });
    }

    fn emit_jump(&mut self, instruction: Instruction) -> usize {
        self.emit(instruction)
    }

    fn patch_jump(&mut self, index: usize) {
        let target = self.program.instructions.len();
        if let Some(instruction) = self.program.instructions.get_mut(index) {
            instruction.set_jump_target(target);
        }
    }

    fn push_loop(&mut self) {
        self.loops.push(LoopExits {
            breaks: Vec::new(),
            operands: self.operands,
        });
    }

    fn patch_breaks(&mut self) {
        if let Some(exits) = self.loops.pop() {
            for jump in exits.breaks {
                self.patch_jump(jump);
            }
        }
    }
}

fn literal_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::Unit => Constant::Unit,
        Literal::Bool(value) => Constant::Bool(*value),
        Literal::Int(value) => Constant::Int(*value),
        Literal::Float(value) => Constant::Float(*value),
        Literal::Str(value) => Constant::Str(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, Expr, FunctionDef, ProgramUnit, Stmt};

    fn compile(functions: Vec<FunctionDef>) -> CompiledProgram {
        compile_units(&[ProgramUnit::new("test.mrn", functions)], &[]).expect("compile")
    }

    fn body_of<'p>(program: &'p CompiledProgram, name: &str) -> &'p [Instruction] {
        let entry = program.lookup(&[], name).expect("function entry");
        &program.instructions[entry.offset..]
    }

    #[test]
    fn arithmetic_emits_operands_before_operators() {
        let program = compile(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::binary(
                BinaryOp::Sub,
                Expr::int(7),
                Expr::int(2),
            ))],
        )]);
        let body = body_of(&program, "main");
        assert_eq!(body[0], Instruction::AllocFrame(0));
        assert!(matches!(body[1], Instruction::PushDebugContext(_)));
        assert_eq!(body[2], Instruction::PushConst(Constant::Int(7)));
        assert_eq!(body[3], Instruction::PushConst(Constant::Int(2)));
        assert_eq!(body[4], Instruction::Binary(BinaryOp::Sub));
        assert_eq!(body[5], Instruction::PopDebugContext);
        assert_eq!(body[6], Instruction::Return { params: 0 });
    }

    #[test]
    fn locals_follow_parameters_and_header() {
        let program = compile(vec![FunctionDef::new(
            "f",
            vec!["a", "b"],
            vec![
                Stmt::let_("x", Expr::var("a")),
                Stmt::let_("x", Expr::var("x")),
                Stmt::ret(Expr::var("x")),
            ],
        )]);
        let body = body_of(&program, "f");
        assert_eq!(body[0], Instruction::AllocFrame(2));
        assert_eq!(body[2], Instruction::LoadLocal(0));
        assert_eq!(body[3], Instruction::StoreLocal(4));
        // The second `let x` reads the first slot and allocates a fresh one.
        assert_eq!(body[4], Instruction::LoadLocal(4));
        assert_eq!(body[5], Instruction::StoreLocal(5));
        assert_eq!(body[6], Instruction::LoadLocal(5));
    }

    #[test]
    fn globals_compile_to_absolute_slots() {
        let program = compile_units(
            &[ProgramUnit::new(
                "g.mrn",
                vec![FunctionDef::new(
                    "main",
                    Vec::<String>::new(),
                    vec![
                        Stmt::assign("score", Expr::int(3)),
                        Stmt::ret(Expr::var("level")),
                    ],
                )],
            )],
            &["level".to_string(), "score".to_string()],
        )
        .expect("compile");
        assert!(program.instructions.contains(&Instruction::StoreGlobal(1)));
        assert!(program.instructions.contains(&Instruction::LoadGlobal(0)));
    }

    #[test]
    fn undefined_variables_are_compile_errors() {
        let error = compile_units(
            &[ProgramUnit::new(
                "bad.mrn",
                vec![FunctionDef::new(
                    "main",
                    Vec::<String>::new(),
                    vec![Stmt::ret(Expr::var("ghost"))],
                )],
            )],
            &[],
        )
        .expect_err("undefined");
        assert_eq!(
            error,
            CompileError::UndefinedVariable {
                name: "ghost".into(),
                function: "main".into()
            }
        );
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let error = compile_units(
            &[ProgramUnit::new(
                "bad.mrn",
                vec![FunctionDef::new("main", Vec::<String>::new(), vec![Stmt::Break])],
            )],
            &[],
        )
        .expect_err("break");
        assert!(matches!(error, CompileError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn duplicate_functions_in_one_namespace_are_rejected() {
        let unit = ProgramUnit::new(
            "dup.mrn",
            vec![
                FunctionDef::new("f", Vec::<String>::new(), vec![]),
                FunctionDef::new("f", Vec::<String>::new(), vec![]),
            ],
        )
        .with_namespace(["app"]);
        let error = compile_units(&[unit], &[]).expect_err("duplicate");
        assert_eq!(
            error,
            CompileError::DuplicateFunction {
                name: "app.f".into()
            }
        );
    }

    #[test]
    fn unknown_calls_defer_to_host() {
        let program = compile(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::call_in(["io"], "read", vec![]))],
        )]);
        assert!(program.instructions.iter().any(|instruction| matches!(
            instruction,
            Instruction::CallHost { name, argc: 0, binding: None } if name == "io.read"
        )));
    }

    #[test]
    fn calls_prefer_the_callers_namespace() {
        let root = ProgramUnit::new(
            "root.mrn",
            vec![FunctionDef::new("helper", Vec::<String>::new(), vec![])],
        );
        let nested = ProgramUnit::new(
            "app.mrn",
            vec![
                FunctionDef::new("helper", Vec::<String>::new(), vec![]),
                FunctionDef::new(
                    "main",
                    Vec::<String>::new(),
                    vec![Stmt::ret(Expr::call("helper", vec![]))],
                ),
            ],
        )
        .with_namespace(["app"]);
        let program = compile_units(&[root, nested], &[]).expect("compile");
        let target = program.instructions.iter().find_map(|instruction| match instruction {
            Instruction::CallFunction { target, .. } => Some(target.clone()),
            _ => None,
        });
        assert_eq!(
            target,
            Some(FunctionRef::new(vec!["app".into()], "helper"))
        );
    }

    #[test]
    fn actions_become_synthetic_functions_with_carrier() {
        let program = compile(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![
                Stmt::let_("total", Expr::int(0)),
                Stmt::let_(
                    "add",
                    Expr::action(
                        vec!["n"],
                        vec![Stmt::assign(
                            "total",
                            Expr::binary(BinaryOp::Add, Expr::var("total"), Expr::var("n")),
                        )],
                    ),
                ),
            ],
        )]);
        let entry = program
            .lookup(&[], "main$action0")
            .expect("synthetic function");
        assert_eq!(entry.arity, 2);
        let body = &program.instructions[entry.offset..];
        // total = total + n  =>  carrier[0] = carrier[0] + n
        assert_eq!(body[2], Instruction::LoadLocal(0));
        assert_eq!(body[3], Instruction::PushConst(Constant::Int(0)));
        assert_eq!(body[4], Instruction::LoadLocal(0));
        assert_eq!(body[5], Instruction::PushConst(Constant::Int(0)));
        assert_eq!(body[6], Instruction::LoadIndex);
        assert_eq!(body[7], Instruction::LoadLocal(1));
        assert_eq!(body[9], Instruction::StoreIndex);
    }

    #[test]
    fn every_jump_target_is_patched_and_in_range() {
        let program = compile(vec![FunctionDef::new(
            "main",
            vec!["limit"],
            vec![
                Stmt::let_("i", Expr::int(0)),
                Stmt::while_(
                    Expr::bool(true),
                    vec![
                        Stmt::expr(Expr::if_else(
                            Expr::binary(BinaryOp::Gt, Expr::var("i"), Expr::var("limit")),
                            vec![Stmt::Break],
                            None,
                        )),
                        Stmt::assign("i", Expr::binary(BinaryOp::Add, Expr::var("i"), Expr::int(1))),
                    ],
                ),
                Stmt::For {
                    var: "k".into(),
                    start: Expr::int(0),
                    end: Expr::int(3),
                    step: None,
                    body: vec![Stmt::expr(Expr::binary(
                        BinaryOp::Or,
                        Expr::bool(false),
                        Expr::awaiting(Expr::array(vec![Expr::int(1)])),
                    ))],
                },
                Stmt::ret(Expr::var("i")),
            ],
        )]);
        let len = program.instructions.len();
        for (index, instruction) in program.instructions.iter().enumerate() {
            if let Some(target) = instruction.jump_target() {
                assert!(target < len, "instruction {index} jumps to {target}");
            }
        }
    }

    #[test]
    fn break_drops_operands_of_unfinished_expressions() {
        // while true: n = n + if true then break end
        let program = compile(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![
                Stmt::let_("n", Expr::int(0)),
                Stmt::while_(
                    Expr::bool(true),
                    vec![Stmt::assign(
                        "n",
                        Expr::binary(
                            BinaryOp::Add,
                            Expr::var("n"),
                            Expr::if_else(Expr::bool(true), vec![Stmt::Break], None),
                        ),
                    )],
                ),
                Stmt::ret(Expr::var("n")),
            ],
        )]);
        let body = body_of(&program, "main");
        let breaks: Vec<usize> = body
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| matches!(pair, [Instruction::Pop, Instruction::Jump(_)]))
            .map(|(index, _)| index)
            .collect();
        assert_eq!(breaks.len(), 1);
        assert!(!matches!(body[breaks[0] - 1], Instruction::Pop));
    }

    #[test]
    fn numeric_for_checks_the_step_before_storing_it() {
        let program = compile(vec![FunctionDef::new(
            "main",
            vec!["step"],
            vec![Stmt::For {
                var: "i".into(),
                start: Expr::int(0),
                end: Expr::int(3),
                step: Some(Expr::var("step")),
                body: Vec::new(),
            }],
        )]);
        let body = body_of(&program, "main");
        let check = body
            .iter()
            .position(|i| *i == Instruction::CheckStep)
            .expect("step check");
        assert_eq!(body[check - 1], Instruction::LoadLocal(0));
        assert!(matches!(body[check + 1], Instruction::StoreLocal(_)));
    }

    #[test]
    fn static_access_on_unbound_names() {
        let program = compile(vec![FunctionDef::new(
            "main",
            Vec::<String>::new(),
            vec![Stmt::ret(Expr::method(
                Expr::var("Math"),
                "max",
                vec![Expr::field(Expr::var("Math"), "pi"), Expr::int(1)],
            ))],
        )]);
        let body = body_of(&program, "main");
        assert!(body.iter().any(|i| matches!(
            i,
            Instruction::LoadStatic { type_name, member, bound: false } if type_name == "Math" && member == "pi"
        )));
        assert!(body.iter().any(|i| matches!(
            i,
            Instruction::CallStatic { type_name, name, argc: 2, .. } if type_name == "Math" && name == "max"
        )));
    }
}

//=====================================================
// End of file
//=====================================================
