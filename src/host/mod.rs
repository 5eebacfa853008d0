//=====================================================
// File: host/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Host capability registry
// Objective: Register host functions, host types, and global values; resolve calls by
//            runtime argument types and invoke the selected callable
//=====================================================

pub mod overload;
pub mod stdlib;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use anyhow::anyhow;

use crate::ast::BinaryOp;
use crate::error::RuntimeFault;
use crate::vm::instruction::HostFunctionRef;
use crate::vm::value::Value;

pub use overload::{MatchCategory, ParamMatch, Resolved, TypeHierarchy};

/// Declared type of a host parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Untyped parameter; accepts anything at the lowest priority.
    Any,
    Named(String),
    Nullable(Box<TypeRef>),
    /// Generic type parameter, bound from the argument at call time.
    Generic(String),
    Instance {
        base: String,
        args: Vec<TypeRef>,
    },
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    pub fn int() -> Self {
        TypeRef::named("int")
    }

    pub fn float() -> Self {
        TypeRef::named("float")
    }

    pub fn string() -> Self {
        TypeRef::named("string")
    }

    pub fn bool() -> Self {
        TypeRef::named("bool")
    }

    pub fn array() -> Self {
        TypeRef::named("array")
    }

    pub fn nullable(inner: TypeRef) -> Self {
        TypeRef::Nullable(Box::new(inner))
    }

    pub fn generic(name: impl Into<String>) -> Self {
        TypeRef::Generic(name.into())
    }

    pub fn instance(base: impl Into<String>, args: Vec<TypeRef>) -> Self {
        TypeRef::Instance {
            base: base.into(),
            args,
        }
    }

    /// Name of the outermost concrete type, if any.
    pub fn base_name(&self) -> Option<&str> {
        match self {
            TypeRef::Named(name) => Some(name),
            TypeRef::Instance { base, .. } => Some(base),
            TypeRef::Nullable(inner) => inner.base_name(),
            TypeRef::Any | TypeRef::Generic(_) => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Any => f.write_str("any"),
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::Nullable(inner) => write!(f, "{inner}?"),
            TypeRef::Generic(name) => write!(f, "'{name}"),
            TypeRef::Instance { base, args } => {
                write!(f, "{base}<")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(">")
            }
        }
    }
}

/// Arguments handed to a host callable after overload resolution.
#[derive(Debug, Clone, Default)]
pub struct HostCall {
    pub args: Vec<Value>,
    pub type_args: BTreeMap<String, TypeRef>,
}

impl HostCall {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            type_args: BTreeMap::new(),
        }
    }

    pub fn arg(&self, index: usize) -> anyhow::Result<&Value> {
        self.args
            .get(index)
            .ok_or_else(|| anyhow!("missing argument {index}"))
    }

    /// True when the caller omitted this optional argument.
    pub fn is_default(&self, index: usize) -> bool {
        matches!(self.args.get(index), None | Some(Value::UseDefault))
    }

    pub fn int(&self, index: usize) -> anyhow::Result<i64> {
        let value = self.arg(index)?;
        value
            .as_int()
            .ok_or_else(|| anyhow!("argument {index} must be int, found {}", value.type_name()))
    }

    pub fn float(&self, index: usize) -> anyhow::Result<f64> {
        let value = self.arg(index)?;
        value
            .as_float()
            .ok_or_else(|| anyhow!("argument {index} must be float, found {}", value.type_name()))
    }

    pub fn string(&self, index: usize) -> anyhow::Result<&str> {
        let value = self.arg(index)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("argument {index} must be string, found {}", value.type_name()))
    }

    pub fn object(&self, index: usize) -> anyhow::Result<&Rc<HostObject>> {
        match self.arg(index)? {
            Value::Object(object) => Ok(object),
            other => Err(anyhow!(
                "argument {index} must be an object, found {}",
                other.type_name()
            )),
        }
    }

    pub fn type_arg(&self, name: &str) -> Option<&TypeRef> {
        self.type_args.get(name)
    }
}

pub type HostCallable = Rc<dyn Fn(&HostCall) -> anyhow::Result<Value>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostParam {
    pub ty: TypeRef,
    pub optional: bool,
}

/// One host function overload.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    params: Vec<HostParam>,
    callable: HostCallable,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, params: Vec<TypeRef>, callable: F) -> Self
    where
        F: Fn(&HostCall) -> anyhow::Result<Value> + 'static,
    {
        Self {
            name: name.into(),
            params: params
                .into_iter()
                .map(|ty| HostParam {
                    ty,
                    optional: false,
                })
                .collect(),
            callable: Rc::new(callable),
        }
    }

    /// Appends a trailing optional parameter.
    pub fn with_optional(mut self, ty: TypeRef) -> Self {
        self.params.push(HostParam { ty, optional: true });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[HostParam] {
        &self.params
    }

    pub fn required(&self) -> usize {
        self.params.iter().take_while(|param| !param.optional).count()
    }

    pub fn signature(&self) -> Vec<TypeRef> {
        self.params.iter().map(|param| param.ty.clone()).collect()
    }

    pub fn reference(&self) -> HostFunctionRef {
        HostFunctionRef::new(self.name.clone(), self.signature())
    }

    pub fn describe(&self) -> String {
        self.reference().to_string()
    }

    pub fn call(&self, call: &HostCall) -> anyhow::Result<Value> {
        (self.callable)(call)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Instance of a host type as seen by scripts.
pub struct HostObject {
    type_name: String,
    type_args: Vec<TypeRef>,
    fields: RefCell<BTreeMap<String, Value>>,
    payload: Option<Rc<dyn Any>>,
}

impl HostObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            type_args: Vec::new(),
            fields: RefCell::new(BTreeMap::new()),
            payload: None,
        }
    }

    pub fn with_type_args(mut self, args: Vec<TypeRef>) -> Self {
        self.type_args = args;
        self
    }

    pub fn with_field(self, name: impl Into<String>, value: Value) -> Self {
        self.fields.borrow_mut().insert(name.into(), value);
        self
    }

    /// Attaches native state reachable from host callables.
    pub fn with_payload<T: Any>(mut self, payload: T) -> Self {
        self.payload = Some(Rc::new(payload));
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn type_args(&self) -> &[TypeRef] {
        &self.type_args
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields.borrow().get(name).cloned()
    }

    /// Overwrites an existing field; returns false when the field does not exist.
    pub fn set_field(&self, name: &str, value: Value) -> bool {
        match self.fields.borrow_mut().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type_name", &self.type_name)
            .field("fields", &self.fields.borrow())
            .finish()
    }
}

/// Host type descriptor: static members, instance methods, indexer, and operators.
/// Instance methods take the receiver as their first parameter.
#[derive(Debug, Clone, Default)]
pub struct HostType {
    name: String,
    base: Option<TypeRef>,
    generics: Vec<String>,
    static_fields: BTreeMap<String, Value>,
    static_functions: BTreeMap<String, Vec<Rc<HostFunction>>>,
    methods: BTreeMap<String, Vec<Rc<HostFunction>>>,
    private_members: BTreeSet<String>,
    indexer_get: Option<Rc<HostFunction>>,
    indexer_set: Option<Rc<HostFunction>>,
    operators: Vec<(BinaryOp, Rc<HostFunction>)>,
}

impl HostType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_base(mut self, base: TypeRef) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_generics<S: Into<String>>(mut self, generics: Vec<S>) -> Self {
        self.generics = generics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_static_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.static_fields.insert(name.into(), value);
        self
    }

    pub fn with_static_function(mut self, function: HostFunction) -> Self {
        self.static_functions
            .entry(function.name().to_string())
            .or_default()
            .push(Rc::new(function));
        self
    }

    pub fn with_method(mut self, function: HostFunction) -> Self {
        self.methods
            .entry(function.name().to_string())
            .or_default()
            .push(Rc::new(function));
        self
    }

    pub fn with_private(mut self, member: impl Into<String>) -> Self {
        self.private_members.insert(member.into());
        self
    }

    /// `get` takes (receiver, index); `set` takes (receiver, index, value).
    pub fn with_indexer(mut self, get: HostFunction, set: Option<HostFunction>) -> Self {
        self.indexer_get = Some(Rc::new(get));
        self.indexer_set = set.map(Rc::new);
        self
    }

    pub fn with_operator(mut self, op: BinaryOp, function: HostFunction) -> Self {
        self.operators.push((op, Rc::new(function)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&TypeRef> {
        self.base.as_ref()
    }

    pub fn generics(&self) -> &[String] {
        &self.generics
    }

    pub fn static_field(&self, name: &str) -> Option<Value> {
        self.static_fields.get(name).cloned()
    }

    pub fn static_functions(&self, name: &str) -> &[Rc<HostFunction>] {
        self.static_functions
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn methods(&self, name: &str) -> &[Rc<HostFunction>] {
        self.methods.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_private(&self, member: &str) -> bool {
        self.private_members.contains(member)
    }
}

pub type GlobalCell = Rc<RefCell<Value>>;

/// Registry of everything the host exposes to scripts. One registry is owned by one
/// embedding context; lookups clone the descriptor out so callables may re-enter it.
#[derive(Default)]
pub struct HostRegistry {
    functions: RefCell<BTreeMap<String, Vec<Rc<HostFunction>>>>,
    types: RefCell<BTreeMap<String, Rc<HostType>>>,
    globals: RefCell<BTreeMap<String, GlobalCell>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&self, function: HostFunction) {
        tracing::debug!(function = %function.describe(), "registered host function");
        self.functions
            .borrow_mut()
            .entry(function.name().to_string())
            .or_default()
            .push(Rc::new(function));
    }

    pub fn register_type(&self, ty: HostType) {
        tracing::debug!(host_type = ty.name(), "registered host type");
        self.types
            .borrow_mut()
            .insert(ty.name().to_string(), Rc::new(ty));
    }

    /// Registers a global; re-registering an existing name updates its cell in place.
    pub fn register_global(&self, name: impl Into<String>, value: Value) -> GlobalCell {
        let name = name.into();
        let mut globals = self.globals.borrow_mut();
        if let Some(cell) = globals.get(&name) {
            *cell.borrow_mut() = value;
            return Rc::clone(cell);
        }
        let cell = Rc::new(RefCell::new(value));
        globals.insert(name, Rc::clone(&cell));
        cell
    }

    pub fn set_global(&self, name: &str, value: Value) -> bool {
        match self.global_cell(name) {
            Some(cell) => {
                *cell.borrow_mut() = value;
                true
            }
            None => false,
        }
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.global_cell(name).map(|cell| cell.borrow().clone())
    }

    pub fn global_cell(&self, name: &str) -> Option<GlobalCell> {
        self.globals.borrow().get(name).cloned()
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals.borrow().keys().cloned().collect()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.borrow().contains_key(name)
    }

    pub fn functions(&self, name: &str) -> Vec<Rc<HostFunction>> {
        self.functions
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn function_by_signature(&self, name: &str, signature: &[TypeRef]) -> Option<Rc<HostFunction>> {
        self.functions
            .borrow()
            .get(name)?
            .iter()
            .find(|function| function.signature() == signature)
            .cloned()
    }

    /// The descriptor with `signature`, provided it is still the only one named `name`.
    pub fn sole_function(&self, name: &str, signature: &[TypeRef]) -> Option<Rc<HostFunction>> {
        match self.functions.borrow().get(name)?.as_slice() {
            [only] if only.signature() == signature => Some(Rc::clone(only)),
            _ => None,
        }
    }

    pub fn type_named(&self, name: &str) -> Option<Rc<HostType>> {
        self.types.borrow().get(name).cloned()
    }

    /// The type and its registered ancestors, nearest first.
    fn lineage(&self, type_name: &str) -> Vec<Rc<HostType>> {
        let mut lineage = Vec::new();
        let mut next = self.type_named(type_name);
        while let Some(ty) = next {
            if lineage.iter().any(|seen: &Rc<HostType>| seen.name() == ty.name()) {
                break;
            }
            next = ty
                .base()
                .and_then(TypeRef::base_name)
                .and_then(|base| self.type_named(base));
            lineage.push(ty);
        }
        lineage
    }

    /// Methods named `name` along the receiver type's base chain, derived types first.
    pub fn methods(&self, type_name: &str, name: &str) -> Vec<Rc<HostFunction>> {
        self.lineage(type_name)
            .iter()
            .flat_map(|ty| ty.methods(name).iter().cloned())
            .collect()
    }

    pub fn is_private(&self, type_name: &str, member: &str) -> bool {
        self.lineage(type_name).iter().any(|ty| ty.is_private(member))
    }

    pub fn indexer(&self, type_name: &str, setter: bool) -> Option<Rc<HostFunction>> {
        self.lineage(type_name).into_iter().find_map(|ty| {
            if setter {
                ty.indexer_set.clone()
            } else {
                ty.indexer_get.clone()
            }
        })
    }

    /// Operator overloads declared by either operand's type chain.
    pub fn operators(&self, op: BinaryOp, operands: &[&Value]) -> Vec<Rc<HostFunction>> {
        let mut found: Vec<Rc<HostFunction>> = Vec::new();
        for value in operands {
            let Value::Object(object) = value else {
                continue;
            };
            for ty in self.lineage(object.type_name()) {
                for (candidate_op, function) in &ty.operators {
                    if *candidate_op == op && !found.iter().any(|f| Rc::ptr_eq(f, function)) {
                        found.push(Rc::clone(function));
                    }
                }
            }
        }
        found
    }

    /// Resolves a free host function by name against runtime argument types.
    pub fn resolve_function(&self, name: &str, args: Vec<Value>) -> Result<Resolved, RuntimeFault> {
        let candidates = self.functions(name);
        if candidates.is_empty() {
            return Err(RuntimeFault::HostFunctionNotFound {
                name: name.to_string(),
            });
        }
        overload::resolve(name, &candidates, args, self)
    }

    pub fn invoke(&self, resolved: Resolved) -> Result<Value, RuntimeFault> {
        tracing::trace!(function = %resolved.function.describe(), "invoking host function");
        resolved
            .function
            .call(&resolved.call)
            .map_err(RuntimeFault::from_host)
    }
}

impl TypeHierarchy for HostRegistry {
    fn base_chain(&self, type_name: &str) -> Vec<TypeRef> {
        let mut chain = Vec::new();
        for ty in self.lineage(type_name) {
            if let Some(base) = ty.base() {
                chain.push(base.clone());
            }
        }
        chain
    }
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("functions", &self.functions.borrow().keys().collect::<Vec<_>>())
            .field("types", &self.types.borrow().keys().collect::<Vec<_>>())
            .field("globals", &self.globals.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape_registry() -> HostRegistry {
        let registry = HostRegistry::new();
        registry.register_type(
            HostType::new("Shape")
                .with_method(HostFunction::new(
                    "area",
                    vec![TypeRef::named("Shape")],
                    |_| Ok(Value::Int(0)),
                ))
                .with_private("secret"),
        );
        registry.register_type(HostType::new("Square").with_base(TypeRef::named("Shape")));
        registry
    }

    #[test]
    fn methods_are_inherited_along_the_base_chain() {
        let registry = shape_registry();
        assert_eq!(registry.methods("Square", "area").len(), 1);
        assert!(registry.methods("Square", "perimeter").is_empty());
        assert_eq!(registry.base_chain("Square"), vec![TypeRef::named("Shape")]);
    }

    #[test]
    fn private_members_are_inherited() {
        let registry = shape_registry();
        assert!(registry.is_private("Square", "secret"));
        assert!(!registry.is_private("Square", "area"));
    }

    #[test]
    fn base_cycles_terminate() {
        let registry = HostRegistry::new();
        registry.register_type(HostType::new("A").with_base(TypeRef::named("B")));
        registry.register_type(HostType::new("B").with_base(TypeRef::named("A")));
        assert_eq!(registry.base_chain("A").len(), 2);
    }

    #[test]
    fn globals_update_in_place() {
        let registry = HostRegistry::new();
        let cell = registry.register_global("score", Value::Int(1));
        registry.register_global("score", Value::Int(2));
        assert_eq!(*cell.borrow(), Value::Int(2));
        assert!(registry.set_global("score", Value::Int(3)));
        assert_eq!(registry.global("score"), Some(Value::Int(3)));
        assert!(!registry.set_global("missing", Value::Unit));
    }

    #[test]
    fn unknown_function_is_reported() {
        let registry = HostRegistry::new();
        let error = registry
            .resolve_function("nope", vec![])
            .expect_err("missing function");
        assert_eq!(
            error,
            RuntimeFault::HostFunctionNotFound {
                name: "nope".into()
            }
        );
    }

    #[test]
    fn signature_lookup_distinguishes_overloads() {
        let registry = HostRegistry::new();
        registry.register_function(HostFunction::new("f", vec![TypeRef::int()], |_| {
            Ok(Value::Int(1))
        }));
        registry.register_function(HostFunction::new("f", vec![TypeRef::float()], |_| {
            Ok(Value::Int(2))
        }));
        let found = registry
            .function_by_signature("f", &[TypeRef::float()])
            .expect("float overload");
        assert_eq!(found.call(&HostCall::default()).expect("call"), Value::Int(2));
        assert!(registry.function_by_signature("f", &[TypeRef::string()]).is_none());
    }

    #[test]
    fn sole_function_lapses_once_overloaded() {
        let registry = HostRegistry::new();
        registry.register_function(HostFunction::new("g", vec![TypeRef::int()], |_| {
            Ok(Value::Unit)
        }));
        assert!(registry.sole_function("g", &[TypeRef::int()]).is_some());
        assert!(registry.sole_function("g", &[TypeRef::float()]).is_none());
        registry.register_function(HostFunction::new("g", vec![TypeRef::float()], |_| {
            Ok(Value::Unit)
        }));
        assert!(registry.sole_function("g", &[TypeRef::int()]).is_none());
    }
}

//=====================================================
// End of file
//=====================================================
