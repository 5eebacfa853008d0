//=====================================================
// File: vm/value.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript runtime value model
// Objective: Dynamic values held on the engine stack, closures, host-backed
//            iterators, and the built-in arithmetic/comparison semantics
//=====================================================

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::ast::{BinaryOp, UnaryOp};
use crate::error::RuntimeFault;
use crate::host::{HostObject, TypeRef};
use crate::vm::instruction::FunctionRef;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(ArrayRef),
    Closure(Rc<Closure>),
    Iterator(Rc<RefCell<IteratorCell>>),
    Object(Rc<HostObject>),
    /// Fills omitted optional parameters of a host call.
    UseDefault,
}

/// Closure object: synthetic function plus the capture carrier shared by every invocation.
#[derive(Debug)]
pub struct Closure {
    pub function: FunctionRef,
    pub captures: ArrayRef,
}

/// Source of values for `await` and `for ... in`.
pub trait HostIterator {
    fn next_value(&mut self) -> anyhow::Result<Option<Value>>;
}

struct StdIterator<I>(I);

impl<I> HostIterator for StdIterator<I>
where
    I: Iterator<Item = Value>,
{
    fn next_value(&mut self) -> anyhow::Result<Option<Value>> {
        Ok(self.0.next())
    }
}

/// Live view over an array; elements pushed during iteration are visited.
struct ArrayIterator {
    items: ArrayRef,
    index: usize,
}

impl HostIterator for ArrayIterator {
    fn next_value(&mut self) -> anyhow::Result<Option<Value>> {
        let item = self.items.borrow().get(self.index).cloned();
        if item.is_some() {
            self.index += 1;
        }
        Ok(item)
    }
}

pub struct IteratorCell {
    source: Box<dyn HostIterator>,
    current: Value,
}

impl IteratorCell {
    pub fn new(source: Box<dyn HostIterator>) -> Self {
        Self {
            source,
            current: Value::Unit,
        }
    }

    pub fn move_next(&mut self) -> anyhow::Result<bool> {
        match self.source.next_value()? {
            Some(value) => {
                self.current = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn current(&self) -> Value {
        self.current.clone()
    }
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::Str(value.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(object: HostObject) -> Self {
        Value::Object(Rc::new(object))
    }

    /// Wraps any Rust iterator so scripts can `await` or loop over it.
    pub fn iterator<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: 'static,
    {
        Value::from_host_iterator(StdIterator(iter.into_iter()))
    }

    pub fn from_host_iterator(source: impl HostIterator + 'static) -> Self {
        Value::Iterator(Rc::new(RefCell::new(IteratorCell::new(Box::new(source)))))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Unit => "unit".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "string".into(),
            Value::Array(_) => "array".into(),
            Value::Closure(_) => "action".into(),
            Value::Iterator(_) => "iterator".into(),
            Value::Object(object) => object.type_name().to_string(),
            Value::UseDefault => "default".into(),
        }
    }

    /// Runtime type as seen by the overload resolver.
    pub fn runtime_type(&self) -> TypeRef {
        match self {
            Value::Object(object) if !object.type_args().is_empty() => TypeRef::Instance {
                base: object.type_name().to_string(),
                args: object.type_args().to_vec(),
            },
            other => TypeRef::Named(other.type_name()),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unit => false,
            Value::Bool(value) => *value,
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Produces an iterator for `await`/`for ... in`. Iterators are returned as-is so that
    /// their position is shared with the producer.
    pub fn to_iterator(&self) -> Result<Value, RuntimeFault> {
        match self {
            Value::Iterator(_) => Ok(self.clone()),
            Value::Array(items) => Ok(Value::from_host_iterator(ArrayIterator {
                items: Rc::clone(items),
                index: 0,
            })),
            Value::Str(text) => {
                let chars: Vec<Value> = text.chars().map(|c| Value::Str(c.to_string())).collect();
                Ok(Value::iterator(chars))
            }
            other => Err(RuntimeFault::NotIterable {
                type_name: other.type_name(),
            }),
        }
    }

    /// Built-in binary semantics. `None` means the operator is not defined for these
    /// operand types.
    pub fn binary(&self, op: BinaryOp, rhs: &Value) -> Option<Result<Value, RuntimeFault>> {
        use Value::*;

        let result = match (op, self, rhs) {
            (BinaryOp::Eq, lhs, rhs) => Ok(Bool(lhs == rhs)),
            (BinaryOp::Ne, lhs, rhs) => Ok(Bool(lhs != rhs)),
            (BinaryOp::And, Bool(a), Bool(b)) => Ok(Bool(*a && *b)),
            (BinaryOp::Or, Bool(a), Bool(b)) => Ok(Bool(*a || *b)),
            (BinaryOp::Add, Str(a), b) => Ok(Str(format!("{a}{b}"))),
            (BinaryOp::Add, a, Str(b)) if !matches!(a, Object(_)) => Ok(Str(format!("{a}{b}"))),
            (_, Int(a), Int(b)) => return int_binary(op, *a, *b),
            (_, Int(_) | Float(_), Int(_) | Float(_)) => {
                let a = self.as_float()?;
                let b = rhs.as_float()?;
                return float_binary(op, a, b);
            }
            (BinaryOp::Lt, Str(a), Str(b)) => Ok(Bool(a < b)),
            (BinaryOp::Le, Str(a), Str(b)) => Ok(Bool(a <= b)),
            (BinaryOp::Gt, Str(a), Str(b)) => Ok(Bool(a > b)),
            (BinaryOp::Ge, Str(a), Str(b)) => Ok(Bool(a >= b)),
            _ => return None,
        };
        Some(result)
    }

    pub fn unary(&self, op: UnaryOp) -> Option<Result<Value, RuntimeFault>> {
        match (op, self) {
            (UnaryOp::Neg, Value::Int(value)) => Some(
                value
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| RuntimeFault::unknown("integer overflow")),
            ),
            (UnaryOp::Neg, Value::Float(value)) => Some(Ok(Value::Float(-value))),
            (UnaryOp::Not, Value::Bool(value)) => Some(Ok(Value::Bool(!value))),
            _ => None,
        }
    }
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> Option<Result<Value, RuntimeFault>> {
    let overflow = || RuntimeFault::unknown(format!("integer overflow in {a} {op} {b}"));
    let result = match op {
        BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Div if b == 0 => Err(RuntimeFault::DivisionByZero),
        BinaryOp::Div => a.checked_div(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mod if b == 0 => Err(RuntimeFault::DivisionByZero),
        BinaryOp::Mod => a.checked_rem(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Lt => Ok(Value::Bool(a < b)),
        BinaryOp::Le => Ok(Value::Bool(a <= b)),
        BinaryOp::Gt => Ok(Value::Bool(a > b)),
        BinaryOp::Ge => Ok(Value::Bool(a >= b)),
        _ => return None,
    };
    Some(result)
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> Option<Result<Value, RuntimeFault>> {
    let value = match op {
        BinaryOp::Add => Value::Float(a + b),
        BinaryOp::Sub => Value::Float(a - b),
        BinaryOp::Mul => Value::Float(a * b),
        BinaryOp::Div => Value::Float(a / b),
        BinaryOp::Mod => Value::Float(a % b),
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        _ => return None,
    };
    Some(Ok(value))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) | (Value::UseDefault, Value::UseDefault) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

thread_local! {
    /// Arrays being formatted further up the current call chain.
    static FORMATTING: RefCell<Vec<*const RefCell<Vec<Value>>>> = const { RefCell::new(Vec::new()) };
}

/// Formats the elements of `items`, or `[...]` when the array contains itself.
fn fmt_array(
    items: &ArrayRef,
    f: &mut fmt::Formatter<'_>,
    body: impl FnOnce(&[Value], &mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    let array = Rc::as_ptr(items);
    if FORMATTING.with(|active| active.borrow().contains(&array)) {
        return f.write_str("[...]");
    }
    FORMATTING.with(|active| active.borrow_mut().push(array));
    let result = body(&items.borrow(), f);
    FORMATTING.with(|active| active.borrow_mut().pop());
    result
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("Unit"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value:?})"),
            Value::Str(value) => write!(f, "Str({value:?})"),
            Value::Array(items) => {
                fmt_array(items, f, |items, f| f.debug_list().entries(items).finish())
            }
            Value::Closure(closure) => write!(f, "Closure({})", closure.function),
            Value::Iterator(_) => f.write_str("Iterator"),
            Value::Object(object) => write!(f, "Object({})", object.type_name()),
            Value::UseDefault => f.write_str("UseDefault"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("unit"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => f.write_str(value),
            Value::Array(items) => fmt_array(items, f, |items, f| {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }),
            Value::Closure(closure) => write!(f, "<action {}>", closure.function),
            Value::Iterator(_) => f.write_str("<iterator>"),
            Value::Object(object) => write!(f, "<{}>", object.type_name()),
            Value::UseDefault => f.write_str("<default>"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}


//=====================================================
// End of file
//=====================================================
