//=====================================================
// File: host/stdlib.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Default MarineScript host library
// Objective: Register printing, conversion, collection and math functions as
//            overloaded host functions
//=====================================================

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use anyhow::{anyhow, bail};

use crate::host::{HostCall, HostFunction, HostRegistry, TypeRef};
use crate::vm::value::Value;

pub type SharedWriter = Rc<RefCell<dyn Write>>;

/// Registers the default library, printing to stdout.
pub fn register_stdlib(registry: &HostRegistry) {
    register_with_writer(registry, Rc::new(RefCell::new(std::io::stdout())));
}

/// Registers the default library with `print`/`println` writing to `writer`.
pub fn register_with_writer(registry: &HostRegistry, writer: SharedWriter) {
    register_io(registry, writer);
    register_collections(registry);
    register_math(registry);
}

fn register_io(registry: &HostRegistry, writer: SharedWriter) {
    let out = Rc::clone(&writer);
    registry.register_function(HostFunction::new("print", vec![TypeRef::Any], move |call| {
        write!(out.borrow_mut(), "{}", call.arg(0)?)?;
        Ok(Value::Unit)
    }));
    let out = writer;
    registry.register_function(HostFunction::new("println", vec![TypeRef::Any], move |call| {
        let mut out = out.borrow_mut();
        writeln!(out, "{}", call.arg(0)?)?;
        out.flush()?;
        Ok(Value::Unit)
    }));
    registry.register_function(HostFunction::new("to_string", vec![TypeRef::Any], |call| {
        Ok(Value::Str(call.arg(0)?.to_string()))
    }));
}

fn register_collections(registry: &HostRegistry) {
    registry.register_function(HostFunction::new("len", vec![TypeRef::string()], |call| {
        Ok(Value::Int(call.string(0)?.chars().count() as i64))
    }));
    registry.register_function(HostFunction::new("len", vec![TypeRef::array()], |call| {
        match call.arg(0)? {
            Value::Array(items) => Ok(Value::Int(items.borrow().len() as i64)),
            other => bail!("len expects an array, got {}", other.type_name()),
        }
    }));
    registry.register_function(HostFunction::new(
        "push",
        vec![TypeRef::array(), TypeRef::Any],
        |call| match call.arg(0)? {
            Value::Array(items) => {
                items.borrow_mut().push(call.arg(1)?.clone());
                Ok(Value::Int(items.borrow().len() as i64))
            }
            other => bail!("push expects an array, got {}", other.type_name()),
        },
    ));
    registry.register_function(HostFunction::new("range", vec![TypeRef::int()], |call| {
        Ok(int_range(0, call.int(0)?, 1))
    }));
    registry.register_function(
        HostFunction::new("range", vec![TypeRef::int(), TypeRef::int()], |call| {
            let step = if call.is_default(2) { 1 } else { call.int(2)? };
            if step == 0 {
                bail!("range step must not be zero");
            }
            Ok(int_range(call.int(0)?, call.int(1)?, step))
        })
        .with_optional(TypeRef::int()),
    );
}

/// Lazy half-open integer range.
fn int_range(start: i64, end: i64, step: i64) -> Value {
    let mut next = Some(start);
    Value::iterator(std::iter::from_fn(move || {
        let value = next?;
        let finished = if step > 0 { value >= end } else { value <= end };
        if finished {
            next = None;
            return None;
        }
        next = value.checked_add(step);
        Some(Value::Int(value))
    }))
}

fn register_math(registry: &HostRegistry) {
    registry.register_function(HostFunction::new("sqrt", vec![TypeRef::float()], |call| {
        let value = call.float(0)?;
        if value < 0.0 {
            bail!("sqrt of negative number {value}");
        }
        Ok(Value::Float(value.sqrt()))
    }));

    registry.register_function(HostFunction::new(
        "pow",
        vec![TypeRef::int(), TypeRef::int()],
        |call| {
            let base = call.int(0)?;
            let exponent = u32::try_from(call.int(1)?)
                .map_err(|_| anyhow!("pow exponent must be a non-negative int"))?;
            base.checked_pow(exponent)
                .map(Value::Int)
                .ok_or_else(|| anyhow!("integer overflow in pow({base}, {exponent})"))
        },
    ));
    registry.register_function(HostFunction::new(
        "pow",
        vec![TypeRef::float(), TypeRef::float()],
        |call| Ok(Value::Float(call.float(0)?.powf(call.float(1)?))),
    ));

    registry.register_function(HostFunction::new("abs", vec![TypeRef::int()], |call| {
        let value = call.int(0)?;
        value
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| anyhow!("integer overflow in abs({value})"))
    }));
    registry.register_function(HostFunction::new("abs", vec![TypeRef::float()], |call| {
        Ok(Value::Float(call.float(0)?.abs()))
    }));

    for (name, pick_int, pick_float) in [
        ("min", i64::min as fn(i64, i64) -> i64, f64::min as fn(f64, f64) -> f64),
        ("max", i64::max, f64::max),
    ] {
        registry.register_function(HostFunction::new(
            name,
            vec![TypeRef::int(), TypeRef::int()],
            move |call: &HostCall| Ok(Value::Int(pick_int(call.int(0)?, call.int(1)?))),
        ));
        registry.register_function(HostFunction::new(
            name,
            vec![TypeRef::float(), TypeRef::float()],
            move |call: &HostCall| Ok(Value::Float(pick_float(call.float(0)?, call.float(1)?))),
        ));
    }
}


//=====================================================
// End of file
//=====================================================
