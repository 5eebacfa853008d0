//=====================================================
// File: vm/stack.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Fixed-capacity value stack
// Objective: Shared value array addressed by frame-relative and absolute slots;
//            exceeding the capacity is a fault rather than growth
//=====================================================

use crate::error::RuntimeFault;
use crate::vm::value::Value;

/// Value stack with a hard capacity fixed at construction.
///
/// Storage is reserved lazily up to a small initial size so that engines with a large
/// configured capacity stay cheap to create, but the capacity check is always enforced.
#[derive(Debug)]
pub struct ValueStack {
    items: Vec<Value>,
    capacity: usize,
}

impl ValueStack {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeFault> {
        if self.items.len() >= self.capacity {
            return Err(RuntimeFault::StackOverflow {
                capacity: self.capacity,
            });
        }
        self.items.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, RuntimeFault> {
        self.items
            .pop()
            .ok_or_else(|| RuntimeFault::unknown("value stack underflow"))
    }

    /// Pops `count` values, returned in push order.
    pub fn pop_many(&mut self, count: usize) -> Result<Vec<Value>, RuntimeFault> {
        if count > self.items.len() {
            return Err(RuntimeFault::unknown("value stack underflow"));
        }
        let start = self.items.len() - count;
        Ok(self.items.split_off(start))
    }

    #[inline]
    pub fn peek(&self) -> Result<&Value, RuntimeFault> {
        self.items
            .last()
            .ok_or_else(|| RuntimeFault::unknown("value stack underflow"))
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Result<&Value, RuntimeFault> {
        self.items
            .get(slot)
            .ok_or_else(|| RuntimeFault::unknown(format!("slot {slot} is outside the stack")))
    }

    #[inline]
    pub fn set(&mut self, slot: usize, value: Value) -> Result<(), RuntimeFault> {
        let entry = self
            .items
            .get_mut(slot)
            .ok_or_else(|| RuntimeFault::unknown(format!("slot {slot} is outside the stack")))?;
        *entry = value;
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}


//=====================================================
// End of file
//=====================================================
