//=====================================================
// File: vm/program.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Compiled MarineIL program container
// Objective: Instruction list, hierarchical namespace table of function offsets,
//            compile-time global layout, and image metadata
//=====================================================

use std::collections::BTreeMap;

use crate::vm::instruction::Instruction;

/// Location and arity of a compiled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionEntry {
    pub offset: usize,
    pub arity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceNode {
    pub functions: BTreeMap<String, FunctionEntry>,
    pub children: BTreeMap<String, NamespaceNode>,
}

impl NamespaceNode {
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.children.is_empty()
    }
}

/// Tree of namespace nodes, each mapping function names to instruction offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceTable {
    root: NamespaceNode,
}

impl NamespaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_root(root: NamespaceNode) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &NamespaceNode {
        &self.root
    }

    /// Inserts a function; returns the previous entry when the name was already taken.
    pub fn insert(
        &mut self,
        path: &[String],
        name: &str,
        entry: FunctionEntry,
    ) -> Option<FunctionEntry> {
        let mut node = &mut self.root;
        for segment in path {
            node = node.children.entry(segment.clone()).or_default();
        }
        node.functions.insert(name.to_string(), entry)
    }

    pub fn node(&self, path: &[String]) -> Option<&NamespaceNode> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    pub fn lookup(&self, path: &[String], name: &str) -> Option<FunctionEntry> {
        self.node(path)?.functions.get(name).copied()
    }

    pub fn contains(&self, path: &[String], name: &str) -> bool {
        self.lookup(path, name).is_some()
    }

    /// Every function with its namespace path, in namespace order.
    pub fn functions(&self) -> Vec<(Vec<String>, String, FunctionEntry)> {
        let mut out = Vec::new();
        let mut pending = vec![(Vec::new(), &self.root)];
        while let Some((path, node)) = pending.pop() {
            for (name, entry) in &node.functions {
                out.push((path.clone(), name.clone(), *entry));
            }
            for (segment, child) in node.children.iter().rev() {
                let mut child_path = path.clone();
                child_path.push(segment.clone());
                pending.push((child_path, child));
            }
        }
        out
    }

    /// Name of the function whose body contains `offset`.
    pub fn function_at(&self, offset: usize) -> Option<(Vec<String>, String)> {
        self.functions()
            .into_iter()
            .filter(|(_, _, entry)| entry.offset <= offset)
            .max_by_key(|(_, _, entry)| entry.offset)
            .map(|(path, name, _)| (path, name))
    }
}

/// Output of one compile pass over all loaded program units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledProgram {
    pub instructions: Vec<Instruction>,
    pub namespaces: NamespaceTable,
    /// Global names in absolute slot order.
    pub globals: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl CompiledProgram {
    pub fn lookup(&self, path: &[String], name: &str) -> Option<FunctionEntry> {
        self.namespaces.lookup(path, name)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}


//=====================================================
// End of file
//=====================================================
