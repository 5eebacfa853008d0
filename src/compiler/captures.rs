//=====================================================
// File: compiler/captures.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Free-variable analysis for action literals
// Objective: Collect names an action body references but does not bind itself,
//            in first-reference order, so they can become its capture list
//=====================================================

use std::collections::HashSet;

use crate::ast::{Expr, Stmt};

/// Names referenced inside an action body that are not bound by its parameters or by
/// its own `let`/loop bindings. Call targets are included since a closure-valued
/// variable can be called by name; the caller filters out names the enclosing
/// function does not bind.
pub fn free_variables(params: &[String], body: &[Stmt]) -> Vec<String> {
    let mut collector = FreeVariableCollector {
        scopes: vec![params.iter().cloned().collect()],
        found: Vec::new(),
    };
    collector.visit_block(body);
    collector.found
}

struct FreeVariableCollector {
    scopes: Vec<HashSet<String>>,
    found: Vec<String>,
}

impl FreeVariableCollector {
    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(name))
    }

    fn reference(&mut self, name: &str) {
        if !self.is_bound(name) && !self.found.iter().any(|found| found == name) {
            self.found.push(name.to_string());
        }
    }

    fn declare(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn visit_block(&mut self, body: &[Stmt]) {
        self.scopes.push(HashSet::new());
        for stmt in body {
            self.visit_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn visit_scoped(&mut self, var: &str, body: &[Stmt]) {
        self.scopes.push(HashSet::from([var.to_string()]));
        self.visit_block(body);
        self.scopes.pop();
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Let { name, value } => {
                self.visit_expr(value);
                self.declare(name);
            }
            Stmt::Assign { name, value } => {
                self.reference(name);
                self.visit_expr(value);
            }
            Stmt::FieldAssign { target, value, .. } => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            Stmt::IndexAssign {
                target,
                index,
                value,
            } => {
                self.visit_expr(target);
                self.visit_expr(index);
                self.visit_expr(value);
            }
            Stmt::While { cond, body } => {
                self.visit_expr(cond);
                self.visit_block(body);
            }
            Stmt::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                self.visit_expr(start);
                self.visit_expr(end);
                if let Some(step) = step {
                    self.visit_expr(step);
                }
                self.visit_scoped(var, body);
            }
            Stmt::ForEach {
                var,
                iterable,
                body,
            } => {
                self.visit_expr(iterable);
                self.visit_scoped(var, body);
            }
            Stmt::Break => {}
            Stmt::Yield(value) | Stmt::Return(value) => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            Stmt::Expr(expr) => self.visit_expr(expr),
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Variable(name) => self.reference(name),
            Expr::Binary { lhs, rhs, .. } => {
                self.visit_expr(lhs);
                self.visit_expr(rhs);
            }
            Expr::Unary { operand, .. } => self.visit_expr(operand),
            Expr::Call {
                namespace,
                name,
                args,
            } => {
                if namespace.is_empty() {
                    self.reference(name);
                }
                self.visit_all(args);
            }
            Expr::MethodCall { receiver, args, .. } => {
                self.visit_expr(receiver);
                self.visit_all(args);
            }
            Expr::Invoke { callee, args } => {
                self.visit_expr(callee);
                self.visit_all(args);
            }
            Expr::Field { target, .. } => self.visit_expr(target),
            Expr::Index { target, index } => {
                self.visit_expr(target);
                self.visit_expr(index);
            }
            Expr::If {
                cond,
                then_body,
                else_body,
            } => {
                self.visit_expr(cond);
                self.visit_block(then_body);
                if let Some(else_body) = else_body {
                    self.visit_block(else_body);
                }
            }
            Expr::Action { params, body } => {
                // A nested action needs whatever it captures to be reachable here too.
                for name in free_variables(params, body) {
                    self.reference(&name);
                }
            }
            Expr::Array(items) => self.visit_all(items),
            Expr::Await(inner) => self.visit_expr(inner),
        }
    }

    fn visit_all(&mut self, exprs: &[Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOp;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parameters_and_lets_are_not_free() {
        let body = vec![
            Stmt::let_("local", Expr::var("outer")),
            Stmt::ret(Expr::binary(
                BinaryOp::Add,
                Expr::var("local"),
                Expr::binary(BinaryOp::Mul, Expr::var("x"), Expr::var("factor")),
            )),
        ];
        assert_eq!(
            free_variables(&names(&["x"]), &body),
            names(&["outer", "factor"])
        );
    }

    #[test]
    fn assignment_targets_are_free_and_deduplicated() {
        let body = vec![
            Stmt::assign("count", Expr::binary(BinaryOp::Add, Expr::var("count"), Expr::int(1))),
            Stmt::ret(Expr::var("count")),
        ];
        assert_eq!(free_variables(&[], &body), names(&["count"]));
    }

    #[test]
    fn loop_variables_are_scoped_to_the_loop() {
        let body = vec![
            Stmt::ForEach {
                var: "item".into(),
                iterable: Expr::var("items"),
                body: vec![Stmt::expr(Expr::call("print", vec![Expr::var("item")]))],
            },
            Stmt::ret(Expr::var("item")),
        ];
        assert_eq!(
            free_variables(&[], &body),
            names(&["items", "print", "item"])
        );
    }

    #[test]
    fn nested_actions_propagate_their_captures() {
        let inner = Expr::action(vec!["y"], vec![Stmt::ret(Expr::binary(
            BinaryOp::Add,
            Expr::var("y"),
            Expr::var("z"),
        ))]);
        let body = vec![Stmt::let_("z", Expr::int(1)), Stmt::ret(inner.clone())];
        assert!(free_variables(&[], &body).is_empty());
        assert_eq!(free_variables(&[], &[Stmt::ret(inner)]), names(&["z"]));
    }
}

//=====================================================
// End of file
//=====================================================
