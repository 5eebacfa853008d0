//=====================================================
// File: ast.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: MarineScript Abstract Syntax Tree definitions
// Objective: Define the program, function, statement, and expression node kinds
//            handed to the compiler by the external MarineScript parser
//=====================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Line/column position inside a program unit's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: Position,
    pub end: Position,
}

impl SourceRange {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    pub fn lines(start: u32, end: u32) -> Self {
        Self {
            start: Position::new(start, 1),
            end: Position::new(end, 1),
        }
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}

/// One loaded source file: a namespace plus the functions it declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramUnit {
    pub name: String,
    #[serde(default)]
    pub namespace: Vec<String>,
    pub functions: Vec<FunctionDef>,
}

impl ProgramUnit {
    pub fn new(name: impl Into<String>, functions: Vec<FunctionDef>) -> Self {
        Self {
            name: name.into(),
            namespace: Vec::new(),
            functions,
        }
    }

    pub fn with_namespace<I, S>(mut self, namespace: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace = namespace.into_iter().map(Into::into).collect();
        self
    }

    /// Parses either a single unit object or an array of units.
    pub fn list_from_json(source: &str) -> serde_json::Result<Vec<ProgramUnit>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            Many(Vec<ProgramUnit>),
            One(ProgramUnit),
        }

        Ok(match serde_json::from_str(source)? {
            OneOrMany::Many(units) => units,
            OneOrMany::One(unit) => vec![unit],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub range: SourceRange,
}

impl FunctionDef {
    pub fn new<S: Into<String>>(name: impl Into<String>, params: Vec<S>, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            params: params.into_iter().map(Into::into).collect(),
            body,
            range: SourceRange::default(),
        }
    }

    pub fn with_range(mut self, range: SourceRange) -> Self {
        self.range = range;
        self
    }
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => f.write_str("-"),
            UnaryOp::Not => f.write_str("!"),
        }
    }
}

/// Statements in MarineScript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    FieldAssign {
        target: Expr,
        field: String,
        value: Expr,
    },
    IndexAssign {
        target: Expr,
        index: Expr,
        value: Expr,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// `for var = start, end[, step]`; the upper bound is inclusive.
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Vec<Stmt>,
    },
    ForEach {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Yield(Option<Expr>),
    Return(Option<Expr>),
    Expr(Expr),
}

/// Expressions in MarineScript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Literal),
    Variable(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// Call by (optionally namespaced) name: in-language function, closure variable,
    /// or host function.
    Call {
        #[serde(default)]
        namespace: Vec<String>,
        name: String,
        args: Vec<Expr>,
    },
    /// `receiver.name(args)`: instance method, or static member when `receiver`
    /// names a host type.
    MethodCall {
        receiver: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// Call of an arbitrary closure-valued expression.
    Invoke {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Field {
        target: Box<Expr>,
        name: String,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    /// Closure ("action") literal.
    Action {
        params: Vec<String>,
        body: Vec<Stmt>,
    },
    Array(Vec<Expr>),
    Await(Box<Expr>),
}

// Constructor helpers used by embedders and tests that build trees without the parser.
impl Expr {
    pub fn unit() -> Self {
        Expr::Literal(Literal::Unit)
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Literal::Bool(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(value.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            namespace: Vec::new(),
            name: name.into(),
            args,
        }
    }

    pub fn call_in<I, S>(namespace: I, name: impl Into<String>, args: Vec<Expr>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expr::Call {
            namespace: namespace.into_iter().map(Into::into).collect(),
            name: name.into(),
            args,
        }
    }

    pub fn method(receiver: Expr, name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::MethodCall {
            receiver: Box::new(receiver),
            name: name.into(),
            args,
        }
    }

    pub fn invoke(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::Invoke {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn field(target: Expr, name: impl Into<String>) -> Self {
        Expr::Field {
            target: Box::new(target),
            name: name.into(),
        }
    }

    pub fn index(target: Expr, index: Expr) -> Self {
        Expr::Index {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    pub fn if_else(cond: Expr, then_body: Vec<Stmt>, else_body: Option<Vec<Stmt>>) -> Self {
        Expr::If {
            cond: Box::new(cond),
            then_body,
            else_body,
        }
    }

    pub fn action<S: Into<String>>(params: Vec<S>, body: Vec<Stmt>) -> Self {
        Expr::Action {
            params: params.into_iter().map(Into::into).collect(),
            body,
        }
    }

    pub fn array(elements: Vec<Expr>) -> Self {
        Expr::Array(elements)
    }

    pub fn awaiting(expr: Expr) -> Self {
        Expr::Await(Box::new(expr))
    }
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            value,
        }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            name: name.into(),
            value,
        }
    }

    pub fn ret(value: Expr) -> Self {
        Stmt::Return(Some(value))
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr(expr)
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Self {
        Stmt::While { cond, body }
    }

    pub fn yield_(value: Expr) -> Self {
        Stmt::Yield(Some(value))
    }
}


//=====================================================
// End of file
//=====================================================
