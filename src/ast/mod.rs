use serde::{Deserialize, Serialize};

pub mod source_map;
pub use source_map::SourceMap;

/// Name given to the implicit top-level function.
pub const TOP_FUNCTION_NAME: &str = "<top>";

// ---- Span infrastructure ----

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub const UNKNOWN: Span = Span { start: 0, end: 0 };

    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Wraps a node with its source span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    #[serde(default)]
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned { node, span }
    }

    pub fn unknown(node: T) -> Self {
        Spanned { node, span: Span::UNKNOWN }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl<T> std::ops::Deref for Spanned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.node
    }
}

// ---- Core AST types ----

/// Value types of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Void,
    Int,
    Double,
    String,
}

impl VarType {
    pub fn name(self) -> &'static str {
        match self {
            VarType::Void => "void",
            VarType::Int => "int",
            VarType::Double => "double",
            VarType::String => "string",
        }
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed name: function parameter or block variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: VarType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: VarType) -> Self {
        Param { name: name.into(), ty }
    }
}

/// `function <return_type> name(params) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    pub return_type: VarType,
    pub body: Block,
    #[serde(default)]
    pub span: Span,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, params: Vec<Param>, return_type: VarType, body: Block) -> Self {
        FunctionDecl { name: name.into(), params, return_type, body, span: Span::UNKNOWN }
    }

    /// Symbol name if the body is exactly one native-call marker.
    pub fn native_symbol(&self) -> Option<&str> {
        match self.body.statements.as_slice() {
            [stmt] => match &stmt.node {
                StmtKind::NativeCall { symbol } => Some(symbol),
                _ => None,
            },
            _ => None,
        }
    }
}

/// One lexical scope: its variables and functions are declared up front.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub variables: Vec<Param>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
    #[serde(default)]
    pub statements: Vec<Stmt>,
}

impl Block {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Block { variables: Vec::new(), functions: Vec::new(), statements }
    }

    pub fn with_var(mut self, name: impl Into<String>, ty: VarType) -> Self {
        self.variables.push(Param::new(name, ty));
        self
    }

    pub fn with_function(mut self, function: FunctionDecl) -> Self {
        self.functions.push(function);
        self
    }
}

pub type Stmt = Spanned<StmtKind>;
pub type Expr = Spanned<ExprKind>;

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// Expression evaluated for its side effects
    Expr(Expr),

    /// `var = value`, `var += value`, `var -= value`
    Store { var: String, op: StoreOp, value: Expr },

    If {
        condition: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },

    While { condition: Expr, body: Block },

    /// `for (var in from..to)`, bounds inclusive
    For {
        var: String,
        from: Expr,
        to: Expr,
        body: Block,
    },

    Print(Vec<Expr>),

    Return(Option<Expr>),

    /// `native 'symbol';` as the sole body of a function
    NativeCall { symbol: String },
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Int(i64),
    Double(f64),
    Str(String),

    /// Variable reference
    Load(String),

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    Call { function: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitAnd,
    BitXor,
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Assign,
    Increment,
    Decrement,
}

/// A complete program: the top-level function and, optionally, its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub top: FunctionDecl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Program {
    /// Wraps a block as the body of the `<top>` function.
    pub fn new(body: Block) -> Self {
        Program {
            top: FunctionDecl::new(TOP_FUNCTION_NAME, Vec::new(), VarType::Void, body),
            source: None,
        }
    }
}

// ---- Construction helpers ----

impl Spanned<ExprKind> {
    pub fn int(value: i64) -> Expr {
        Spanned::unknown(ExprKind::Int(value))
    }

    pub fn double(value: f64) -> Expr {
        Spanned::unknown(ExprKind::Double(value))
    }

    pub fn string(value: impl Into<String>) -> Expr {
        Spanned::unknown(ExprKind::Str(value.into()))
    }

    pub fn load(name: impl Into<String>) -> Expr {
        Spanned::unknown(ExprKind::Load(name.into()))
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Spanned::unknown(ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) })
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Spanned::unknown(ExprKind::Unary { op, operand: Box::new(operand) })
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Expr {
        Spanned::unknown(ExprKind::Call { function: function.into(), args })
    }
}

impl Spanned<StmtKind> {
    pub fn expr(expr: Expr) -> Stmt {
        Spanned::unknown(StmtKind::Expr(expr))
    }

    pub fn assign(var: impl Into<String>, value: Expr) -> Stmt {
        Spanned::unknown(StmtKind::Store { var: var.into(), op: StoreOp::Assign, value })
    }

    pub fn store(var: impl Into<String>, op: StoreOp, value: Expr) -> Stmt {
        Spanned::unknown(StmtKind::Store { var: var.into(), op, value })
    }

    pub fn if_else(condition: Expr, then_block: Block, else_block: Option<Block>) -> Stmt {
        Spanned::unknown(StmtKind::If { condition, then_block, else_block })
    }

    pub fn while_loop(condition: Expr, body: Block) -> Stmt {
        Spanned::unknown(StmtKind::While { condition, body })
    }

    pub fn for_range(var: impl Into<String>, from: Expr, to: Expr, body: Block) -> Stmt {
        Spanned::unknown(StmtKind::For { var: var.into(), from, to, body })
    }

    pub fn print(args: Vec<Expr>) -> Stmt {
        Spanned::unknown(StmtKind::Print(args))
    }

    pub fn ret(value: Option<Expr>) -> Stmt {
        Spanned::unknown(StmtKind::Return(value))
    }

    pub fn native(symbol: impl Into<String>) -> Stmt {
        Spanned::unknown(StmtKind::NativeCall { symbol: symbol.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_unknown_is_zero() {
        assert_eq!(Span::UNKNOWN, Span { start: 0, end: 0 });
    }

    #[test]
    fn span_merge_takes_extremes() {
        let a = Span { start: 5, end: 10 };
        let b = Span { start: 2, end: 15 };
        assert_eq!(a.merge(b), Span { start: 2, end: 15 });
    }

    #[test]
    fn spanned_deref() {
        let s = Spanned::new(42, Span { start: 0, end: 2 });
        assert_eq!(*s, 42);
    }

    #[test]
    fn spanned_at_replaces_span() {
        let e = Expr::int(1).at(Span::new(3, 4));
        assert_eq!(e.span, Span::new(3, 4));
    }

    #[test]
    fn spanned_deserialize_without_span() {
        let s: Spanned<i32> = serde_json::from_str(r#"{"node":42}"#).unwrap();
        assert_eq!(s.node, 42);
        assert_eq!(s.span, Span::UNKNOWN);
    }

    #[test]
    fn var_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VarType::Double).unwrap(), "\"double\"");
        assert_eq!(VarType::String.to_string(), "string");
    }

    #[test]
    fn native_symbol_detects_marker_body() {
        let f = FunctionDecl::new(
            "labs",
            vec![Param::new("x", VarType::Int)],
            VarType::Int,
            Block::new(vec![Stmt::native("labs")]),
        );
        assert_eq!(f.native_symbol(), Some("labs"));

        let g = FunctionDecl::new("g", vec![], VarType::Void, Block::new(vec![
            Stmt::native("labs"),
            Stmt::ret(None),
        ]));
        assert_eq!(g.native_symbol(), None);
    }

    #[test]
    fn program_source_not_serialized_when_absent() {
        let prog = Program::new(Block::default());
        let json = serde_json::to_string(&prog).unwrap();
        assert!(!json.contains("source"));
        assert!(json.contains(TOP_FUNCTION_NAME));
    }

    #[test]
    fn program_json_round_trip_keeps_spans() {
        let mut prog = Program::new(Block::new(vec![
            Stmt::print(vec![Expr::int(7).at(Span::new(6, 7))]),
        ]));
        prog.source = Some("print(7);".to_string());
        let json = serde_json::to_string_pretty(&prog).unwrap();
        let back: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prog);
    }
}
