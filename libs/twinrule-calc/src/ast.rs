//! Formula AST
//!
//! A single sum type for every node. Each node reports its [`ResultType`] and a
//! display [`priority`](Expr::priority) used when printing with minimal
//! parentheses; evaluation lives in [`crate::evaluator`].

use chrono::Duration;
use std::collections::BTreeSet;
use std::fmt;

/// Static result type of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultType {
    Number,
    Bool,
    Text,
    Duration,
    Timestamp,
    /// Known only at evaluation time (variables, member access, JSON)
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
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
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }

    /// Display priority; higher binds tighter
    pub fn priority(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
            BinaryOp::Pow => 7,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Named functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    All,
    Any,
    Count,
    Average,
    Min,
    Max,
    Sum,
    First,
    Stnd,
    Delta,
    Option,
    Exists,
    IfNan,
    If,
    Abs,
    Round,
    Clamp,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name.to_ascii_uppercase().as_str() {
            "ALL" => Function::All,
            "ANY" => Function::Any,
            "COUNT" => Function::Count,
            "AVERAGE" | "AVG" => Function::Average,
            "MIN" => Function::Min,
            "MAX" => Function::Max,
            "SUM" => Function::Sum,
            "FIRST" => Function::First,
            "STND" => Function::Stnd,
            "DELTA" => Function::Delta,
            "OPTION" => Function::Option,
            "EXISTS" => Function::Exists,
            "IFNAN" => Function::IfNan,
            "IF" => Function::If,
            "ABS" => Function::Abs,
            "ROUND" => Function::Round,
            "CLAMP" => Function::Clamp,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(self) -> &'static str {
        match self {
            Function::All => "ALL",
            Function::Any => "ANY",
            Function::Count => "COUNT",
            Function::Average => "AVERAGE",
            Function::Min => "MIN",
            Function::Max => "MAX",
            Function::Sum => "SUM",
            Function::First => "FIRST",
            Function::Stnd => "STND",
            Function::Delta => "DELTA",
            Function::Option => "OPTION",
            Function::Exists => "EXISTS",
            Function::IfNan => "IFNAN",
            Function::If => "IF",
            Function::Abs => "ABS",
            Function::Round => "ROUND",
            Function::Clamp => "CLAMP",
        }
    }

    /// Accepted argument count, inclusive
    pub fn arity(self) -> (usize, usize) {
        match self {
            Function::All
            | Function::Any
            | Function::Count
            | Function::Average
            | Function::Min
            | Function::Max
            | Function::Sum
            | Function::First
            | Function::Stnd
            | Function::Delta => (1, 3),
            Function::Option | Function::Exists => (1, usize::MAX),
            Function::IfNan => (2, 2),
            Function::If | Function::Clamp => (3, 3),
            Function::Abs => (1, 1),
            Function::Round => (1, 2),
        }
    }

    /// Reduces a sequence drawn from a single upstream input
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Function::All
                | Function::Any
                | Function::Count
                | Function::Average
                | Function::Min
                | Function::Max
                | Function::Sum
                | Function::First
                | Function::Stnd
        )
    }
}

/// A bracketed reference before binding
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// `[dtmi:...;N]`, resolved by walking the twin graph
    Model(String),
    /// `[anything-else]`: external id, twin id or sibling field id
    Id(String),
}

impl Reference {
    pub fn parse(inner: &str) -> Self {
        if inner.to_ascii_lowercase().starts_with("dtmi:") {
            Reference::Model(inner.to_string())
        } else {
            Reference::Id(inner.to_string())
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Reference::Model(s) | Reference::Id(s) => s,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.text())
    }
}

/// Formula expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Text(String),
    Duration(Duration),
    /// `NOW`, the evaluation timestamp
    Now,
    /// `this`, the rule's equipment or a calculated point's context twin
    This,
    /// Bare identifier: sibling parameter, rule element or built-in variable
    Variable(String),
    /// Bracketed reference awaiting binding
    Reference(Reference),
    /// A reference the binder resolved to a concrete source point
    Point(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Member {
        target: Box<Expr>,
        member: String,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

const PRIORITY_UNARY: u8 = 8;
const PRIORITY_POSTFIX: u8 = 9;
const PRIORITY_ATOM: u8 = 10;

impl Expr {
    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(function: Function, args: Vec<Expr>) -> Self {
        Expr::Call { function, args }
    }

    /// Display priority; higher binds tighter
    pub fn priority(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.priority(),
            Expr::Unary { .. } => PRIORITY_UNARY,
            Expr::Member { .. } => PRIORITY_POSTFIX,
            _ => PRIORITY_ATOM,
        }
    }

    pub fn result_type(&self) -> ResultType {
        match self {
            Expr::Number(_) => ResultType::Number,
            Expr::Bool(_) => ResultType::Bool,
            Expr::Text(_) => ResultType::Text,
            Expr::Duration(_) => ResultType::Duration,
            Expr::Now => ResultType::Timestamp,
            Expr::This
            | Expr::Variable(_)
            | Expr::Reference(_)
            | Expr::Point(_)
            | Expr::Member { .. } => ResultType::Dynamic,
            Expr::Unary { op: UnaryOp::Not, .. } => ResultType::Bool,
            Expr::Unary { op: UnaryOp::Neg, operand } => match operand.result_type() {
                ResultType::Duration => ResultType::Duration,
                _ => ResultType::Number,
            },
            Expr::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    return ResultType::Bool;
                }
                match (left.result_type(), right.result_type()) {
                    (ResultType::Text, ResultType::Text) if *op == BinaryOp::Add => ResultType::Text,
                    (ResultType::Duration, ResultType::Duration) => ResultType::Duration,
                    (ResultType::Timestamp, ResultType::Duration) => ResultType::Timestamp,
                    (ResultType::Timestamp, ResultType::Timestamp) => ResultType::Duration,
                    (ResultType::Dynamic, _) | (_, ResultType::Dynamic) => ResultType::Dynamic,
                    _ => ResultType::Number,
                }
            },
            Expr::Call { function, args } => match function {
                Function::All | Function::Any | Function::Exists => ResultType::Bool,
                Function::Option | Function::IfNan => common_type(args.iter()),
                Function::If => common_type(args.iter().skip(1)),
                _ => ResultType::Number,
            },
        }
    }

    /// Visit every node, parents first
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            },
            Expr::Member { target, .. } => target.walk(visit),
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            _ => {},
        }
    }

    /// Bare identifiers used anywhere in the tree
    pub fn variables(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Variable(name) = e {
                names.insert(name.clone());
            }
        });
        names
    }

    /// Resolved source points used anywhere in the tree
    pub fn points(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Point(id) = e {
                ids.insert(id.clone());
            }
        });
        ids
    }

    /// A variable that can keep its own history
    pub fn is_series_variable(&self) -> bool {
        matches!(self, Expr::Variable(_) | Expr::Point(_))
    }

    /// Every windowed call `FN(source, period[, offset])` in the tree
    ///
    /// Nested calls come before the calls that contain them.
    pub fn windows(&self) -> Vec<Window<'_>> {
        let mut windows = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Call { function, args } = e {
                let windowed = function.is_aggregate() || *function == Function::Delta;
                if let (true, Some(source), Some(period)) = (windowed, args.first(), args.get(1)) {
                    windows.push(Window {
                        source,
                        period: literal_duration(period),
                    });
                }
            }
        });
        windows.reverse();
        windows
    }

    /// Windowed sources that are not variables, deduplicated, nested first
    ///
    /// Each needs a history of its own, recorded before the enclosing
    /// formula is evaluated.
    pub fn windowed_arguments(&self) -> Vec<&Expr> {
        let mut seen = BTreeSet::new();
        self.windows()
            .into_iter()
            .map(|w| w.source)
            .filter(|source| !source.is_series_variable() && seen.insert(source.to_string()))
            .collect()
    }

    /// References still awaiting binding
    pub fn references(&self) -> BTreeSet<Reference> {
        let mut refs = BTreeSet::new();
        self.walk(&mut |e| {
            if let Expr::Reference(r) = e {
                refs.insert(r.clone());
            }
        });
        refs
    }

    /// Rebuild the tree top-down
    ///
    /// Where `rewrite` returns `Some`, that node replaces the original and its
    /// children are not visited.
    pub fn transform(&self, rewrite: &mut impl FnMut(&Expr) -> Option<Expr>) -> Expr {
        if let Some(replacement) = rewrite(self) {
            return replacement;
        }
        match self {
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.transform(rewrite)),
            },
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.transform(rewrite)),
                right: Box::new(right.transform(rewrite)),
            },
            Expr::Member { target, member } => Expr::Member {
                target: Box::new(target.transform(rewrite)),
                member: member.clone(),
            },
            Expr::Call { function, args } => Expr::Call {
                function: *function,
                args: args.iter().map(|a| a.transform(rewrite)).collect(),
            },
            leaf => leaf.clone(),
        }
    }
}

/// A windowed call found in a formula
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window<'a> {
    /// First argument, the series being reduced
    pub source: &'a Expr,
    /// Period when it is a duration literal
    pub period: Option<Duration>,
}

fn literal_duration(expr: &Expr) -> Option<Duration> {
    match expr {
        Expr::Duration(d) if *d < Duration::zero() => Some(-*d),
        Expr::Duration(d) => Some(*d),
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => literal_duration(operand),
        _ => None,
    }
}

fn common_type<'a>(mut exprs: impl Iterator<Item = &'a Expr>) -> ResultType {
    let Some(first) = exprs.next().map(Expr::result_type) else {
        return ResultType::Dynamic;
    };
    if exprs.all(|e| e.result_type() == first) {
        first
    } else {
        ResultType::Dynamic
    }
}

fn fmt_duration(d: &Duration, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ms = d.num_milliseconds();
    let (sign, ms) = if ms < 0 { ("-", -ms) } else { ("", ms) };
    for (unit, size) in [("w", 604_800_000), ("d", 86_400_000), ("h", 3_600_000), ("min", 60_000)] {
        if ms != 0 && ms % size == 0 {
            return write!(f, "{}{}{}", sign, ms / size, unit);
        }
    }
    if ms % 1000 == 0 {
        write!(f, "{}{}s", sign, ms / 1000)
    } else {
        write!(f, "{}{}s", sign, ms as f64 / 1000.0)
    }
}

/// Write `child`, parenthesized when it binds looser than `parent` allows
fn fmt_child(child: &Expr, min_priority: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if child.priority() < min_priority {
        write!(f, "({})", child)
    } else {
        write!(f, "{}", child)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Expr::Text(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Expr::Duration(d) => fmt_duration(d, f),
            Expr::Now => write!(f, "NOW"),
            Expr::This => write!(f, "this"),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Reference(r) => write!(f, "{}", r),
            Expr::Point(id) => write!(f, "[{}]", id),
            Expr::Unary { op, operand } => {
                let symbol = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                write!(f, "{}", symbol)?;
                fmt_child(operand, PRIORITY_UNARY, f)
            },
            Expr::Binary { op, left, right } => {
                let p = op.priority();
                // Pow is right-associative, everything else left-associative
                let (left_min, right_min) = if *op == BinaryOp::Pow { (p + 1, p) } else { (p, p + 1) };
                fmt_child(left, left_min, f)?;
                write!(f, " {} ", op.symbol())?;
                fmt_child(right, right_min, f)
            },
            Expr::Member { target, member } => {
                fmt_child(target, PRIORITY_POSTFIX, f)?;
                write!(f, ".{}", member)
            },
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            },
        }
    }
}
