//! Formula language for twinrule
//!
//! Formulas are parsed once into a typed [`Expr`] tree and evaluated many times
//! against a [`Scope`].
//!
//! ```text
//! "MAX([dtmi:com:example:Temp;1], 1h) > setpoint + 2"
//!        │
//!        ▼  lexer::tokenize / parser::parse
//!   Expr::Binary(Gt, Call(Max, [Reference, Duration]), Binary(Add, ..))
//!        │
//!        ▼  Expr::transform (binding references to points)
//!   Expr::Binary(Gt, Call(Max, [Point("temp-7"), ..]), ..)
//!        │
//!        ▼  evaluator::evaluate(expr, scope, policy)
//!   Value::Bool(true)  |  CalcError::{MissingValue, InsufficientData, ..}
//! ```
//!
//! Supported:
//! - arithmetic `+ - * / % ^`, comparisons, `& | !` (also `AND OR NOT`)
//! - duration literals `30s`, `15min`, `1h`, `7d`, `2w` and `NOW`
//! - member access on JSON values and timestamps (`this.nominal.flow`, `NOW.hour`)
//! - `ALL ANY COUNT AVERAGE MIN MAX SUM FIRST STND DELTA` with optional `(period, offset)` windows,
//!   over variables or over any expression the scope keeps a history for
//! - `OPTION EXISTS IFNAN IF ABS ROUND CLAMP`

pub mod ast;
pub mod builtin_functions;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{BinaryOp, Expr, Function, Reference, ResultType, UnaryOp, Window};
pub use error::{CalcError, Result};
pub use evaluator::{evaluate, EvalPolicy, Scope, SimpleScope, Var};
pub use parser::parse;
pub use value::{Value, TIMESTAMP_FORMAT};
