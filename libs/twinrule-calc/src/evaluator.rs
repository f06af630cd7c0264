//! Formula evaluator
//!
//! One exhaustive match over [`Expr`]. Evaluation is pure: it reads the current
//! values and buffered history through a [`Scope`] and returns exactly one
//! [`Value`] or a [`CalcError`] describing why this parameter has no value.
//!
//! Windowed forms take `FN(x, period[, offset])` and read the buffered history of
//! `x` over `[now - period, now - |offset|]`. When `x` is not a variable the
//! scope is asked for a [`Var::Derived`] history keyed by the formula text of `x`;
//! only variables report a window they cannot cover.

use crate::ast::{BinaryOp, Expr, Function, UnaryOp};
use crate::builtin_functions;
use crate::error::{CalcError, Result};
use crate::value::Value;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use twinrule_model::{Aggregation, TimeSeriesBuffer};

/// A variable the evaluator asks its scope about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Var<'a> {
    /// Sibling parameter, rule element or built-in variable
    Field(&'a str),
    /// Source point resolved by the binder
    Point(&'a str),
    /// History recorded for a windowed argument that is not a variable,
    /// keyed by its formula text
    Derived(&'a str),
}

/// Values visible to one evaluation
pub trait Scope {
    /// Latest value of a variable
    fn lookup(&self, var: Var<'_>) -> Option<Value>;

    /// Buffered history of a variable, if it keeps one
    fn series(&self, var: Var<'_>) -> Option<&TimeSeriesBuffer>;

    /// Evaluation timestamp
    fn now(&self) -> DateTime<Utc>;

    /// Value `this` refers to
    fn this(&self) -> Option<Value> {
        None
    }
}

/// Policy for aggregates over empty sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalPolicy {
    /// `ALL` over nothing
    pub empty_all: bool,
    /// `ANY` over nothing
    pub empty_any: bool,
}

impl Default for EvalPolicy {
    fn default() -> Self {
        Self {
            empty_all: true,
            empty_any: false,
        }
    }
}

/// Evaluate `expr` against `scope`
pub fn evaluate<S: Scope + ?Sized>(expr: &Expr, scope: &S, policy: &EvalPolicy) -> Result<Value> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Text(s) => Ok(Value::Text(s.clone())),
        Expr::Duration(d) => Ok(Value::Duration(*d)),
        Expr::Now => Ok(Value::Timestamp(scope.now())),
        Expr::This => scope.this().ok_or_else(|| CalcError::missing("this")),
        Expr::Variable(name) => scope
            .lookup(Var::Field(name))
            .ok_or_else(|| CalcError::missing(name.as_str())),
        Expr::Point(id) => scope
            .lookup(Var::Point(id))
            .ok_or_else(|| CalcError::missing(format!("[{}]", id))),
        Expr::Reference(reference) => Err(CalcError::unbound(reference.to_string())),
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, scope, policy)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.expect_bool("'!'")?)),
                UnaryOp::Neg => match value {
                    Value::Duration(d) => Ok(Value::Duration(-d)),
                    other => Ok(Value::Number(-other.expect_f64("unary '-'")?)),
                },
            }
        },
        Expr::Binary { op, left, right } => {
            if op.is_logical() {
                return logical(*op, left, right, scope, policy);
            }
            let l = evaluate(left, scope, policy)?;
            let r = evaluate(right, scope, policy)?;
            if op.is_comparison() {
                compare(*op, &l, &r).map(Value::Bool)
            } else {
                arithmetic(*op, l, r)
            }
        },
        Expr::Member { target, member } => {
            let value = evaluate(target, scope, policy)?;
            member_of(&value, member)
        },
        Expr::Call { function, args } => call(*function, args, scope, policy),
    }
}

// ============================================================================
// Operators
// ============================================================================

fn logical<S: Scope + ?Sized>(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &S,
    policy: &EvalPolicy,
) -> Result<Value> {
    let l = evaluate(left, scope, policy)?.expect_bool(op.symbol())?;
    match (op, l) {
        (BinaryOp::And, false) => Ok(Value::Bool(false)),
        (BinaryOp::Or, true) => Ok(Value::Bool(true)),
        _ => Ok(Value::Bool(
            evaluate(right, scope, policy)?.expect_bool(op.symbol())?,
        )),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<bool> {
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match (l, r) {
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(CalcError::type_error(format!(
                    "cannot compare {} with {}",
                    l.type_name(),
                    r.type_name()
                )))
            },
        },
    };

    // NaN compares unequal to everything
    let Some(ordering) = ordering else {
        return Ok(op == BinaryOp::Ne);
    };

    Ok(match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        BinaryOp::Eq => ordering.is_eq(),
        BinaryOp::Ne => ordering.is_ne(),
        _ => false,
    })
}

fn scale_duration(d: Duration, factor: f64) -> Value {
    Value::Duration(Duration::milliseconds(
        (d.num_milliseconds() as f64 * factor).round() as i64,
    ))
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    match (op, &l, &r) {
        (BinaryOp::Add, Value::Text(a), Value::Text(b)) => return Ok(Value::Text(format!("{}{}", a, b))),
        (BinaryOp::Add, Value::Timestamp(t), Value::Duration(d))
        | (BinaryOp::Add, Value::Duration(d), Value::Timestamp(t)) => return Ok(Value::Timestamp(*t + *d)),
        (BinaryOp::Sub, Value::Timestamp(t), Value::Duration(d)) => return Ok(Value::Timestamp(*t - *d)),
        (BinaryOp::Sub, Value::Timestamp(a), Value::Timestamp(b)) => return Ok(Value::Duration(*a - *b)),
        (BinaryOp::Add, Value::Duration(a), Value::Duration(b)) => return Ok(Value::Duration(*a + *b)),
        (BinaryOp::Sub, Value::Duration(a), Value::Duration(b)) => return Ok(Value::Duration(*a - *b)),
        (BinaryOp::Div, Value::Duration(a), Value::Duration(b)) => {
            return Ok(Value::Number(
                a.num_milliseconds() as f64 / b.num_milliseconds() as f64,
            ))
        },
        (BinaryOp::Mul, Value::Duration(d), n) | (BinaryOp::Mul, n, Value::Duration(d)) => {
            return Ok(scale_duration(*d, n.expect_f64("'*'")?));
        },
        (BinaryOp::Div, Value::Duration(d), n) => {
            return Ok(scale_duration(*d, 1.0 / n.expect_f64("'/'")?));
        },
        _ => {},
    }

    let a = l.expect_f64(op.symbol())?;
    let b = r.expect_f64(op.symbol())?;
    let n = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
        _ => return Err(CalcError::type_error(format!("'{}' is not arithmetic", op.symbol()))),
    };
    Ok(Value::Number(n))
}

fn member_of(value: &Value, member: &str) -> Result<Value> {
    match value {
        Value::Json(serde_json::Value::Object(map)) => {
            let found = map.get(member).or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(member))
                    .map(|(_, v)| v)
            });
            found
                .and_then(Value::from_json)
                .ok_or_else(|| CalcError::missing(format!(".{}", member)))
        },
        Value::Timestamp(t) => {
            let part = match member.to_ascii_lowercase().as_str() {
                "year" => t.year() as f64,
                "month" => t.month() as f64,
                "day" => t.day() as f64,
                "hour" => t.hour() as f64,
                "minute" => t.minute() as f64,
                "second" => t.second() as f64,
                "dayofweek" => t.weekday().num_days_from_sunday() as f64,
                _ => {
                    return Err(CalcError::type_error(format!(
                        "timestamp has no member '{}'",
                        member
                    )))
                },
            };
            Ok(Value::Number(part))
        },
        other => Err(CalcError::type_error(format!(
            "cannot read member '{}' of {}",
            member,
            other.type_name()
        ))),
    }
}

// ============================================================================
// Functions
// ============================================================================

fn series_var(expr: &Expr) -> Option<Var<'_>> {
    match expr {
        Expr::Variable(name) => Some(Var::Field(name)),
        Expr::Point(id) => Some(Var::Point(id)),
        _ => None,
    }
}

/// `[start, end]` for the optional `(period, offset)` arguments
fn window<S: Scope + ?Sized>(
    args: &[Expr],
    scope: &S,
    policy: &EvalPolicy,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let Some(period_expr) = args.get(1) else {
        return Ok(None);
    };
    let as_duration = |expr: &Expr, what: &str| -> Result<Duration> {
        match evaluate(expr, scope, policy)? {
            Value::Duration(d) => Ok(if d < Duration::zero() { -d } else { d }),
            other => Err(CalcError::type_error(format!(
                "{} must be a duration, got {}",
                what,
                other.type_name()
            ))),
        }
    };

    let period = as_duration(period_expr, "period")?;
    let offset = match args.get(2) {
        Some(expr) => as_duration(expr, "offset")?,
        None => Duration::zero(),
    };
    if offset > period {
        return Err(CalcError::type_error("window offset exceeds its period"));
    }

    let now = scope.now();
    Ok(Some((now - period, now - offset)))
}

fn covered(series: &TimeSeriesBuffer, start: DateTime<Utc>, name: &Expr) -> Result<()> {
    match series.first_seen() {
        Some(first) if first <= start => Ok(()),
        _ => Err(CalcError::insufficient(format!(
            "'{}' does not cover the requested window",
            name
        ))),
    }
}

/// Materialize the sequence an aggregate reduces
fn sequence<S: Scope + ?Sized>(args: &[Expr], scope: &S, policy: &EvalPolicy) -> Result<Vec<Value>> {
    let source = args
        .first()
        .ok_or_else(|| CalcError::function("aggregate without an argument"))?;
    let window = window(args, scope, policy)?;

    let Some((start, end)) = window else {
        if let Some(series) = series_var(source).and_then(|v| scope.series(v)) {
            return Ok(series.iter().map(|p| Value::from(&p.value)).collect());
        }
        return match evaluate(source, scope, policy)? {
            Value::Json(serde_json::Value::Array(items)) => {
                Ok(items.iter().filter_map(Value::from_json).collect())
            },
            other => Ok(vec![other]),
        };
    };

    let in_window = |series: &TimeSeriesBuffer| -> Vec<Value> {
        series.range(start, end).map(|p| Value::from(&p.value)).collect()
    };
    match series_var(source) {
        Some(var) => match scope.series(var) {
            Some(series) => {
                covered(series, start, source)?;
                Ok(in_window(series))
            },
            None => {
                // Distinguish "not there yet" from "not a time series"
                evaluate(source, scope, policy)?;
                Err(CalcError::type_error(format!(
                    "windowed function needs a buffered variable, got '{}'",
                    source
                )))
            },
        },
        None => match scope.series(Var::Derived(&source.to_string())) {
            Some(series) => Ok(in_window(series)),
            None => {
                evaluate(source, scope, policy)?;
                Err(CalcError::type_error(format!("no history recorded for '{}'", source)))
            },
        },
    }
}

fn delta<S: Scope + ?Sized>(args: &[Expr], scope: &S, policy: &EvalPolicy) -> Result<Value> {
    let source = args
        .first()
        .ok_or_else(|| CalcError::function("DELTA without an argument"))?;
    let window = window(args, scope, policy)?;
    let var = series_var(source);
    let key = source.to_string();
    let history = match (var, window) {
        (Some(v), _) => scope.series(v),
        (None, Some(_)) => scope.series(Var::Derived(&key)),
        (None, None) => None,
    };

    let Some(series) = history else {
        // Missing inputs are still missing; plain values have no delta
        match var {
            Some(v) if scope.lookup(v).is_none() => return Err(CalcError::missing(key)),
            Some(_) => {},
            None => {
                evaluate(source, scope, policy)?;
            },
        }
        return Ok(Value::Number(0.0));
    };

    if series.is_empty() {
        return Ok(Value::Number(0.0));
    }
    match window {
        None => Ok(Value::Number(series.last_delta())),
        Some((start, end)) => {
            if series.range(start, end).take(2).count() < 2 {
                return Ok(Value::Number(f64::NAN));
            }
            match (series.value_at(end), series.value_at(start)) {
                (Some(last), Some(first)) => Ok(Value::Number(last - first)),
                _ => Err(CalcError::type_error(format!(
                    "DELTA over non-numeric series '{}'",
                    source
                ))),
            }
        },
    }
}

fn call<S: Scope + ?Sized>(
    function: Function,
    args: &[Expr],
    scope: &S,
    policy: &EvalPolicy,
) -> Result<Value> {
    let arg = |i: usize| -> Result<&Expr> {
        args.get(i)
            .ok_or_else(|| CalcError::function(format!("{} is missing argument {}", function.name(), i + 1)))
    };
    let numeric = |i: usize| -> Result<f64> {
        evaluate(arg(i)?, scope, policy)?.expect_f64(function.name())
    };

    match function {
        Function::All | Function::Any => {
            let values = sequence(args, scope, policy)?;
            if values.is_empty() {
                return Ok(Value::Bool(if function == Function::All {
                    policy.empty_all
                } else {
                    policy.empty_any
                }));
            }
            let mut bools = values.iter().map(|v| v.expect_bool(function.name()));
            let result = if function == Function::All {
                bools.try_fold(true, |acc, b| b.map(|b| acc && b))?
            } else {
                bools.try_fold(false, |acc, b| b.map(|b| acc || b))?
            };
            Ok(Value::Bool(result))
        },
        Function::Count => Ok(Value::Number(sequence(args, scope, policy)?.len() as f64)),
        Function::Average
        | Function::Min
        | Function::Max
        | Function::Sum
        | Function::First
        | Function::Stnd => {
            let values = sequence(args, scope, policy)?
                .iter()
                .map(|v| v.expect_f64(function.name()))
                .collect::<Result<Vec<f64>>>()?;
            let aggregation = match function {
                Function::Average => Aggregation::Average,
                Function::Min => Aggregation::Min,
                Function::Max => Aggregation::Max,
                Function::Sum => Aggregation::Sum,
                Function::First => Aggregation::First,
                _ => Aggregation::StandardDeviation,
            };
            Ok(Value::Number(aggregation.apply(&values)))
        },
        Function::Delta => delta(args, scope, policy),
        Function::Option => {
            let mut last_missing = CalcError::missing("OPTION has no bound candidate");
            for arg in args {
                match evaluate(arg, scope, policy) {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_missing() => last_missing = e,
                    Err(e) => return Err(e),
                }
            }
            Err(last_missing)
        },
        Function::Exists => {
            for arg in args {
                match evaluate(arg, scope, policy) {
                    Ok(_) => {},
                    Err(e) if e.is_missing() => return Ok(Value::Bool(false)),
                    Err(e) => return Err(e),
                }
            }
            Ok(Value::Bool(true))
        },
        Function::IfNan => match evaluate(arg(0)?, scope, policy) {
            Ok(value) if value.is_nan() => evaluate(arg(1)?, scope, policy),
            Ok(value) => Ok(value),
            Err(e) if e.is_missing() || matches!(e, CalcError::InsufficientData(_)) => {
                evaluate(arg(1)?, scope, policy)
            },
            Err(e) => Err(e),
        },
        Function::If => {
            if evaluate(arg(0)?, scope, policy)?.expect_bool("IF")? {
                evaluate(arg(1)?, scope, policy)
            } else {
                evaluate(arg(2)?, scope, policy)
            }
        },
        Function::Abs => Ok(Value::Number(builtin_functions::abs(numeric(0)?))),
        Function::Round => {
            let digits = if args.len() > 1 { numeric(1)? as i32 } else { 0 };
            Ok(Value::Number(builtin_functions::round(numeric(0)?, digits)))
        },
        Function::Clamp => Ok(Value::Number(builtin_functions::clamp(
            numeric(0)?,
            numeric(1)?,
            numeric(2)?,
        ))),
    }
}

// ============================================================================
// Simple scope
// ============================================================================

/// Map-backed [`Scope`] for ad-hoc evaluation
#[derive(Debug, Clone)]
pub struct SimpleScope {
    pub now: DateTime<Utc>,
    pub fields: HashMap<String, Value>,
    pub points: HashMap<String, Value>,
    pub series: HashMap<String, TimeSeriesBuffer>,
    pub this: Option<Value>,
}

impl SimpleScope {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            fields: HashMap::new(),
            points: HashMap::new(),
            series: HashMap::new(),
            this: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_point(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.points.insert(id.into(), value.into());
        self
    }

    /// Register history for a field; its latest value becomes the field value
    pub fn with_series(mut self, name: impl Into<String>, series: TimeSeriesBuffer) -> Self {
        let name = name.into();
        if let Some(last) = series.last() {
            self.fields.insert(name.clone(), Value::from(&last.value));
        }
        self.series.insert(name, series);
        self
    }
}

impl Scope for SimpleScope {
    fn lookup(&self, var: Var<'_>) -> Option<Value> {
        match var {
            Var::Field(name) => self.fields.get(name).cloned(),
            Var::Point(id) => self.points.get(id).cloned(),
            Var::Derived(key) => self.series.get(key)?.last().map(|p| Value::from(&p.value)),
        }
    }

    fn series(&self, var: Var<'_>) -> Option<&TimeSeriesBuffer> {
        match var {
            Var::Field(name) | Var::Derived(name) => self.series.get(name),
            Var::Point(_) => None,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn this(&self) -> Option<Value> {
        self.this.clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use chrono::TimeZone;
    use twinrule_model::{RetentionPolicy, TimedValue};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn eval(formula: &str, scope: &SimpleScope) -> Result<Value> {
        evaluate(&parse(formula).unwrap(), scope, &EvalPolicy::default())
    }

    fn history(values: &[(i64, f64)]) -> TimeSeriesBuffer {
        let mut buffer = TimeSeriesBuffer::new(RetentionPolicy::unbounded());
        for (minutes, v) in values {
            buffer.push(TimedValue::new(t0() + Duration::minutes(*minutes), *v));
        }
        buffer
    }

    #[test]
    fn test_arithmetic_and_bool_coercion() {
        let scope = SimpleScope::new(t0())
            .with_field("a", 3.0)
            .with_field("on", true);
        assert_eq!(eval("a * 2 + 1", &scope).unwrap(), Value::Number(7.0));
        assert_eq!(eval("on + 1", &scope).unwrap(), Value::Number(2.0));
        assert_eq!(eval("on == 1", &scope).unwrap(), Value::Bool(true));
        assert_eq!(eval("a > 2 & on", &scope).unwrap(), Value::Bool(true));
        assert_eq!(eval("2 ^ 3 % 5", &scope).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_type_error_is_a_value_not_a_panic() {
        let scope = SimpleScope::new(t0()).with_field("mode", Value::Text("heat".into()));
        assert!(matches!(eval("mode * 2", &scope), Err(CalcError::Type(_))));
        assert!(matches!(eval("mode > 2", &scope), Err(CalcError::Type(_))));
        assert_eq!(eval("mode == 'heat'", &scope).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_missing_and_unbound() {
        let scope = SimpleScope::new(t0());
        assert!(matches!(eval("nope + 1", &scope), Err(CalcError::MissingValue(_))));
        assert!(matches!(
            eval("[dtmi:com:example:Fan;1]", &scope),
            Err(CalcError::Unbound(_))
        ));
        // short-circuit skips the missing right side
        assert_eq!(eval("FALSE & nope", &scope).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_aggregates_over_history() {
        let scope = SimpleScope::new(t0() + Duration::minutes(60))
            .with_series("temp", history(&[(0, 20.0), (20, 22.0), (40, 27.0), (60, 23.0)]));

        assert_eq!(eval("MAX(temp)", &scope).unwrap(), Value::Number(27.0));
        assert_eq!(eval("FIRST(temp)", &scope).unwrap(), Value::Number(20.0));
        assert_eq!(eval("COUNT(temp, 30min)", &scope).unwrap(), Value::Number(2.0));
        assert_eq!(eval("AVERAGE(temp, 1h)", &scope).unwrap(), Value::Number(23.0));
        assert_eq!(eval("SUM(temp, 1h, 30min)", &scope).unwrap(), Value::Number(42.0));
        // without a window only the current value is tested
        assert_eq!(eval("ANY(temp > 25)", &scope).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_windowed_any_reads_expression_history() {
        let temps = [(0, 20.0), (20, 22.0), (40, 27.0), (60, 23.0)];
        let mut hot = TimeSeriesBuffer::new(RetentionPolicy::unbounded());
        for (minutes, v) in temps {
            hot.push(TimedValue::new(t0() + Duration::minutes(minutes), v > 25.0));
        }
        let scope = SimpleScope::new(t0() + Duration::minutes(60))
            .with_series("temp", history(&temps))
            .with_series("temp > 25", hot);

        assert_eq!(eval("ANY(temp > 25)", &scope).unwrap(), Value::Bool(false));
        assert_eq!(eval("ANY(temp > 25, 1h)", &scope).unwrap(), Value::Bool(true));
        assert_eq!(eval("ANY(temp > 25, 10min)", &scope).unwrap(), Value::Bool(false));
        assert_eq!(eval("COUNT(temp > 25, 1h)", &scope).unwrap(), Value::Number(4.0));
    }

    #[test]
    fn test_windowed_constant_needs_recorded_history() {
        let scope = SimpleScope::new(t0());
        assert!(matches!(eval("MAX(1, 1d)", &scope), Err(CalcError::Type(_))));
        assert!(matches!(eval("ANY(ghost > 1, 1h)", &scope), Err(CalcError::MissingValue(_))));
        assert!(matches!(eval("DELTA(ghost * 2, 1h)", &scope), Err(CalcError::MissingValue(_))));

        let mut ones = TimeSeriesBuffer::new(RetentionPolicy::unbounded());
        ones.push(TimedValue::new(t0(), 1.0));
        let scope = scope.with_series("1", ones);
        // a recorded history never reports an uncovered window
        assert_eq!(eval("MAX(1, 1d)", &scope).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_window_longer_than_count_limit() {
        let mut x = TimeSeriesBuffer::new(RetentionPolicy::count(10)).with_horizon(Duration::hours(1));
        for i in 0..200 {
            x.push(TimedValue::new(t0() + Duration::minutes(i), i as f64));
        }
        let scope = SimpleScope::new(t0() + Duration::minutes(199)).with_series("x", x);

        // 139..=199
        assert_eq!(eval("AVERAGE(x, 1h)", &scope).unwrap(), Value::Number(169.0));
        assert_eq!(eval("COUNT(x, 1h)", &scope).unwrap(), Value::Number(61.0));
        assert!(matches!(eval("AVERAGE(x, 2h)", &scope), Err(CalcError::InsufficientData(_))));
    }

    #[test]
    fn test_window_beyond_history_is_insufficient() {
        let scope = SimpleScope::new(t0() + Duration::minutes(60))
            .with_series("temp", history(&[(30, 1.0), (60, 2.0)]));
        assert!(matches!(
            eval("MIN(temp, 2h)", &scope),
            Err(CalcError::InsufficientData(_))
        ));
        assert_eq!(eval("IFNAN(MIN(temp, 2h), -1)", &scope).unwrap(), Value::Number(-1.0));
    }

    #[test]
    fn test_empty_sequences() {
        let scope = SimpleScope::new(t0())
            .with_field("none", Value::Json(serde_json::json!([])));
        assert_eq!(eval("ALL(none)", &scope).unwrap(), Value::Bool(true));
        assert_eq!(eval("ANY(none)", &scope).unwrap(), Value::Bool(false));
        assert_eq!(eval("COUNT(none)", &scope).unwrap(), Value::Number(0.0));
        assert!(eval("AVERAGE(none)", &scope).unwrap().is_nan());

        let strict = EvalPolicy {
            empty_all: false,
            empty_any: false,
        };
        let expr = parse("ALL(none)").unwrap();
        assert_eq!(evaluate(&expr, &scope, &strict).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_delta_forms() {
        let scope = SimpleScope::new(t0() + Duration::minutes(60))
            .with_series("meter", history(&[(0, 100.0), (30, 130.0), (60, 190.0)]))
            .with_field("setpoint", 21.0);

        assert_eq!(eval("DELTA(meter)", &scope).unwrap(), Value::Number(60.0));
        assert_eq!(eval("DELTA(meter, 1h)", &scope).unwrap(), Value::Number(90.0));
        // [now-1h, now-15min] interpolates 100 -> 160
        assert_eq!(eval("DELTA(meter, 1h, 15min)", &scope).unwrap(), Value::Number(60.0));
        assert_eq!(eval("DELTA(setpoint)", &scope).unwrap(), Value::Number(0.0));
        assert_eq!(eval("DELTA(3)", &scope).unwrap(), Value::Number(0.0));
        // a single point in [now-10min, now]
        assert!(eval("DELTA(meter, 10min)", &scope).unwrap().is_nan());
        assert!(matches!(eval("DELTA(ghost)", &scope), Err(CalcError::MissingValue(_))));
    }

    #[test]
    fn test_option_exists_ifnan() {
        let scope = SimpleScope::new(t0())
            .with_point("sat-2", 14.0)
            .with_field("bad", f64::NAN);

        let option = Expr::call(
            Function::Option,
            vec![Expr::Point("sat-1".into()), Expr::Point("sat-2".into())],
        );
        assert_eq!(
            evaluate(&option, &scope, &EvalPolicy::default()).unwrap(),
            Value::Number(14.0)
        );

        assert_eq!(eval("EXISTS(bad)", &scope).unwrap(), Value::Bool(true));
        assert_eq!(eval("EXISTS(bad, nope)", &scope).unwrap(), Value::Bool(false));
        assert_eq!(eval("IFNAN(bad, 5)", &scope).unwrap(), Value::Number(5.0));
        assert_eq!(eval("IFNAN(nope, 5)", &scope).unwrap(), Value::Number(5.0));
        assert!(matches!(eval("OPTION(nope, ghost)", &scope), Err(CalcError::MissingValue(_))));
    }

    #[test]
    fn test_member_access() {
        let mut scope = SimpleScope::new(t0()).with_field(
            "payload",
            Value::Json(serde_json::json!({"Mode": "cool", "stage": 2})),
        );
        scope.this = Some(Value::Json(serde_json::json!({"nominal": {"flow": 1.5}})));

        assert_eq!(eval("payload.mode", &scope).unwrap(), Value::Text("cool".into()));
        assert_eq!(eval("payload.stage + 1", &scope).unwrap(), Value::Number(3.0));
        assert_eq!(eval("this.nominal.flow * 2", &scope).unwrap(), Value::Number(3.0));
        assert_eq!(eval("NOW.hour", &scope).unwrap(), Value::Number(12.0));
        assert!(matches!(eval("payload.missing", &scope), Err(CalcError::MissingValue(_))));
    }

    #[test]
    fn test_builtins() {
        let scope = SimpleScope::new(t0()).with_field("x", -3.14159);
        assert_eq!(eval("ABS(x)", &scope).unwrap(), Value::Number(3.14159));
        assert_eq!(eval("ROUND(x, 2)", &scope).unwrap(), Value::Number(-3.14));
        assert_eq!(eval("CLAMP(x, 0, 10)", &scope).unwrap(), Value::Number(0.0));
        assert_eq!(eval("IF(x < 0, 'neg', 'pos')", &scope).unwrap(), Value::Text("neg".into()));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let scope = SimpleScope::new(t0());
        assert_eq!(
            eval("NOW - 1h", &scope).unwrap(),
            Value::Timestamp(t0() - Duration::hours(1))
        );
        assert_eq!(
            eval("(NOW - (NOW - 90min)) / 1h", &scope).unwrap(),
            Value::Number(1.5)
        );
    }
}
