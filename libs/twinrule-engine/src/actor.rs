//! Rule instance and calculated point actors
//!
//! The synchronous core of an actor: it owns its buffers and evaluates one
//! timestamp group at a time. The scheduler wraps each actor in a task with a
//! mailbox; nothing else ever holds a `&mut` to it.
//!
//! Besides one buffer per input and parameter, an actor keeps a derived buffer
//! for every windowed argument that is not a variable (`MAX(1, 1d)`,
//! `ANY([sat] > 25, 1h)`). The argument is evaluated and recorded just before
//! the formula that reads it, so the window reduces over its own history.
//!
//! ```text
//!   Unbound ──bind──► Bound ──values──► Evaluating ◄──► Idle
//!                                           │
//!                                           └──supersede──► Superseded
//! ```

use chrono::{DateTime, Duration, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};
use twinrule_calc::{evaluate, CalcError, EvalPolicy, Expr, Scope, Value, Var, Window};
use twinrule_model::{
    CalculatedPoint, CumulativeSetting, Insight, PushOutcome, RetentionPolicy, Rule, RuleParameter,
    TimeSeriesBuffer, TimedValue, RESULT_FIELD_ID,
};

/// Longest state text kept on a parameter or instance
pub const MAX_STATE_TEXT: usize = 500;

/// Seconds since the instance's previous evaluation
pub const DELTA_TIME_S: &str = "DELTA_TIME_S";

/// Previous result value of the instance
pub const IS_FAULTY: &str = "IS_FAULTY";

/// Names every rule formula may use without binding
pub fn builtin_variables() -> [&'static str; 2] {
    [DELTA_TIME_S, IS_FAULTY]
}

// ============================================================================
// Shared types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorPhase {
    Unbound,
    Bound,
    Evaluating,
    Idle,
    Superseded,
}

/// Identity of one rule instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub equipment_id: String,
    pub rule_id: String,
}

impl InstanceKey {
    pub fn new(equipment_id: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            rule_id: rule_id.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.equipment_id, self.rule_id)
    }
}

/// Outcome of the latest evaluation of a parameter or instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OutputState {
    Valid,
    InvalidValue(String),
    MissingValue(String),
    InsufficientData(String),
    InvalidOutput(String),
}

fn truncate(text: impl Into<String>) -> String {
    let mut text = text.into();
    if text.len() > MAX_STATE_TEXT {
        let mut end = MAX_STATE_TEXT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

impl OutputState {
    pub fn invalid_value(text: impl Into<String>) -> Self {
        OutputState::InvalidValue(truncate(text))
    }

    pub fn missing(text: impl Into<String>) -> Self {
        OutputState::MissingValue(truncate(text))
    }

    pub fn invalid_output(text: impl Into<String>) -> Self {
        OutputState::InvalidOutput(truncate(text))
    }

    pub fn from_error(err: &CalcError) -> Self {
        match err {
            CalcError::MissingValue(_) | CalcError::Unbound(_) => Self::missing(err.to_string()),
            CalcError::InsufficientData(_) => OutputState::InsufficientData(truncate(err.to_string())),
            _ => Self::invalid_value(err.to_string()),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, OutputState::Valid)
    }

    pub fn text(&self) -> &str {
        match self {
            OutputState::Valid => "",
            OutputState::InvalidValue(t)
            | OutputState::MissingValue(t)
            | OutputState::InsufficientData(t)
            | OutputState::InvalidOutput(t) => t,
        }
    }
}

/// A rule parameter after binding
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParameter {
    pub parameter: RuleParameter,
    /// `None` when the parameter is disabled
    pub expr: Option<Expr>,
    pub disabled: Option<String>,
    /// Points read directly
    pub points: BTreeSet<String>,
    /// Sibling fields read directly
    pub fields: BTreeSet<String>,
    pub impact: bool,
}

impl BoundParameter {
    pub fn field_id(&self) -> &str {
        &self.parameter.field_id
    }
}

/// A value appended to a parameter buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub field_id: String,
    pub value: TimedValue,
}

/// Result of one timestamp group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub updates: Vec<ParameterUpdate>,
    /// Whether the result field was evaluated in this group
    pub result_evaluated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActorStats {
    pub trigger_count: u64,
    /// Evaluations that produced a valid result
    pub occurrence_count: u64,
    pub faulted_count: u64,
    pub is_faulty: bool,
    pub earliest_seen: Option<DateTime<Utc>>,
    pub first_occurrence: Option<DateTime<Utc>>,
    pub first_faulted: Option<DateTime<Utc>>,
    pub last_faulted: Option<DateTime<Utc>>,
    pub last_evaluated: Option<DateTime<Utc>>,
}

/// Fold a computed value into a cumulative buffer
fn fold_cumulative(
    setting: CumulativeSetting,
    buffer: &TimeSeriesBuffer,
    timestamp: DateTime<Utc>,
    value: Value,
) -> Result<Value, String> {
    if !setting.is_cumulative() {
        return Ok(value);
    }
    let v = value
        .as_f64()
        .ok_or_else(|| format!("cumulative value must be numeric, got {}", value.type_name()))?;
    let previous = buffer.last().and_then(TimedValue::as_f64).unwrap_or(0.0);

    Ok(Value::Number(match setting.seconds_per_unit() {
        None => previous + v,
        Some(unit) => {
            let gap = buffer
                .last_seen()
                .map(|last| timestamp - last)
                .unwrap_or_else(Duration::zero);
            previous + v * gap.num_milliseconds() as f64 / 1000.0 / unit
        },
    }))
}

/// Longest literal window over each source, keyed by the source's formula text
#[derive(Debug, Clone, Default)]
struct Horizons(FxHashMap<String, Duration>);

impl Horizons {
    fn add<'a>(&mut self, windows: impl IntoIterator<Item = Window<'a>>) {
        for window in windows {
            let Some(period) = window.period else {
                continue;
            };
            let horizon = self.0.entry(window.source.to_string()).or_insert_with(Duration::zero);
            *horizon = (*horizon).max(period);
        }
    }

    fn of(&self, key: &str) -> Duration {
        self.0.get(key).copied().unwrap_or_else(Duration::zero)
    }

    fn of_point(&self, point_id: &str) -> Duration {
        self.of(&format!("[{}]", point_id))
    }
}

/// Windowed arguments that need a derived buffer, keyed by formula text
fn windowed_arguments(expr: &Expr) -> Vec<(String, Expr)> {
    expr.windowed_arguments()
        .into_iter()
        .map(|arg| (arg.to_string(), arg.clone()))
        .collect()
}

fn record_derived(
    derived: &mut FxHashMap<String, TimeSeriesBuffer>,
    retention: RetentionPolicy,
    horizons: &Horizons,
    key: &str,
    value: TimedValue,
) {
    if !derived.contains_key(key) {
        let buffer = TimeSeriesBuffer::new(retention).with_horizon(horizons.of(key));
        derived.insert(key.to_string(), buffer);
    }
    if let Some(buffer) = derived.get_mut(key) {
        buffer.push(value);
    }
}

fn push_inputs(
    inputs: &mut FxHashMap<Arc<str>, TimeSeriesBuffer>,
    retention: RetentionPolicy,
    horizons: &Horizons,
    values: &[(Arc<str>, TimedValue)],
) -> FxHashSet<Arc<str>> {
    let mut changed = FxHashSet::default();
    for (point_id, value) in values {
        let buffer = inputs
            .entry(point_id.clone())
            .or_insert_with(|| TimeSeriesBuffer::new(retention).with_horizon(horizons.of_point(point_id)));
        match buffer.push(value.clone()) {
            PushOutcome::Appended => {
                changed.insert(point_id.clone());
            },
            outcome => trace!("{} ignored {:?} value at {}", point_id, outcome, value.timestamp),
        }
    }
    changed
}

// ============================================================================
// Scope
// ============================================================================

struct ParameterSlot {
    bound: BoundParameter,
    /// Points this parameter depends on, directly or through siblings
    sources: FxHashSet<Arc<str>>,
    /// Recorded before each evaluation, nested arguments first
    windowed: Vec<(String, Expr)>,
    buffer: TimeSeriesBuffer,
    state: OutputState,
}

struct ActorScope<'a> {
    now: DateTime<Utc>,
    delta_time: Duration,
    is_faulty: bool,
    inputs: &'a FxHashMap<Arc<str>, TimeSeriesBuffer>,
    derived: &'a FxHashMap<String, TimeSeriesBuffer>,
    slots: &'a [ParameterSlot],
    index: &'a FxHashMap<String, usize>,
    constants: &'a FxHashMap<String, Value>,
    this: Option<&'a Value>,
}

impl ActorScope<'_> {
    fn slot(&self, name: &str) -> Option<&ParameterSlot> {
        self.index.get(name).map(|i| &self.slots[*i])
    }
}

impl Scope for ActorScope<'_> {
    fn lookup(&self, var: Var<'_>) -> Option<Value> {
        match var {
            Var::Point(id) => self.inputs.get(id)?.last().map(|p| Value::from(&p.value)),
            Var::Field(name) => {
                if let Some(slot) = self.slot(name) {
                    // an invalid sibling reads as missing, not as its stale value
                    if !slot.state.is_valid() {
                        return None;
                    }
                    return slot.buffer.last().map(|p| Value::from(&p.value));
                }
                if let Some(constant) = self.constants.get(name) {
                    return Some(constant.clone());
                }
                match name {
                    DELTA_TIME_S => Some(Value::Number(
                        self.delta_time.num_milliseconds() as f64 / 1000.0,
                    )),
                    IS_FAULTY => Some(Value::Bool(self.is_faulty)),
                    _ => None,
                }
            },
            Var::Derived(key) => self.derived.get(key)?.last().map(|p| Value::from(&p.value)),
        }
    }

    fn series(&self, var: Var<'_>) -> Option<&TimeSeriesBuffer> {
        match var {
            Var::Point(id) => self.inputs.get(id),
            Var::Field(name) => self.slot(name).map(|s| &s.buffer),
            Var::Derived(key) => self.derived.get(key),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn this(&self) -> Option<Value> {
        self.this.cloned()
    }
}

// ============================================================================
// Rule instance actor
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSnapshot {
    pub field_id: String,
    pub unit: Option<String>,
    pub impact: bool,
    pub state: OutputState,
    #[serde(skip)]
    pub buffer: TimeSeriesBuffer,
}

/// Final state of a rule instance after a run
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub equipment_id: String,
    pub rule_id: String,
    pub version: u32,
    pub phase: ActorPhase,
    pub state: OutputState,
    pub stats: ActorStats,
    pub parameters: Vec<ParameterSnapshot>,
    /// Last record synced during the run
    pub insight: Option<Insight>,
}

impl InstanceSnapshot {
    pub fn parameter(&self, field_id: &str) -> Option<&ParameterSnapshot> {
        self.parameters.iter().find(|p| p.field_id == field_id)
    }

    pub fn values(&self, field_id: &str) -> Vec<f64> {
        self.parameter(field_id)
            .map(|p| p.buffer.iter().filter_map(TimedValue::as_f64).collect())
            .unwrap_or_default()
    }
}

pub struct RuleInstanceActor {
    key: InstanceKey,
    rule: Arc<Rule>,
    version: u32,
    phase: ActorPhase,
    slots: Vec<ParameterSlot>,
    index: FxHashMap<String, usize>,
    inputs: FxHashMap<Arc<str>, TimeSeriesBuffer>,
    derived: FxHashMap<String, TimeSeriesBuffer>,
    horizons: Horizons,
    constants: FxHashMap<String, Value>,
    this: Option<Value>,
    retention: RetentionPolicy,
    policy: EvalPolicy,
    stats: ActorStats,
    state: OutputState,
}

impl RuleInstanceActor {
    pub fn new(
        key: InstanceKey,
        rule: Arc<Rule>,
        version: u32,
        retention: RetentionPolicy,
        policy: EvalPolicy,
    ) -> Self {
        let constants = rule
            .elements
            .iter()
            .map(|e| (e.field_id().to_string(), Value::Number(e.value)))
            .collect();
        Self {
            key,
            rule,
            version,
            phase: ActorPhase::Unbound,
            slots: Vec::new(),
            index: FxHashMap::default(),
            inputs: FxHashMap::default(),
            derived: FxHashMap::default(),
            horizons: Horizons::default(),
            constants,
            this: None,
            retention,
            policy,
            stats: ActorStats::default(),
            state: OutputState::missing("not evaluated yet"),
        }
    }

    /// Install bound parameters, already in dependency order
    pub fn bind(&mut self, parameters: Vec<BoundParameter>, this: Option<Value>) {
        self.slots.clear();
        self.index.clear();
        self.derived.clear();
        self.this = this;

        let mut horizons = Horizons::default();
        for expr in parameters.iter().filter_map(|b| b.expr.as_ref()) {
            horizons.add(expr.windows());
        }
        for (point_id, buffer) in self.inputs.iter_mut() {
            buffer.set_horizon(horizons.of_point(point_id));
        }
        self.horizons = horizons;

        for bound in parameters {
            let mut sources: FxHashSet<Arc<str>> = bound.points.iter().map(|p| Arc::from(p.as_str())).collect();
            for field in &bound.fields {
                if let Some(&dep) = self.index.get(field) {
                    sources.extend(self.slots[dep].sources.iter().cloned());
                }
            }
            let state = match &bound.disabled {
                Some(reason) => OutputState::missing(reason.clone()),
                None => OutputState::missing("not evaluated yet"),
            };
            let buffer = TimeSeriesBuffer::new(self.retention)
                .with_unit(bound.parameter.unit.clone())
                .with_horizon(self.horizons.of(bound.field_id()));
            let windowed = bound.expr.as_ref().map(windowed_arguments).unwrap_or_default();
            self.index.insert(bound.field_id().to_string(), self.slots.len());
            self.slots.push(ParameterSlot {
                bound,
                sources,
                windowed,
                buffer,
                state,
            });
        }

        self.phase = ActorPhase::Bound;
        debug!(
            rule_instance = %self.key,
            "Bound {} parameters ({} disabled)",
            self.slots.len(),
            self.slots.iter().filter(|s| s.bound.disabled.is_some()).count()
        );
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn phase(&self) -> ActorPhase {
        self.phase
    }

    pub fn stats(&self) -> &ActorStats {
        &self.stats
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    pub fn buffer(&self, field_id: &str) -> Option<&TimeSeriesBuffer> {
        self.index.get(field_id).map(|i| &self.slots[*i].buffer)
    }

    /// Recorded history of a windowed argument, by formula text
    pub fn derived_buffer(&self, key: &str) -> Option<&TimeSeriesBuffer> {
        self.derived.get(key)
    }

    pub fn parameter_state(&self, field_id: &str) -> Option<&OutputState> {
        self.index.get(field_id).map(|i| &self.slots[*i].state)
    }

    /// Latest value of every valid parameter plus rule elements
    pub fn latest_values(&self) -> FxHashMap<String, Value> {
        let mut values = self.constants.clone();
        for slot in &self.slots {
            if let Some(last) = slot.buffer.last() {
                values.insert(slot.bound.field_id().to_string(), Value::from(&last.value));
            }
        }
        values
    }

    /// Bound parameters in evaluation order
    pub fn parameters(&self) -> impl Iterator<Item = &BoundParameter> + '_ {
        self.slots.iter().map(|s| &s.bound)
    }

    pub fn supersede(&mut self) {
        self.phase = ActorPhase::Superseded;
    }

    /// Apply every value sharing `timestamp`, then re-evaluate dependents
    pub fn apply(&mut self, timestamp: DateTime<Utc>, values: &[(Arc<str>, TimedValue)]) -> Evaluation {
        let mut evaluation = Evaluation::default();
        if matches!(self.phase, ActorPhase::Superseded | ActorPhase::Unbound) {
            debug!(rule_instance = %self.key, "Ignoring input in phase {:?}", self.phase);
            return evaluation;
        }

        self.phase = ActorPhase::Evaluating;
        let changed = push_inputs(&mut self.inputs, self.retention, &self.horizons, values);
        if changed.is_empty() {
            self.phase = ActorPhase::Idle;
            return evaluation;
        }

        self.stats.trigger_count += 1;
        self.stats.earliest_seen.get_or_insert(timestamp);
        let delta_time = self
            .stats
            .last_evaluated
            .map(|last| timestamp - last)
            .unwrap_or_else(Duration::zero);

        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            let dirty = slot.sources.is_empty() || slot.sources.iter().any(|s| changed.contains(s));
            if slot.bound.expr.is_none() || !dirty {
                continue;
            }

            self.record_windowed(i, timestamp, delta_time);
            let result = match &self.slots[i].bound.expr {
                Some(expr) => evaluate(expr, &self.scope(timestamp, delta_time), &self.policy),
                None => continue,
            };

            let slot = &mut self.slots[i];
            let field_id = slot.bound.field_id();
            if field_id == RESULT_FIELD_ID {
                evaluation.result_evaluated = true;
            }
            match result
                .map_err(|e| OutputState::from_error(&e))
                .and_then(|v| {
                    fold_cumulative(slot.bound.parameter.cumulative, &slot.buffer, timestamp, v)
                        .map_err(OutputState::invalid_value)
                }) {
                Ok(value) => {
                    let point = TimedValue::new(timestamp, value.to_point());
                    match slot.buffer.push(point.clone()) {
                        PushOutcome::Appended => {
                            slot.state = OutputState::Valid;
                            evaluation.updates.push(ParameterUpdate {
                                field_id: field_id.to_string(),
                                value: point,
                            });
                        },
                        PushOutcome::Invalid => {
                            slot.state = OutputState::invalid_value(format!("{} is not a finite value", value));
                        },
                        PushOutcome::Stale => {},
                    }
                },
                Err(state) => {
                    trace!(rule_instance = %self.key, "{}: {:?}", field_id, state);
                    slot.state = state;
                },
            }
        }

        if evaluation.result_evaluated {
            self.observe_result(timestamp);
        }
        self.stats.last_evaluated = Some(timestamp);
        self.phase = ActorPhase::Idle;
        evaluation
    }

    fn scope(&self, now: DateTime<Utc>, delta_time: Duration) -> ActorScope<'_> {
        ActorScope {
            now,
            delta_time,
            is_faulty: self.stats.is_faulty,
            inputs: &self.inputs,
            derived: &self.derived,
            slots: &self.slots,
            index: &self.index,
            constants: &self.constants,
            this: self.this.as_ref(),
        }
    }

    /// Record the current value of each windowed argument of slot `i`
    fn record_windowed(&mut self, i: usize, timestamp: DateTime<Utc>, delta_time: Duration) {
        for w in 0..self.slots[i].windowed.len() {
            let (key, arg) = &self.slots[i].windowed[w];
            let result = evaluate(arg, &self.scope(timestamp, delta_time), &self.policy);
            match result {
                Ok(value) => record_derived(
                    &mut self.derived,
                    self.retention,
                    &self.horizons,
                    key,
                    TimedValue::new(timestamp, value.to_point()),
                ),
                Err(e) => trace!(rule_instance = %self.key, "{} not recorded: {}", key, e),
            }
        }
    }

    fn observe_result(&mut self, timestamp: DateTime<Utc>) {
        let Some(slot) = self.index.get(RESULT_FIELD_ID).map(|i| &self.slots[*i]) else {
            return;
        };
        if !slot.state.is_valid() {
            self.state = slot.state.clone();
            return;
        }

        let faulted = slot.buffer.last().map(|p| Value::from(&p.value)).and_then(|v| v.as_bool());
        let Some(faulted) = faulted else {
            self.state = OutputState::invalid_output("result is not a boolean");
            return;
        };

        self.state = OutputState::Valid;
        self.stats.occurrence_count += 1;
        self.stats.first_occurrence.get_or_insert(timestamp);
        self.stats.is_faulty = faulted;
        if faulted {
            self.stats.faulted_count += 1;
            self.stats.first_faulted.get_or_insert(timestamp);
            self.stats.last_faulted = Some(timestamp);
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            equipment_id: self.key.equipment_id.clone(),
            rule_id: self.key.rule_id.clone(),
            version: self.version,
            phase: self.phase,
            state: self.state.clone(),
            stats: self.stats.clone(),
            parameters: self
                .slots
                .iter()
                .map(|s| ParameterSnapshot {
                    field_id: s.bound.field_id().to_string(),
                    unit: s.bound.parameter.unit.clone(),
                    impact: s.bound.impact,
                    state: s.state.clone(),
                    buffer: s.buffer.clone(),
                })
                .collect(),
            insight: None,
        }
    }
}

// ============================================================================
// Calculated point actor
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CalculatedSnapshot {
    pub point_id: String,
    pub phase: ActorPhase,
    pub state: OutputState,
    #[serde(skip)]
    pub buffer: TimeSeriesBuffer,
}

/// Derives one virtual sensor from its own inputs
pub struct CalculatedPointActor {
    point: Arc<CalculatedPoint>,
    expr: Option<Expr>,
    phase: ActorPhase,
    inputs: FxHashMap<Arc<str>, TimeSeriesBuffer>,
    windowed: Vec<(String, Expr)>,
    derived: FxHashMap<String, TimeSeriesBuffer>,
    horizons: Horizons,
    buffer: TimeSeriesBuffer,
    this: Option<Value>,
    retention: RetentionPolicy,
    policy: EvalPolicy,
    last_evaluated: Option<DateTime<Utc>>,
    state: OutputState,
}

impl CalculatedPointActor {
    pub fn new(point: Arc<CalculatedPoint>, retention: RetentionPolicy, policy: EvalPolicy) -> Self {
        let buffer = TimeSeriesBuffer::new(retention).with_unit(point.unit.clone());
        Self {
            point,
            expr: None,
            phase: ActorPhase::Unbound,
            inputs: FxHashMap::default(),
            windowed: Vec::new(),
            derived: FxHashMap::default(),
            horizons: Horizons::default(),
            buffer,
            this: None,
            retention,
            policy,
            last_evaluated: None,
            state: OutputState::missing("not evaluated yet"),
        }
    }

    /// `Err(reason)` leaves the point disabled
    pub fn bind(&mut self, expr: Result<Expr, String>, this: Option<Value>) {
        let mut horizons = Horizons::default();
        match expr {
            Ok(expr) => {
                horizons.add(expr.windows());
                self.windowed = windowed_arguments(&expr);
                self.expr = Some(expr);
            },
            Err(reason) => {
                self.expr = None;
                self.windowed.clear();
                self.state = OutputState::missing(reason);
            },
        }
        for (point_id, buffer) in self.inputs.iter_mut() {
            buffer.set_horizon(horizons.of_point(point_id));
        }
        self.derived.clear();
        self.horizons = horizons;
        self.this = this;
        self.phase = ActorPhase::Bound;
    }

    pub fn point_id(&self) -> &str {
        &self.point.id
    }

    pub fn phase(&self) -> ActorPhase {
        self.phase
    }

    pub fn state(&self) -> &OutputState {
        &self.state
    }

    pub fn buffer(&self) -> &TimeSeriesBuffer {
        &self.buffer
    }

    pub fn supersede(&mut self) {
        self.phase = ActorPhase::Superseded;
    }

    /// Apply a timestamp group; returns the derived value if one was appended
    pub fn apply(&mut self, timestamp: DateTime<Utc>, values: &[(Arc<str>, TimedValue)]) -> Option<TimedValue> {
        if matches!(self.phase, ActorPhase::Superseded | ActorPhase::Unbound) {
            return None;
        }
        self.phase = ActorPhase::Evaluating;
        let changed = push_inputs(&mut self.inputs, self.retention, &self.horizons, values);
        let derived = if changed.is_empty() { None } else { self.evaluate(timestamp) };
        self.phase = ActorPhase::Idle;
        derived
    }

    fn evaluate(&mut self, timestamp: DateTime<Utc>) -> Option<TimedValue> {
        let expr = self.expr.as_ref()?;
        let delta_time = self
            .last_evaluated
            .map(|last| timestamp - last)
            .unwrap_or_else(Duration::zero);
        self.last_evaluated = Some(timestamp);

        let index = FxHashMap::default();
        let constants = FxHashMap::default();
        for (key, arg) in &self.windowed {
            let result = evaluate(arg, &self.scope(timestamp, delta_time, &index, &constants), &self.policy);
            match result {
                Ok(value) => record_derived(
                    &mut self.derived,
                    self.retention,
                    &self.horizons,
                    key,
                    TimedValue::new(timestamp, value.to_point()),
                ),
                Err(e) => trace!("{}: {} not recorded: {}", self.point.id, key, e),
            }
        }
        let value = evaluate(expr, &self.scope(timestamp, delta_time, &index, &constants), &self.policy)
            .map_err(|e| OutputState::from_error(&e))
            .and_then(|v| {
                fold_cumulative(self.point.cumulative, &self.buffer, timestamp, v)
                    .map_err(OutputState::invalid_value)
            });

        match value {
            Ok(value) => {
                let point = TimedValue::new(timestamp, value.to_point());
                match self.buffer.push(point.clone()) {
                    PushOutcome::Appended => {
                        self.state = OutputState::Valid;
                        Some(point)
                    },
                    _ => {
                        self.state = OutputState::invalid_value(format!("{} is not a finite value", value));
                        None
                    },
                }
            },
            Err(state) => {
                self.state = state;
                None
            },
        }
    }

    fn scope<'a>(
        &'a self,
        now: DateTime<Utc>,
        delta_time: Duration,
        index: &'a FxHashMap<String, usize>,
        constants: &'a FxHashMap<String, Value>,
    ) -> ActorScope<'a> {
        ActorScope {
            now,
            delta_time,
            is_faulty: false,
            inputs: &self.inputs,
            derived: &self.derived,
            slots: &[],
            index,
            constants,
            this: self.this.as_ref(),
        }
    }

    pub fn snapshot(&self) -> CalculatedSnapshot {
        CalculatedSnapshot {
            point_id: self.point.id.clone(),
            phase: self.phase,
            state: self.state.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use twinrule_calc::parse;
    use twinrule_model::{RuleUIElement, UIElementKind};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    /// Bind every bracketed reference straight to a point of the same id
    fn bind_points(formula: &str) -> Expr {
        parse(formula).unwrap().transform(&mut |e| match e {
            Expr::Reference(r) => Some(Expr::Point(r.text().to_string())),
            _ => None,
        })
    }

    fn bound(field_id: &str, formula: &str) -> BoundParameter {
        let expr = bind_points(formula);
        BoundParameter {
            parameter: RuleParameter::new(field_id, formula),
            points: expr.points().into_iter().collect(),
            fields: expr.variables().into_iter().collect(),
            expr: Some(expr),
            disabled: None,
            impact: false,
        }
    }

    fn values(pairs: &[(&str, f64)], minutes: i64) -> Vec<(Arc<str>, TimedValue)> {
        pairs
            .iter()
            .map(|(id, v)| (Arc::from(*id), TimedValue::new(t(minutes), *v)))
            .collect()
    }

    fn actor(rule: Rule, params: Vec<BoundParameter>) -> RuleInstanceActor {
        let mut actor = RuleInstanceActor::new(
            InstanceKey::new("ahu-1", rule.id.clone()),
            Arc::new(rule),
            1,
            RetentionPolicy::unbounded(),
            EvalPolicy::default(),
        );
        actor.bind(params, None);
        actor
    }

    #[test]
    fn test_accumulate_running_total() {
        let mut result = bound("result", "[zone_temp] + [zone_temp_sp]");
        result.parameter.cumulative = CumulativeSetting::Accumulate;
        let mut actor = actor(Rule::new("r1", "dtmi:x;1"), vec![result]);
        assert_eq!(actor.phase(), ActorPhase::Bound);

        for (i, (a, b)) in [(3.0, 4.0), (4.0, 5.0), (5.0, 6.0)].into_iter().enumerate() {
            actor.apply(t(i as i64), &values(&[("zone_temp", a), ("zone_temp_sp", b)], i as i64));
        }
        let totals: Vec<f64> = actor.buffer("result").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(totals, vec![7.0, 16.0, 27.0]);
        assert_eq!(actor.phase(), ActorPhase::Idle);
    }

    #[test]
    fn test_accumulate_time_integrates_rate() {
        let mut energy = bound("energy", "[power]");
        energy.parameter.cumulative = CumulativeSetting::AccumulateTimeHours;
        let mut actor = actor(Rule::new("r1", "dtmi:x;1"), vec![energy]);

        actor.apply(t(0), &values(&[("power", 10.0)], 0));
        actor.apply(t(30), &values(&[("power", 10.0)], 30));
        actor.apply(t(90), &values(&[("power", 4.0)], 90));
        let totals: Vec<f64> = actor.buffer("energy").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(totals, vec![0.0, 5.0, 9.0]);
    }

    #[test]
    fn test_only_dependents_recompute() {
        let mut actor = actor(
            Rule::new("r1", "dtmi:x;1"),
            vec![bound("a", "[p1] * 2"), bound("b", "[p2] + 1"), bound("result", "a > b")],
        );
        actor.apply(t(0), &values(&[("p1", 1.0), ("p2", 1.0)], 0));
        let evaluation = actor.apply(t(1), &values(&[("p1", 5.0)], 1));

        let fields: Vec<&str> = evaluation.updates.iter().map(|u| u.field_id.as_str()).collect();
        assert_eq!(fields, vec!["a", "result"]);
        assert_eq!(actor.buffer("b").unwrap().len(), 1);
        assert!(actor.stats().is_faulty);
        assert_eq!(actor.stats().faulted_count, 1);
        assert_eq!(actor.stats().occurrence_count, 2);
    }

    #[test]
    fn test_stale_input_is_not_a_trigger() {
        let mut actor = actor(Rule::new("r1", "dtmi:x;1"), vec![bound("result", "[p1] > 0")]);
        actor.apply(t(5), &values(&[("p1", 1.0)], 5));
        let evaluation = actor.apply(t(3), &values(&[("p1", 2.0)], 3));
        assert!(evaluation.updates.is_empty());
        assert_eq!(actor.stats().trigger_count, 1);
    }

    #[test]
    fn test_invalid_parameter_does_not_stop_siblings() {
        let mut actor = actor(
            Rule::new("r1", "dtmi:x;1"),
            vec![bound("bad", "[mode] * 2"), bound("good", "[p1] + 1"), bound("uses_bad", "bad + 1")],
        );
        let mut input = values(&[("p1", 1.0)], 0);
        input.push((Arc::from("mode"), TimedValue::new(t(0), "cool")));
        actor.apply(t(0), &input);

        assert!(matches!(actor.parameter_state("bad"), Some(OutputState::InvalidValue(_))));
        assert_eq!(actor.parameter_state("good"), Some(&OutputState::Valid));
        assert!(matches!(actor.parameter_state("uses_bad"), Some(OutputState::MissingValue(_))));
    }

    #[test]
    fn test_elements_and_builtins_in_scope() {
        let mut rule = Rule::new("r1", "dtmi:x;1");
        rule.elements.push(RuleUIElement::new(UIElementKind::MaxTrigger, 20.0));
        let mut actor = actor(
            rule,
            vec![bound("result", "[sat] > max_trigger"), bound("gap", "DELTA_TIME_S + [sat] * 0"), bound("was", "IS_FAULTY")],
        );

        actor.apply(t(0), &values(&[("sat", 25.0)], 0));
        actor.apply(t(2), &values(&[("sat", 15.0)], 2));
        let gap: Vec<f64> = actor.buffer("gap").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(gap, vec![0.0, 120.0]);
        let was: Vec<f64> = actor.buffer("was").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(was, vec![0.0, 1.0]);
        assert!(!actor.stats().is_faulty);
    }

    #[test]
    fn test_windowed_expression_keeps_its_own_history() {
        let mut actor = actor(
            Rule::new("r1", "dtmi:x;1"),
            vec![bound("fallback", "MAX(1, 1d)"), bound("result", "ANY([sat] > 25, 1h)")],
        );
        for (minute, sat) in [(0, 20.0), (20, 27.0), (40, 22.0), (100, 21.0)] {
            actor.apply(t(minute), &values(&[("sat", sat)], minute));
        }

        let fallback: Vec<f64> = actor.buffer("fallback").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(fallback, vec![1.0; 4]);
        // 27 stays in the hour window until it slides out at minute 100
        let result: Vec<f64> = actor.buffer("result").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(result, vec![0.0, 1.0, 1.0, 0.0]);
        assert_eq!(actor.derived_buffer("[sat] > 25").unwrap().len(), 4);
        assert_eq!(actor.derived_buffer("1").unwrap().len(), 4);
    }

    #[test]
    fn test_nested_window_records_inner_argument_first() {
        let mut actor = actor(
            Rule::new("r1", "dtmi:x;1"),
            vec![bound("peak", "MAX(AVERAGE([p] * 2, 1h), 1d)")],
        );
        for (minute, p) in [(0, 1.0), (30, 3.0), (60, 2.0)] {
            actor.apply(t(minute), &values(&[("p", p)], minute));
        }
        // averages of the doubled series: 2, 4, 4
        let peak: Vec<f64> = actor.buffer("peak").unwrap().iter().filter_map(TimedValue::as_f64).collect();
        assert_eq!(peak, vec![2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_count_limit_keeps_what_windows_read() {
        let mut actor = RuleInstanceActor::new(
            InstanceKey::new("ahu-1", "r1"),
            Arc::new(Rule::new("r1", "dtmi:x;1")),
            1,
            RetentionPolicy::count(10),
            EvalPolicy::default(),
        );
        actor.bind(vec![bound("avg", "AVERAGE([x], 1h)"), bound("recent", "[x] + 0")], None);
        for i in 0..200 {
            actor.apply(t(i), &values(&[("x", i as f64)], i));
        }

        assert_eq!(actor.parameter_state("avg"), Some(&OutputState::Valid));
        // mean of 139..=199
        assert_eq!(actor.buffer("avg").unwrap().last().unwrap().as_f64(), Some(169.0));
        assert_eq!(actor.buffer("avg").unwrap().len(), 10);
        assert_eq!(actor.buffer("recent").unwrap().len(), 10);
    }

    #[test]
    fn test_state_text_is_truncated() {
        let state = OutputState::invalid_value("x".repeat(2 * MAX_STATE_TEXT));
        assert_eq!(state.text().len(), MAX_STATE_TEXT);
    }

    #[test]
    fn test_calculated_point_derives_from_own_inputs() {
        let mut actor = CalculatedPointActor::new(
            Arc::new(CalculatedPoint::new("CALC-DT", "[rat] - [sat]")),
            RetentionPolicy::unbounded(),
            EvalPolicy::default(),
        );
        actor.bind(Ok(bind_points("[rat] - [sat]")), None);

        assert_eq!(actor.apply(t(0), &values(&[("rat", 24.0)], 0)), None);
        assert!(matches!(actor.state(), OutputState::MissingValue(_)));
        let derived = actor.apply(t(1), &values(&[("sat", 14.0)], 1)).unwrap();
        assert_eq!(derived.as_f64(), Some(10.0));
        assert_eq!(derived.timestamp, t(1));
    }

    #[test]
    fn test_calculated_point_windows_over_expression() {
        let mut actor = CalculatedPointActor::new(
            Arc::new(CalculatedPoint::new("CALC-DT-MAX", "MAX([rat] - [sat], 1h)")),
            RetentionPolicy::unbounded(),
            EvalPolicy::default(),
        );
        actor.bind(Ok(bind_points("MAX([rat] - [sat], 1h)")), None);

        actor.apply(t(0), &values(&[("rat", 24.0), ("sat", 14.0)], 0));
        actor.apply(t(10), &values(&[("sat", 20.0)], 10));
        let derived = actor.apply(t(20), &values(&[("sat", 18.0)], 20)).unwrap();
        assert_eq!(derived.as_f64(), Some(10.0));
        assert_eq!(actor.state(), &OutputState::Valid);
    }
}
