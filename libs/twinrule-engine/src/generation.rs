//! Actor generations
//!
//! A [`Topology`] is everything one generation of actors needs, built
//! wholesale from a rule set and a twin graph snapshot:
//!
//! ```text
//!   RuleSet ──┐
//!             ├─► bind calculated points ─► topo-sort ─┐
//!   TwinGraph ┘                                         ├─► lanes + subscribers + permitted origins
//!             └─► instances per qualifying twin ────────┘
//!                   (parameters bound, topo-sorted)
//! ```
//!
//! Nothing here is mutated after build; a topology change means a new
//! generation.

use crate::actor::{builtin_variables, BoundParameter, InstanceKey};
use crate::error::{EngineError, Result};
use crate::loader::RuleSet;
use rustc_hash::{FxHashMap, FxHasher};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};
use twinrule_calc::{parse, Expr, Reference, Value};
use twinrule_graph::{Binder, BinderConfig, NodeHandle, RelationRegistry, TwinGraph};
use twinrule_model::{CalculatedPoint, Rule, RuleParameter};

/// Index of a telemetry lane inside its topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LaneId(pub(crate) u32);

impl LaneId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A consumer of a point's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorRef {
    Calculated(usize),
    Instance(usize),
}

#[derive(Debug, Clone)]
pub struct CalculatedSpec {
    pub point: Arc<CalculatedPoint>,
    /// `Err(reason)` when the point is disabled
    pub expr: std::result::Result<Expr, String>,
    /// Point ids read, including other calculated points
    pub inputs: BTreeSet<String>,
    pub this: Option<Value>,
    pub origins: BTreeSet<LaneId>,
}

#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub key: InstanceKey,
    pub rule: Arc<Rule>,
    /// Dependency order
    pub parameters: Vec<BoundParameter>,
    pub this: Option<Value>,
    pub inputs: BTreeSet<String>,
    pub origins: BTreeSet<LaneId>,
    /// Hash of the bound formulas, changes whenever the binding does
    pub fingerprint: u64,
}

impl InstanceSpec {
    pub fn disabled(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.parameters
            .iter()
            .filter_map(|p| p.disabled.as_deref().map(|reason| (p.field_id(), reason)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub equipment_id: String,
    pub rule_id: String,
    pub parameters: usize,
    /// (field id, reason)
    pub disabled: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalculatedReport {
    pub point_id: String,
    pub disabled: Option<String>,
}

/// Summary of a generation for `twinctl validate`
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub lanes: usize,
    pub instances: Vec<InstanceReport>,
    pub calculated: Vec<CalculatedReport>,
    /// Rules no twin qualified for
    pub unmatched_rules: Vec<String>,
}

impl ValidationReport {
    pub fn disabled_count(&self) -> usize {
        self.instances.iter().map(|i| i.disabled.len()).sum::<usize>()
            + self.calculated.iter().filter(|c| c.disabled.is_some()).count()
    }
}

pub struct Topology {
    pub calculated: Vec<CalculatedSpec>,
    pub instances: Vec<InstanceSpec>,
    /// Raw telemetry point per lane, sorted
    pub lanes: Vec<Arc<str>>,
    lane_index: FxHashMap<Arc<str>, LaneId>,
    subscribers: FxHashMap<String, Vec<ActorRef>>,
    unmatched_rules: Vec<String>,
}

/// `[CALC-ID]` and bare `CALC-ID` read the calculated point directly
fn bind_calculated_refs(expr: &Expr, calculated: &BTreeSet<String>) -> Expr {
    expr.transform(&mut |node| match node {
        Expr::Reference(Reference::Id(id)) | Expr::Variable(id) if calculated.contains(id) => {
            Some(Expr::Point(id.clone()))
        },
        _ => None,
    })
}

/// Kahn's algorithm, ready nodes taken in declaration order
///
/// Returns the order and the nodes left on a cycle.
fn topo_order(deps: &[BTreeSet<usize>]) -> (Vec<usize>, Vec<usize>) {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(BTreeSet::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        for dep in node_deps {
            dependents[*dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for dependent in &dependents[node] {
            indegree[*dependent] -= 1;
            if indegree[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }
    let cyclic = (0..n).filter(|i| indegree[*i] > 0).collect();
    (order, cyclic)
}

fn fingerprint(rule: &Rule, parameters: &[BoundParameter]) -> u64 {
    let mut hasher = FxHasher::default();
    rule.id.hash(&mut hasher);
    for p in parameters {
        p.field_id().hash(&mut hasher);
        p.parameter.cumulative.hash(&mut hasher);
        match &p.expr {
            Some(expr) => expr.to_string().hash(&mut hasher),
            None => p.disabled.hash(&mut hasher),
        }
    }
    hasher.finish()
}

impl Topology {
    pub fn build(
        rule_set: &RuleSet,
        graph: &TwinGraph,
        registry: &RelationRegistry,
        config: &BinderConfig,
    ) -> Result<Self> {
        let binder = Binder::new(graph, registry, config);
        let calculated_ids: BTreeSet<String> =
            rule_set.calculated_points.iter().map(|p| p.id.clone()).collect();

        let calculated = Self::build_calculated(rule_set, graph, &binder, &calculated_ids)?;
        let mut instances = Vec::new();
        let mut unmatched_rules = Vec::new();
        for rule in &rule_set.rules {
            let rule = Arc::new(rule.clone());
            let twins = graph.nodes_of_model(&rule.primary_model_id);
            if twins.is_empty() {
                debug!("No twin of {} for rule {}", rule.primary_model_id, rule.id);
                unmatched_rules.push(rule.id.clone());
            }
            for handle in twins {
                instances.push(Self::build_instance(&rule, handle, &binder, &calculated_ids));
            }
        }

        let mut topology = Self {
            calculated,
            instances,
            lanes: Vec::new(),
            lane_index: FxHashMap::default(),
            subscribers: FxHashMap::default(),
            unmatched_rules,
        };
        topology.route(&calculated_ids);

        info!(
            "Built generation: {} rule instances, {} calculated points, {} lanes",
            topology.instances.len(),
            topology.calculated.len(),
            topology.lanes.len()
        );
        Ok(topology)
    }

    fn build_calculated(
        rule_set: &RuleSet,
        graph: &TwinGraph,
        binder: &Binder<'_>,
        calculated_ids: &BTreeSet<String>,
    ) -> Result<Vec<CalculatedSpec>> {
        let locals: BTreeSet<String> = builtin_variables().iter().map(|s| s.to_string()).collect();
        let mut specs = Vec::with_capacity(rule_set.calculated_points.len());

        for point in &rule_set.calculated_points {
            let context = point.context_twin_id.as_deref().and_then(|id| graph.handle(id));
            let this = context.map(|h| Value::Json(graph.node(h).this_value()));
            let expr = match (parse(&point.formula), context) {
                (Err(e), _) => Err(format!("parse error: {}", e)),
                (Ok(_), None) => Err("no context twin".to_string()),
                (Ok(expr), Some(context)) => {
                    let expr = bind_calculated_refs(&expr, calculated_ids);
                    let bound = binder.bind(context, &expr, &locals);
                    if bound.is_bound() {
                        Ok(bound.expr)
                    } else {
                        Err(format!("unresolved: {}", bound.unresolved.join(", ")))
                    }
                },
            };
            if let Err(reason) = &expr {
                warn!("Calculated point {} disabled: {}", point.id, reason);
            }
            specs.push(CalculatedSpec {
                inputs: expr.as_ref().map(Expr::points).unwrap_or_default(),
                point: Arc::new(point.clone()),
                expr,
                this,
                origins: BTreeSet::new(),
            });
        }

        let position: FxHashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.point.id.as_str(), i))
            .collect();
        let deps: Vec<BTreeSet<usize>> = specs
            .iter()
            .map(|s| s.inputs.iter().filter_map(|i| position.get(i.as_str()).copied()).collect())
            .collect();
        let (order, cyclic) = topo_order(&deps);
        if !cyclic.is_empty() {
            let mut ids: Vec<String> = cyclic.iter().map(|i| specs[*i].point.id.clone()).collect();
            ids.sort();
            return Err(EngineError::Cycle(ids));
        }

        let mut slots: Vec<Option<CalculatedSpec>> = specs.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    fn build_instance(
        rule: &Arc<Rule>,
        handle: NodeHandle,
        binder: &Binder<'_>,
        calculated_ids: &BTreeSet<String>,
    ) -> InstanceSpec {
        let twin = binder.graph().node(handle);
        let key = InstanceKey::new(twin.id.clone(), rule.id.clone());

        let mut locals: BTreeSet<String> = rule.all_parameters().map(|p| p.field_id.clone()).collect();
        locals.extend(rule.elements.iter().map(|e| e.field_id().to_string()));
        locals.extend(builtin_variables().iter().map(|s| s.to_string()));

        let declared: Vec<&RuleParameter> = rule.all_parameters().collect();
        let mut parameters: Vec<BoundParameter> = declared
            .iter()
            .map(|parameter| {
                let (expr, disabled) = match parse(&parameter.formula) {
                    Err(e) => (None, Some(format!("parse error: {}", e))),
                    Ok(expr) => {
                        let expr = bind_calculated_refs(&expr, calculated_ids);
                        let bound = binder.bind(handle, &expr, &locals);
                        if bound.is_bound() {
                            (Some(bound.expr), None)
                        } else {
                            (None, Some(format!("unresolved: {}", bound.unresolved.join(", "))))
                        }
                    },
                };
                let (points, fields) = expr
                    .as_ref()
                    .map(|e| (e.points(), e.variables()))
                    .unwrap_or_default();
                BoundParameter {
                    parameter: (*parameter).clone(),
                    impact: rule.is_impact_score(&parameter.field_id),
                    expr,
                    disabled,
                    points,
                    fields,
                }
            })
            .collect();

        let position: FxHashMap<&str, usize> = declared
            .iter()
            .enumerate()
            .map(|(i, p)| (p.field_id.as_str(), i))
            .collect();
        let deps: Vec<BTreeSet<usize>> = parameters
            .iter()
            .map(|p| p.fields.iter().filter_map(|f| position.get(f.as_str()).copied()).collect())
            .collect();
        let (order, cyclic) = topo_order(&deps);
        for i in &cyclic {
            let p = &mut parameters[*i];
            p.expr = None;
            p.disabled = Some("circular reference".to_string());
        }

        let mut slots: Vec<Option<BoundParameter>> = parameters.into_iter().map(Some).collect();
        let parameters: Vec<BoundParameter> = order
            .into_iter()
            .chain(cyclic)
            .filter_map(|i| slots[i].take())
            .collect();

        for p in parameters.iter().filter(|p| p.disabled.is_some()) {
            warn!(
                rule_instance = %key,
                "Parameter {} disabled: {}",
                p.field_id(),
                p.disabled.as_deref().unwrap_or_default()
            );
        }

        let inputs = parameters
            .iter()
            .filter(|p| p.disabled.is_none())
            .flat_map(|p| p.points.iter().cloned())
            .collect();
        InstanceSpec {
            fingerprint: fingerprint(rule, &parameters),
            this: Some(Value::Json(twin.this_value())),
            key,
            rule: rule.clone(),
            parameters,
            inputs,
            origins: BTreeSet::new(),
        }
    }

    /// Lanes, subscribers and the lanes each actor may hear from
    fn route(&mut self, calculated_ids: &BTreeSet<String>) {
        let raw: BTreeSet<&String> = self
            .calculated
            .iter()
            .map(|c| &c.inputs)
            .chain(self.instances.iter().map(|i| &i.inputs))
            .flatten()
            .filter(|id| !calculated_ids.contains(*id))
            .collect();
        self.lanes = raw.into_iter().map(|id| Arc::from(id.as_str())).collect();
        self.lane_index = self
            .lanes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), LaneId(i as u32)))
            .collect();

        let mut subscribers: BTreeMap<String, BTreeSet<ActorRef>> = BTreeMap::new();
        let mut calc_origins: FxHashMap<String, BTreeSet<LaneId>> = FxHashMap::default();

        // calculated points are already in dependency order
        for (index, spec) in self.calculated.iter_mut().enumerate() {
            let mut origins = BTreeSet::new();
            for input in &spec.inputs {
                subscribers.entry(input.clone()).or_default().insert(ActorRef::Calculated(index));
                match self.lane_index.get(input.as_str()) {
                    Some(lane) => {
                        origins.insert(*lane);
                    },
                    None => origins.extend(calc_origins.get(input).into_iter().flatten().copied()),
                }
            }
            calc_origins.insert(spec.point.id.clone(), origins.clone());
            spec.origins = origins;
        }

        for (index, spec) in self.instances.iter_mut().enumerate() {
            let mut origins = BTreeSet::new();
            for input in &spec.inputs {
                subscribers.entry(input.clone()).or_default().insert(ActorRef::Instance(index));
                match self.lane_index.get(input.as_str()) {
                    Some(lane) => {
                        origins.insert(*lane);
                    },
                    None => origins.extend(calc_origins.get(input).into_iter().flatten().copied()),
                }
            }
            spec.origins = origins;
        }

        self.subscribers = subscribers
            .into_iter()
            .map(|(point, actors)| (point, actors.into_iter().collect()))
            .collect();
    }

    pub fn lane(&self, point_id: &str) -> Option<LaneId> {
        self.lane_index.get(point_id).copied()
    }

    /// Actors reading `point_id`, calculated points first
    pub fn subscribers(&self, point_id: &str) -> &[ActorRef] {
        self.subscribers.get(point_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn instance(&self, equipment_id: &str, rule_id: &str) -> Option<&InstanceSpec> {
        self.instances
            .iter()
            .find(|i| i.key.equipment_id == equipment_id && i.key.rule_id == rule_id)
    }

    pub fn report(&self) -> ValidationReport {
        ValidationReport {
            lanes: self.lanes.len(),
            instances: self
                .instances
                .iter()
                .map(|i| InstanceReport {
                    equipment_id: i.key.equipment_id.clone(),
                    rule_id: i.key.rule_id.clone(),
                    parameters: i.parameters.len(),
                    disabled: i.disabled().map(|(f, r)| (f.to_string(), r.to_string())).collect(),
                })
                .collect(),
            calculated: self
                .calculated
                .iter()
                .map(|c| CalculatedReport {
                    point_id: c.point.id.clone(),
                    disabled: c.expr.as_ref().err().cloned(),
                })
                .collect(),
            unmatched_rules: self.unmatched_rules.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
pub(crate) mod tests {
    use super::*;
    use twinrule_graph::{RelationshipRecord, TwinNode, TwinSnapshot};

    pub(crate) const AHU: &str = "dtmi:com:willowinc:AirHandlingUnit;1";
    pub(crate) const SAT: &str = "dtmi:com:willowinc:SupplyAirTemperatureSensor;1";
    pub(crate) const RAT: &str = "dtmi:com:willowinc:ReturnAirTemperatureSensor;1";

    pub(crate) fn snapshot() -> TwinSnapshot {
        TwinSnapshot {
            twins: vec![
                TwinNode::new("ahu-1", AHU),
                TwinNode::new("ahu-2", AHU),
                TwinNode::new("sat-1", SAT).with_external_id("AHU1_SAT"),
                TwinNode::new("rat-1", RAT).with_external_id("AHU1_RAT"),
                TwinNode::new("sat-2", SAT).with_external_id("AHU2_SAT"),
            ],
            relationships: vec![
                RelationshipRecord::new("sat-1", "isCapabilityOf", "ahu-1"),
                RelationshipRecord::new("rat-1", "isCapabilityOf", "ahu-1"),
                RelationshipRecord::new("sat-2", "isCapabilityOf", "ahu-2"),
            ],
        }
    }

    fn build(rule_set: &RuleSet) -> Result<Topology> {
        let registry = RelationRegistry::new();
        let graph = TwinGraph::build(snapshot(), &registry)?;
        Topology::build(rule_set, &graph, &registry, &BinderConfig::default())
    }

    fn delta_point() -> CalculatedPoint {
        let mut point = CalculatedPoint::new("AHU1_DT", format!("[{}] - [{}]", RAT, SAT));
        point.context_twin_id = Some("ahu-1".into());
        point
    }

    #[test]
    fn test_instances_per_qualifying_twin() {
        let mut rule = Rule::new("sat-high", AHU);
        rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
        rule.parameters.push(RuleParameter::new("result", "sat > 30"));
        let topology = build(&RuleSet::new(vec![rule], vec![])).unwrap();

        assert_eq!(topology.instances.len(), 2);
        let ahu2 = topology.instance("ahu-2", "sat-high").unwrap();
        assert_eq!(ahu2.inputs, BTreeSet::from(["AHU2_SAT".to_string()]));
        assert_eq!(topology.lanes.len(), 2);
        assert_eq!(topology.subscribers("AHU1_SAT"), &[ActorRef::Instance(0)]);
    }

    #[test]
    fn test_parameters_sorted_by_dependency() {
        let mut rule = Rule::new("r", AHU);
        rule.parameters.push(RuleParameter::new("result", "diff > 5"));
        rule.parameters.push(RuleParameter::new("diff", "rat - sat"));
        rule.parameters.push(RuleParameter::new("sat", format!("[{}]", SAT)));
        rule.parameters.push(RuleParameter::new("rat", format!("[{}]", RAT)));
        let topology = build(&RuleSet::new(vec![rule], vec![])).unwrap();

        let order: Vec<&str> = topology.instances[0].parameters.iter().map(|p| p.field_id()).collect();
        assert_eq!(order, vec!["sat", "rat", "diff", "result"]);
    }

    #[test]
    fn test_unbindable_and_cyclic_parameters_are_disabled() {
        let mut rule = Rule::new("r", AHU);
        rule.parameters.push(RuleParameter::new("a", "b + 1"));
        rule.parameters.push(RuleParameter::new("b", "a + 1"));
        rule.parameters.push(RuleParameter::new("rat", format!("[{}]", RAT)));
        rule.parameters.push(RuleParameter::new("result", "rat > 1"));
        let topology = build(&RuleSet::new(vec![rule], vec![])).unwrap();

        let ahu2 = topology.instance("ahu-2", "r").unwrap();
        let disabled: BTreeMap<&str, &str> = ahu2.disabled().collect();
        assert_eq!(disabled.get("a"), Some(&"circular reference"));
        assert_eq!(disabled.get("b"), Some(&"circular reference"));
        assert!(disabled.get("rat").unwrap().starts_with("unresolved"));
        assert!(!disabled.contains_key("result"));
        assert_eq!(topology.report().disabled_count(), 2 + 3);
    }

    #[test]
    fn test_calculated_point_origins_flow_to_rules() {
        let mut rule = Rule::new("dt-low", AHU);
        rule.parameters.push(RuleParameter::new("result", "[AHU1_DT] < 2"));
        let topology = build(&RuleSet::new(vec![rule], vec![delta_point()])).unwrap();

        let rat = topology.lane("AHU1_RAT").unwrap();
        let sat = topology.lane("AHU1_SAT").unwrap();
        assert_eq!(topology.calculated[0].origins, BTreeSet::from([rat, sat]));

        let ahu1 = topology.instance("ahu-1", "dt-low").unwrap();
        assert_eq!(ahu1.origins, BTreeSet::from([rat, sat]));
        assert_eq!(topology.subscribers("AHU1_DT"), &[ActorRef::Instance(0), ActorRef::Instance(1)]);
        assert!(topology.lane("AHU1_DT").is_none());
    }

    #[test]
    fn test_calculated_cycle_is_rejected() {
        let mut a = CalculatedPoint::new("CALC_A", "[CALC_B] + 1");
        a.context_twin_id = Some("ahu-1".into());
        let mut b = CalculatedPoint::new("CALC_B", "[CALC_A] + 1");
        b.context_twin_id = Some("ahu-1".into());

        match build(&RuleSet::new(vec![], vec![a, b])) {
            Err(EngineError::Cycle(ids)) => assert_eq!(ids, vec!["CALC_A", "CALC_B"]),
            other => panic!("expected cycle, got {:?}", other.map(|t| t.lanes)),
        }
    }

    #[test]
    fn test_fingerprint_tracks_binding() {
        let mut rule = Rule::new("r", AHU);
        rule.parameters.push(RuleParameter::new("result", format!("[{}] > 30", SAT)));
        let topology = build(&RuleSet::new(vec![rule], vec![])).unwrap();
        let (a, b) = (&topology.instances[0], &topology.instances[1]);
        assert_ne!(a.fingerprint, b.fingerprint);

        let again = build(&RuleSet::new(vec![a.rule.as_ref().clone()], vec![])).unwrap();
        assert_eq!(again.instances[0].fingerprint, a.fingerprint);
    }
}
