//! Formula binder
//!
//! Rewrites bracketed references in a parsed formula into concrete source
//! points by walking the twin graph around a context twin (the rule's
//! equipment, or a calculated point's declared context).
//!
//! ## Resolution order
//! - `[dtmi:...;N]`: breadth-first over followed relations in both directions,
//!   up to `max_hops`; the fewest hops wins, then the lowest twin id
//! - `[Id]`: external id, then twin id, then sibling field id
//! - bare identifiers: local names stay variables, external ids become points
//! - `OPTION(a, b, ..)`: keeps only candidates that bind completely
//!
//! A formula with anything left unresolved is reported through
//! [`BoundFormula::unresolved`]; the caller disables that parameter.

use crate::graph::{NodeHandle, TwinGraph};
use crate::relation::{RelationId, RelationRegistry};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, warn};
use twinrule_calc::{Expr, Function, Reference};

// ============================================================================
// Configuration
// ============================================================================

/// Which `OPTION` candidate is tried first when several bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OptionPolicy {
    /// Declaration order
    #[default]
    FirstListed,
    /// Fewest hops from the context twin, declaration order on ties
    Nearest,
}

impl From<String> for OptionPolicy {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "first_listed" | "firstlisted" | "first" => OptionPolicy::FirstListed,
            "nearest" => OptionPolicy::Nearest,
            other => {
                warn!("Unknown option policy '{}', using first_listed", other);
                OptionPolicy::FirstListed
            },
        }
    }
}

impl From<OptionPolicy> for String {
    fn from(value: OptionPolicy) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionPolicy::FirstListed => write!(f, "first_listed"),
            OptionPolicy::Nearest => write!(f, "nearest"),
        }
    }
}

fn default_max_hops() -> usize {
    3
}

fn default_follow() -> Vec<String> {
    ["isCapabilityOf", "hostedBy", "isPartOf", "isFedBy", "locatedIn"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinderConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default)]
    pub option_policy: OptionPolicy,
    /// Relation names walked during model lookups; empty follows everything
    #[serde(default = "default_follow")]
    pub follow: Vec<String>,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            option_policy: OptionPolicy::default(),
            follow: default_follow(),
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

/// A formula after binding
#[derive(Debug, Clone, PartialEq)]
pub struct BoundFormula {
    pub expr: Expr,
    /// Source point ids the formula reads
    pub inputs: BTreeSet<String>,
    /// Tokens that could not be resolved
    pub unresolved: Vec<String>,
}

impl BoundFormula {
    pub fn is_bound(&self) -> bool {
        self.unresolved.is_empty()
    }
}

pub struct Binder<'a> {
    graph: &'a TwinGraph,
    config: &'a BinderConfig,
    registry: &'a RelationRegistry,
    follow: Vec<RelationId>,
}

impl<'a> Binder<'a> {
    pub fn new(graph: &'a TwinGraph, registry: &'a RelationRegistry, config: &'a BinderConfig) -> Self {
        let follow = config
            .follow
            .iter()
            .map(|name| registry.intern(name, None))
            .collect();
        Self {
            graph,
            config,
            registry,
            follow,
        }
    }

    pub fn graph(&self) -> &TwinGraph {
        self.graph
    }

    fn follows(&self, relation: RelationId) -> bool {
        self.follow.is_empty() || self.follow.iter().any(|f| self.registry.matches(relation, *f))
    }

    /// Nearest twin of `model_id` around `context` with its hop count
    pub fn resolve_model(&self, context: NodeHandle, model_id: &str) -> Option<(NodeHandle, usize)> {
        let mut hops: FxHashMap<NodeHandle, usize> = FxHashMap::default();
        let mut queue = VecDeque::from([context]);
        hops.insert(context, 0);

        let mut best: Option<(usize, &str, NodeHandle)> = None;
        while let Some(current) = queue.pop_front() {
            let depth = hops.get(&current).copied().unwrap_or_default();
            if best.is_some_and(|(d, _, _)| depth > d) {
                break;
            }

            let node = self.graph.node(current);
            if node.is_model(model_id) {
                let candidate = (depth, node.id.as_str(), current);
                if best.map_or(true, |b| (candidate.0, candidate.1) < (b.0, b.1)) {
                    best = Some(candidate);
                }
            }

            if depth == self.config.max_hops {
                continue;
            }
            for neighbor in self.graph.neighbors(current) {
                if !self.follows(neighbor.relation) || hops.contains_key(&neighbor.node) {
                    continue;
                }
                hops.insert(neighbor.node, depth + 1);
                queue.push_back(neighbor.node);
            }
        }

        best.map(|(depth, _, handle)| (handle, depth))
    }

    /// `[Id]`: external id, twin id, then sibling field id
    pub fn resolve_id(&self, id: &str, locals: &BTreeSet<String>) -> Option<Expr> {
        if self.graph.by_external_id(id).is_some() {
            return Some(Expr::Point(id.to_string()));
        }
        if let Some(handle) = self.graph.handle(id) {
            return Some(Expr::Point(self.graph.node(handle).point_id().to_string()));
        }
        locals.contains(id).then(|| Expr::Variable(id.to_string()))
    }

    /// Bind every reference in `expr` around `context`
    ///
    /// `locals` are the names the formula may use without binding: sibling
    /// fields, rule elements and built-in variables.
    pub fn bind(&self, context: NodeHandle, expr: &Expr, locals: &BTreeSet<String>) -> BoundFormula {
        let mut unresolved = Vec::new();
        let mut hops = 0;
        let expr = self.rewrite(context, expr, locals, &mut unresolved, &mut hops);

        if !unresolved.is_empty() {
            debug!(
                twin = %self.graph.node(context).id,
                "Unresolved tokens in '{}': {:?}",
                expr,
                unresolved
            );
        }
        BoundFormula {
            inputs: expr.points(),
            expr,
            unresolved,
        }
    }

    fn rewrite(
        &self,
        context: NodeHandle,
        expr: &Expr,
        locals: &BTreeSet<String>,
        unresolved: &mut Vec<String>,
        hops: &mut usize,
    ) -> Expr {
        expr.transform(&mut |node| match node {
            Expr::Reference(Reference::Model(model_id)) => match self.resolve_model(context, model_id) {
                Some((handle, depth)) => {
                    *hops = (*hops).max(depth);
                    Some(Expr::Point(self.graph.node(handle).point_id().to_string()))
                },
                None => {
                    unresolved.push(node.to_string());
                    None
                },
            },
            Expr::Reference(Reference::Id(id)) => {
                let resolved = self.resolve_id(id, locals);
                if resolved.is_none() {
                    unresolved.push(node.to_string());
                }
                resolved
            },
            Expr::Variable(name) if !locals.contains(name) => {
                if self.graph.by_external_id(name).is_some() {
                    Some(Expr::Point(name.clone()))
                } else {
                    unresolved.push(name.clone());
                    None
                }
            },
            Expr::Call {
                function: Function::Option,
                args,
            } => {
                let mut candidates = Vec::new();
                for (position, arg) in args.iter().enumerate() {
                    let mut missing = Vec::new();
                    let mut depth = 0;
                    let bound = self.rewrite(context, arg, locals, &mut missing, &mut depth);
                    if missing.is_empty() {
                        candidates.push((depth, position, bound));
                    }
                }

                if candidates.is_empty() {
                    unresolved.push(node.to_string());
                    return Some(node.clone());
                }
                if self.config.option_policy == OptionPolicy::Nearest {
                    candidates.sort_by_key(|(depth, position, _)| (*depth, *position));
                }
                if let Some((depth, _, _)) = candidates.first() {
                    *hops = (*hops).max(*depth);
                }
                Some(Expr::call(
                    Function::Option,
                    candidates.into_iter().map(|(_, _, e)| e).collect(),
                ))
            },
            _ => None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::graph::{RelationshipRecord, TwinNode, TwinSnapshot};
    use tracing_test::traced_test;
    use twinrule_calc::parse;

    const AHU: &str = "dtmi:com:willowinc:AirHandlingUnit;1";
    const SAT: &str = "dtmi:com:willowinc:SupplyAirTemperatureSensor;1";
    const RAT: &str = "dtmi:com:willowinc:ReturnAirTemperatureSensor;1";
    const PUMP: &str = "dtmi:com:willowinc:Pump;1";
    const FLOW: &str = "dtmi:com:willowinc:WaterFlowSensor;1";

    ///   sat-b ─isCapabilityOf─► ahu-1 ◄─isCapabilityOf─ sat-a
    ///                             │ isFedBy/water
    ///                             ▼
    ///                           pump-1 ◄─isCapabilityOf─ flow-1
    ///   zone-sat ─locatedIn─► zone-1 ─isPartOf─► ahu-1   (2 hops)
    fn graph(registry: &RelationRegistry) -> TwinGraph {
        let snapshot = TwinSnapshot {
            twins: vec![
                TwinNode::new("ahu-1", AHU),
                TwinNode::new("sat-b", SAT).with_external_id("PNT-SAT-B"),
                TwinNode::new("sat-a", SAT).with_external_id("PNT-SAT-A"),
                TwinNode::new("pump-1", PUMP),
                TwinNode::new("flow-1", FLOW).with_external_id("PNT-FLOW"),
                TwinNode::new("zone-1", "dtmi:com:willowinc:Zone;1"),
                TwinNode::new("zone-rat", RAT).with_external_id("PNT-RAT"),
                TwinNode::new("fan-1", "dtmi:com:willowinc:FanRunSensor;1").with_external_id("AHU1_FAN"),
            ],
            relationships: vec![
                RelationshipRecord::new("sat-b", "isCapabilityOf", "ahu-1"),
                RelationshipRecord::new("sat-a", "isCapabilityOf", "ahu-1"),
                RelationshipRecord::new("ahu-1", "isFedBy", "pump-1").with_substance("water"),
                RelationshipRecord::new("flow-1", "isCapabilityOf", "pump-1"),
                RelationshipRecord::new("zone-rat", "locatedIn", "zone-1"),
                RelationshipRecord::new("zone-1", "isPartOf", "ahu-1"),
                RelationshipRecord::new("fan-1", "isCapabilityOf", "ahu-1"),
            ],
        };
        TwinGraph::build(snapshot, registry).unwrap()
    }

    fn locals(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_model_reference_ties_break_on_twin_id() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let config = BinderConfig::default();
        let binder = Binder::new(&graph, &registry, &config);
        let ahu = graph.handle("ahu-1").unwrap();

        let bound = binder.bind(ahu, &parse(&format!("[{}] > 20", SAT)).unwrap(), &locals(&[]));
        assert!(bound.is_bound());
        assert_eq!(bound.inputs, locals(&["PNT-SAT-A"]));
    }

    #[test]
    fn test_model_reference_follows_substance_and_hops() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let ahu = graph.handle("ahu-1").unwrap();

        let config = BinderConfig::default();
        let binder = Binder::new(&graph, &registry, &config);
        assert_eq!(
            binder.resolve_model(ahu, FLOW),
            Some((graph.handle("flow-1").unwrap(), 2))
        );

        let narrow = BinderConfig {
            max_hops: 1,
            ..BinderConfig::default()
        };
        let binder = Binder::new(&graph, &registry, &narrow);
        assert_eq!(binder.resolve_model(ahu, FLOW), None);

        let no_water = BinderConfig {
            follow: vec!["isCapabilityOf".into()],
            ..BinderConfig::default()
        };
        let binder = Binder::new(&graph, &registry, &no_water);
        assert_eq!(binder.resolve_model(ahu, FLOW), None);
    }

    #[test]
    fn test_id_resolution_order() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let config = BinderConfig::default();
        let binder = Binder::new(&graph, &registry, &config);
        let siblings = locals(&["cost_impact"]);

        assert_eq!(
            binder.resolve_id("PNT-FLOW", &siblings),
            Some(Expr::Point("PNT-FLOW".into()))
        );
        assert_eq!(
            binder.resolve_id("sat-b", &siblings),
            Some(Expr::Point("PNT-SAT-B".into()))
        );
        assert_eq!(
            binder.resolve_id("cost_impact", &siblings),
            Some(Expr::Variable("cost_impact".into()))
        );
        assert_eq!(binder.resolve_id("nothing", &siblings), None);
    }

    #[test]
    #[traced_test]
    fn test_required_token_left_unresolved() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let config = BinderConfig::default();
        let binder = Binder::new(&graph, &registry, &config);
        let ahu = graph.handle("ahu-1").unwrap();

        let bound = binder.bind(
            ahu,
            &parse("[dtmi:com:willowinc:Damper;1] + [PNT-SAT-A]").unwrap(),
            &locals(&[]),
        );
        assert!(!bound.is_bound());
        assert_eq!(bound.unresolved, vec!["[dtmi:com:willowinc:Damper;1]".to_string()]);
        assert_eq!(bound.inputs, locals(&["PNT-SAT-A"]));
        assert!(logs_contain("Unresolved tokens"));
    }

    #[test]
    fn test_option_keeps_bindable_candidates() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let ahu = graph.handle("ahu-1").unwrap();
        let formula = parse(&format!(
            "OPTION([dtmi:com:willowinc:Damper;1], [{}], [{}])",
            RAT, SAT
        ))
        .unwrap();

        let config = BinderConfig::default();
        let bound = Binder::new(&graph, &registry, &config).bind(ahu, &formula, &locals(&[]));
        assert!(bound.is_bound());
        assert_eq!(
            bound.expr,
            Expr::call(
                Function::Option,
                vec![Expr::Point("PNT-RAT".into()), Expr::Point("PNT-SAT-A".into())]
            )
        );

        let nearest = BinderConfig {
            option_policy: OptionPolicy::Nearest,
            ..BinderConfig::default()
        };
        let bound = Binder::new(&graph, &registry, &nearest).bind(ahu, &formula, &locals(&[]));
        assert_eq!(
            bound.expr,
            Expr::call(
                Function::Option,
                vec![Expr::Point("PNT-SAT-A".into()), Expr::Point("PNT-RAT".into())]
            )
        );

        let none = parse("OPTION([dtmi:a;1], [dtmi:b;1]) + 1").unwrap();
        let bound = Binder::new(&graph, &registry, &config).bind(ahu, &none, &locals(&[]));
        assert_eq!(bound.unresolved.len(), 1);
    }

    #[test]
    fn test_bare_identifiers() {
        let registry = RelationRegistry::new();
        let graph = graph(&registry);
        let config = BinderConfig::default();
        let binder = Binder::new(&graph, &registry, &config);
        let ahu = graph.handle("ahu-1").unwrap();

        let bound = binder.bind(ahu, &parse("AHU1_FAN & setpoint > 3").unwrap(), &locals(&["setpoint"]));
        assert!(bound.is_bound());
        assert_eq!(bound.inputs, locals(&["AHU1_FAN"]));
        assert_eq!(bound.expr.variables(), locals(&["setpoint"]));

        let bound = binder.bind(ahu, &parse("typo_name + 1").unwrap(), &locals(&["setpoint"]));
        assert_eq!(bound.unresolved, vec!["typo_name".to_string()]);
    }

    #[test]
    #[traced_test]
    fn test_option_policy_fallback() {
        let config: BinderConfig = serde_json::from_str(r#"{"option_policy": "closest"}"#).unwrap();
        assert_eq!(config.option_policy, OptionPolicy::FirstListed);
        assert_eq!(config.max_hops, 3);
        assert!(logs_contain("Unknown option policy"));
    }
}
