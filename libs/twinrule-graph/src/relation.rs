//! Relation registry
//!
//! Relations are `(name, substance)` pairs interned into a context-owned,
//! append-only table. Structurally equal relations intern to the same
//! [`RelationId`], so identity comparison is an integer compare.
//!
//! ## Matching
//!
//! Traversal uses a looser equality than identity: names compare
//! case-insensitively and an empty substance on either side matches any
//! substance (`isFedBy` matches `isFedBy/water`).

use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Interned relation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationId(u32);

impl RelationId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Typed edge label
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    pub name: Arc<str>,
    /// Empty when the relation carries no substance
    pub substance: Arc<str>,
}

impl Relation {
    pub fn matches(&self, other: &Relation) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && (self.substance.is_empty()
                || other.substance.is_empty()
                || self.substance.eq_ignore_ascii_case(&other.substance))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.substance.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.name, self.substance)
        }
    }
}

/// Append-only relation table, safe for concurrent lookups
#[derive(Debug, Default)]
pub struct RelationRegistry {
    ids: DashMap<(String, String), RelationId>,
    relations: RwLock<Vec<Relation>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `(name, substance)`, returning the existing id when already known
    pub fn intern(&self, name: &str, substance: Option<&str>) -> RelationId {
        let substance = substance.unwrap_or("").trim();
        let key = (name.trim().to_ascii_lowercase(), substance.to_ascii_lowercase());
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }

        // entry() holds the shard lock so racing interns agree on one id
        *self.ids.entry(key).or_insert_with(|| {
            let mut relations = self.relations.write();
            let id = RelationId(relations.len() as u32);
            relations.push(Relation {
                name: Arc::from(name.trim()),
                substance: Arc::from(substance),
            });
            id
        })
    }

    pub fn get(&self, id: RelationId) -> Option<Relation> {
        self.relations.read().get(id.index()).cloned()
    }

    /// Traversal equality between two interned relations
    pub fn matches(&self, a: RelationId, b: RelationId) -> bool {
        if a == b {
            return true;
        }
        let relations = self.relations.read();
        match (relations.get(a.index()), relations.get(b.index())) {
            (Some(a), Some(b)) => a.matches(b),
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.relations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
