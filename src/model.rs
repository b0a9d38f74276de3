//! Core data types shared by the stores, the dispatcher and the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ReactionId = Uuid;
pub type FactId = Uuid;

/// An entity that gives or receives reactions: `(type_tag, id)`.
///
/// Opaque to the engine. Written as `type_tag:id`, e.g. `User:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub type_tag: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(type_tag: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_tag, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tag, id)) if !tag.is_empty() && !id.is_empty() => Ok(Self::new(tag, id)),
            _ => Err(format!("expected `type:id`, got {s:?}")),
        }
    }
}

/// A catalog entry: the weight a reaction of this type contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionType {
    pub name: String,
    pub weight: i64,
    pub active: bool,
}

/// Uniqueness key of an active reaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReactionKey {
    pub reacter: EntityRef,
    pub reactant: EntityRef,
    pub type_name: String,
}

impl ReactionKey {
    pub fn new(reacter: EntityRef, reactant: EntityRef, type_name: impl Into<String>) -> Self {
        Self {
            reacter,
            reactant,
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for ReactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.reacter, self.type_name, self.reactant)
    }
}

/// One active reaction. Immutable; removal is a hard delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub reacter: EntityRef,
    pub reactant: EntityRef,
    pub type_name: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    pub fn key(&self) -> ReactionKey {
        ReactionKey::new(
            self.reacter.clone(),
            self.reactant.clone(),
            self.type_name.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactKind {
    Added,
    Removed,
}

/// A domain fact emitted by a Reaction Store write.
///
/// `id` is the deduplication key for aggregate updates: redelivering the
/// same fact must not change an aggregate twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub kind: FactKind,
    pub reaction: Reaction,
    /// Weight of the reaction type when the fact was recorded.
    pub weight: i64,
    pub recorded_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(kind: FactKind, reaction: Reaction, weight: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            reaction,
            weight,
            recorded_at: Utc::now(),
        }
    }

    pub fn reactant(&self) -> &EntityRef {
        &self.reaction.reactant
    }

    /// Count and weight deltas this fact applies to its aggregates.
    pub fn deltas(&self) -> (i64, i64) {
        match self.kind {
            FactKind::Added => (1, self.weight),
            FactKind::Removed => (-1, -self.weight),
        }
    }
}

/// Aggregate partition: every type, or a single one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    All,
    Type(String),
}

impl Scope {
    /// Column value used by the SQLite stores. Type names are never empty.
    pub(crate) fn as_column(&self) -> &str {
        match self {
            Scope::All => "",
            Scope::Type(name) => name,
        }
    }

    pub(crate) fn from_column(value: String) -> Self {
        if value.is_empty() {
            Scope::All
        } else {
            Scope::Type(value)
        }
    }

    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Type(name) => name == type_name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("all"),
            Scope::Type(name) => f.write_str(name),
        }
    }
}

/// Cached summary of a reactant's reactions within one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub scope: Scope,
    pub count: i64,
    pub weight: i64,
    /// A weight edit touched this reactant since its last recount.
    pub stale: bool,
}

impl Aggregate {
    pub fn zero(scope: Scope) -> Self {
        Self {
            scope,
            count: 0,
            weight: 0,
            stale: false,
        }
    }
}
