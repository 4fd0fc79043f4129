use crate::model::{EntityKind, EntityRef};
use serde::{Deserialize, Serialize};

/// The low-churn collections a transaction points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Category,
    Source,
    Target,
}

serde_plain::derive_display_from_serialize!(ReferenceKind);
serde_plain::derive_fromstr_from_deserialize!(ReferenceKind);

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [
        ReferenceKind::Category,
        ReferenceKind::Source,
        ReferenceKind::Target,
    ];

    /// The collection name used in remote API paths and cache keys.
    pub fn collection(&self) -> &'static str {
        match self {
            ReferenceKind::Category => "categories",
            ReferenceKind::Source => "sources",
            ReferenceKind::Target => "targets",
        }
    }
}

impl From<ReferenceKind> for EntityKind {
    fn from(kind: ReferenceKind) -> Self {
        match kind {
            ReferenceKind::Category => EntityKind::Category,
            ReferenceKind::Source => EntityKind::Source,
            ReferenceKind::Target => EntityKind::Target,
        }
    }
}

impl EntityKind {
    pub fn reference_kind(&self) -> Option<ReferenceKind> {
        match self {
            EntityKind::Transaction => None,
            EntityKind::Category => Some(ReferenceKind::Category),
            EntityKind::Source => Some(ReferenceKind::Source),
            EntityKind::Target => Some(ReferenceKind::Target),
        }
    }
}

/// A category, source or target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReferenceEntity {
    pub id: EntityRef,
    pub name: String,
}

impl ReferenceEntity {
    pub fn new(id: impl Into<EntityRef>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// True when `name` refers to this entity under case-insensitive uniqueness.
    pub fn same_name(&self, name: &str) -> bool {
        name_key(&self.name) == name_key(name)
    }
}

/// The comparison key for reference names: names are unique per owner ignoring case and
/// surrounding whitespace.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}
