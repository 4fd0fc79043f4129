use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

const TEMP_PREFIX: &str = "tmp-";

/// A locally generated placeholder id for an entity the server has not confirmed yet.
///
/// Temporary ids are random (v4 UUID), so they are unique across processes and never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(String);

impl TempId {
    pub fn generate() -> Self {
        Self(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TempId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The identity of an entity: either confirmed by the server or still temporary.
///
/// Serializes as a bare number for confirmed ids and as a `tmp-...` string for temporary ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityRef {
    Confirmed(i64),
    Temp(TempId),
}

impl EntityRef {
    pub fn confirmed(&self) -> Option<i64> {
        match self {
            EntityRef::Confirmed(id) => Some(*id),
            EntityRef::Temp(_) => None,
        }
    }

    pub fn temp(&self) -> Option<&TempId> {
        match self {
            EntityRef::Temp(tmp) => Some(tmp),
            EntityRef::Confirmed(_) => None,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.temp().is_some()
    }

    /// Rewrites `self` to `Confirmed(server_id)` if it currently holds `tmp`.
    pub(crate) fn resolve(&mut self, tmp: &TempId, server_id: i64) -> bool {
        if self.temp() == Some(tmp) {
            *self = EntityRef::Confirmed(server_id);
            true
        } else {
            false
        }
    }
}

impl From<i64> for EntityRef {
    fn from(id: i64) -> Self {
        EntityRef::Confirmed(id)
    }
}

impl From<TempId> for EntityRef {
    fn from(tmp: TempId) -> Self {
        EntityRef::Temp(tmp)
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Confirmed(id) => write!(f, "{id}"),
            EntityRef::Temp(tmp) => Display::fmt(tmp, f),
        }
    }
}

impl FromStr for EntityRef {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with(TEMP_PREFIX) {
            return Ok(EntityRef::Temp(TempId(s.to_string())));
        }
        s.parse::<i64>().map(EntityRef::Confirmed)
    }
}

/// The kinds of entity the engine can queue mutations for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Transaction,
    Category,
    Source,
    Target,
}

serde_plain::derive_display_from_serialize!(EntityKind);
serde_plain::derive_fromstr_from_deserialize!(EntityKind);

impl TempId {
    #[cfg(test)]
    pub(crate) fn fixed(s: &str) -> Self {
        Self(format!("{TEMP_PREFIX}{s}"))
    }
}
