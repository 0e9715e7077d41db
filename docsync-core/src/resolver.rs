use crate::hash::hash_optional;
use crate::model::Document;
use crate::state::models::SyncRecord;
use serde::{Deserialize, Serialize};

/// Which side writes to whom, or that no write is needed, or that both
/// sides have independently diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CloudToLocal,
    LocalToCloud,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::CloudToLocal => "c->l",
            Direction::LocalToCloud => "l->c",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the pure direction-resolution function, §4.3 of the
/// specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    None,
    Direction(Direction),
    Conflict,
    /// Neither side has the document; the sync record may be pruned.
    Skip,
}

/// A webhook-derived hint about which direction probably applies. Accepted
/// only when consistent with the decision table — never allowed to
/// override it, so a spurious webhook cannot force the wrong direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionHint {
    Cloud,
    Local,
    None,
}

/// Pure decision function over (cloud doc, local doc, sync record) per the
/// table in §4.3. `hint` is accepted informationally but never changes the
/// outcome - it exists for callers to assert their own expectations, not
/// for this function to special-case on.
pub fn resolve(
    cloud: Option<&Document>,
    local: Option<&Document>,
    record: &SyncRecord,
    excluded_fields: &[String],
    _hint: DirectionHint,
) -> Resolution {
    match (cloud, local) {
        (None, None) => Resolution::Skip,
        (Some(_), None) => Resolution::Direction(Direction::CloudToLocal),
        (None, Some(_)) => Resolution::Direction(Direction::LocalToCloud),
        (Some(c), Some(l)) => {
            let h_c = hash_optional(Some(c), excluded_fields);
            let h_l = hash_optional(Some(l), excluded_fields);

            let cloud_changed = h_c != record.cloud_hash;
            let local_changed = h_l != record.local_hash;

            match (cloud_changed, local_changed) {
                (false, false) => Resolution::None,
                (true, false) => Resolution::Direction(Direction::CloudToLocal),
                (false, true) => Resolution::Direction(Direction::LocalToCloud),
                (true, true) => Resolution::Conflict,
            }
        }
    }
}
