use crate::model::Document;
use crate::resolver::Direction;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Conflict resolution strategy, selected once from configuration and
/// applied whenever the resolver reports `conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer `modified` wins; ties go to cloud. Falls back to `Manual` if
    /// either timestamp is missing or unparseable.
    LatestTimestamp,
    CloudWins,
    LocalWins,
    Manual,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "latest_timestamp" => Ok(ConflictPolicy::LatestTimestamp),
            "cloud_wins" => Ok(ConflictPolicy::CloudWins),
            "local_wins" => Ok(ConflictPolicy::LocalWins),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!("unknown conflict resolution policy: {other}")),
        }
    }
}

/// Outcome of applying a conflict policy: either a direction to proceed
/// with automatically, or a hand-off to manual review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Proceed(Direction),
    Manual,
}

/// A human-readable tag recorded on the resulting ConflictRecord,
/// explaining which side won and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    CloudWinsByTimestamp,
    LocalWinsByTimestamp,
    CloudWinsByPolicy,
    LocalWinsByPolicy,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::CloudWinsByTimestamp => "cloud_wins_by_timestamp",
            Resolution::LocalWinsByTimestamp => "local_wins_by_timestamp",
            Resolution::CloudWinsByPolicy => "cloud_wins_by_policy",
            Resolution::LocalWinsByPolicy => "local_wins_by_policy",
        }
    }
}

/// Applies `policy` to a detected conflict between `cloud` and `local`.
/// Both documents are guaranteed present by the time the resolver reports
/// `conflict` (see `resolver::resolve`), so callers pass `&Document`
/// rather than `Option<&Document>`.
pub fn decide(policy: ConflictPolicy, cloud: &Document, local: &Document) -> (PolicyDecision, Option<Resolution>) {
    match policy {
        ConflictPolicy::CloudWins => (
            PolicyDecision::Proceed(Direction::CloudToLocal),
            Some(Resolution::CloudWinsByPolicy),
        ),
        ConflictPolicy::LocalWins => (
            PolicyDecision::Proceed(Direction::LocalToCloud),
            Some(Resolution::LocalWinsByPolicy),
        ),
        ConflictPolicy::Manual => (PolicyDecision::Manual, None),
        ConflictPolicy::LatestTimestamp => {
            match (cloud.modified_at(), local.modified_at()) {
                (Some(c), Some(l)) if l > c => (
                    PolicyDecision::Proceed(Direction::LocalToCloud),
                    Some(Resolution::LocalWinsByTimestamp),
                ),
                (Some(_), Some(_)) => (
                    // Ties, and cloud-newer, both go to cloud per the spec.
                    PolicyDecision::Proceed(Direction::CloudToLocal),
                    Some(Resolution::CloudWinsByTimestamp),
                ),
                _ => (PolicyDecision::Manual, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(modified: &str) -> Document {
        Document::new(
            json!({"name": "C1", "modified": modified})
                .as_object()
                .unwrap()
                .clone(),
        )
    }

    #[test]
    fn cloud_wins_policy_always_proceeds_cloud_to_local() {
        let (decision, resolution) = decide(
            ConflictPolicy::CloudWins,
            &doc("2025-01-01T00:00:00Z"),
            &doc("2025-01-02T00:00:00Z"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::CloudToLocal));
        assert_eq!(resolution, Some(Resolution::CloudWinsByPolicy));
    }

    #[test]
    fn local_wins_policy_always_proceeds_local_to_cloud() {
        let (decision, _) = decide(
            ConflictPolicy::LocalWins,
            &doc("2025-01-01T00:00:00Z"),
            &doc("2025-01-02T00:00:00Z"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::LocalToCloud));
    }

    #[test]
    fn manual_policy_always_defers() {
        let (decision, resolution) = decide(
            ConflictPolicy::Manual,
            &doc("2025-01-01T00:00:00Z"),
            &doc("2025-01-02T00:00:00Z"),
        );
        assert_eq!(decision, PolicyDecision::Manual);
        assert_eq!(resolution, None);
    }

    #[test]
    fn latest_timestamp_picks_the_newer_side() {
        let (decision, resolution) = decide(
            ConflictPolicy::LatestTimestamp,
            &doc("2025-01-02T09:00:00Z"),
            &doc("2025-01-02T10:00:00Z"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::LocalToCloud));
        assert_eq!(resolution, Some(Resolution::LocalWinsByTimestamp));
    }

    #[test]
    fn latest_timestamp_breaks_ties_toward_cloud() {
        let (decision, resolution) = decide(
            ConflictPolicy::LatestTimestamp,
            &doc("2025-01-02T09:00:00Z"),
            &doc("2025-01-02T09:00:00Z"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::CloudToLocal));
        assert_eq!(resolution, Some(Resolution::CloudWinsByTimestamp));
    }

    #[test]
    fn latest_timestamp_auto_resolves_the_spec_s_own_timezoneless_timestamps() {
        // Scenario 3 (§8) uses timestamps with no `Z`/offset suffix; this must
        // still auto-resolve local-to-cloud, not fall back to manual.
        let (decision, resolution) = decide(
            ConflictPolicy::LatestTimestamp,
            &doc("2025-01-02T09:00:00"),
            &doc("2025-01-02T10:00:00"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::LocalToCloud));
        assert_eq!(resolution, Some(Resolution::LocalWinsByTimestamp));
    }

    #[test]
    fn latest_timestamp_auto_resolves_frappe_s_space_separated_timestamps() {
        let (decision, resolution) = decide(
            ConflictPolicy::LatestTimestamp,
            &doc("2025-01-02 09:00:00.000000"),
            &doc("2025-01-02 08:00:00.000000"),
        );
        assert_eq!(decision, PolicyDecision::Proceed(Direction::CloudToLocal));
        assert_eq!(resolution, Some(Resolution::CloudWinsByTimestamp));
    }

    #[test]
    fn latest_timestamp_falls_back_to_manual_when_unparseable() {
        let local = Document::new(
            json!({"name": "C1", "modified": "not-a-timestamp"})
                .as_object()
                .unwrap()
                .clone(),
        );
        let (decision, _) = decide(
            ConflictPolicy::LatestTimestamp,
            &doc("2025-01-02T09:00:00Z"),
            &local,
        );
        assert_eq!(decision, PolicyDecision::Manual);
    }

    #[test]
    fn policy_parses_from_configuration_strings() {
        assert_eq!(
            "latest_timestamp".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::LatestTimestamp
        );
        assert_eq!(
            "cloud-wins".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::CloudWins
        );
        assert!("nonsense".parse::<ConflictPolicy>().is_err());
    }
}
