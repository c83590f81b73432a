//! Filter group resolution without a database
//!
//! Mirrors the `best_matches` stage of the usage query: among the groups whose
//! predicate holds, pick the greatest `(condition_count, group_id)`. Group
//! priority plays no part in the choice.

use meterline_common::FilterGroup;
use serde_json::{Map, Value};

/// Ranking key of a matched group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchRank<'a> {
    pub condition_count: usize,
    pub group_id: &'a str,
}

/// Rank of `group` for an event, `None` when its predicate fails
pub fn rank<'a>(properties: &Map<String, Value>, group: &'a FilterGroup) -> Option<MatchRank<'a>> {
    group.matches(properties).then(|| MatchRank {
        condition_count: group.condition_count(),
        group_id: group.id.as_str(),
    })
}

/// Id of the single best matching group, if any group matches
pub fn best_match<'a>(properties: &Map<String, Value>, groups: &'a [FilterGroup]) -> Option<&'a str> {
    groups
        .iter()
        .filter_map(|group| rank(properties, group))
        .max()
        .map(|rank| rank.group_id)
}
