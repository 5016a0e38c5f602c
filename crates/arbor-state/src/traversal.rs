//! Materializer - deterministic traversal and replay of a version DAG
//!
//! The walk descends depth-first through sorted children but only enters a
//! child once every one of its parents has been visited, so a merge node is
//! entered exactly once, from its last-visited parent. Parents excluded from
//! the walk (or no longer stored) do not gate their children.

use std::collections::{BTreeMap, HashSet};

use arbor_core::{apply_in_place, Value, Version, VersionId};

use crate::History;

/// Every version reachable from the root, parents before children
pub fn topological_order(history: &History) -> Vec<&Version> {
    match &history.root {
        Some(root) => walk(&history.versions, root, |_| true),
        None => Vec::new(),
    }
}

/// Walk from `start`, restricted to the versions accepted by `include`
pub fn walk<'a, F>(
    versions: &'a BTreeMap<VersionId, Version>,
    start: &VersionId,
    include: F,
) -> Vec<&'a Version>
where
    F: Fn(&VersionId) -> bool,
{
    let mut order = Vec::new();
    let first = match versions.get(start) {
        Some(v) if include(start) => v,
        _ => return order,
    };

    let mut visited: HashSet<&'a VersionId> = HashSet::new();
    visited.insert(&first.id);
    order.push(first);

    // (version, index of the next child to try)
    let mut stack: Vec<(&'a Version, usize)> = vec![(first, 0)];
    while let Some(top) = stack.last_mut() {
        let version: &'a Version = top.0;
        let index = top.1;
        top.1 += 1;

        let Some(child_id) = version.children.get(index) else {
            stack.pop();
            continue;
        };
        if visited.contains(child_id) || !include(child_id) {
            continue;
        }
        let Some(child) = versions.get(child_id) else {
            continue;
        };

        let ready = child
            .parents
            .iter()
            .all(|p| visited.contains(p) || !include(p) || !versions.contains_key(p));
        if ready {
            visited.insert(&child.id);
            order.push(child);
            stack.push((child, 0));
        }
    }

    order
}

/// Apply the patches of `versions`, in order, on top of `base`
pub fn replay<'a, I>(base: &Value, versions: I) -> Value
where
    I: IntoIterator<Item = &'a Version>,
{
    let mut value = base.clone();
    for version in versions {
        for patch in &version.patches {
            apply_in_place(&mut value, patch);
        }
    }
    value
}

/// Current value of `history` replayed onto `base`
pub fn materialize(base: &Value, history: &History) -> Value {
    replay(base, topological_order(history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{KeyPath, Patch, VersionInfo};
    use serde_json::json;

    fn set(path: &str, value: Value) -> Patch {
        Patch::set(KeyPath::parse(path).unwrap(), value)
    }

    fn build(entries: &[(&str, &[&str], Vec<Patch>)]) -> History {
        let mut history = History::new();
        for (id, parents, patches) in entries {
            history
                .insert(VersionInfo::new(
                    (*id).into(),
                    parents.iter().map(|p| VersionId::from(*p)).collect(),
                    patches.clone(),
                ))
                .unwrap();
        }
        history
    }

    fn ids(order: &[&Version]) -> Vec<String> {
        order.iter().map(|v| v.id.to_string()).collect()
    }

    #[test]
    fn test_empty_history_has_no_order() {
        let history = History::new();
        assert!(topological_order(&history).is_empty());
        assert_eq!(materialize(&json!({ "a": 1 }), &history), json!({ "a": 1 }));
    }

    #[test]
    fn test_diamond_merge_visited_once() {
        // a1 -> {a2, b2} -> c3 (merge), with c3 incrementing a counter-like key
        let history = build(&[
            ("a1", &[], vec![set("n", json!(1))]),
            ("a2", &["a1"], vec![set("x", json!("a"))]),
            ("b2", &["a1"], vec![set("x", json!("b"))]),
            ("c3", &["a2", "b2"], vec![set("merged", json!(true))]),
        ]);

        let order = topological_order(&history);
        assert_eq!(ids(&order), vec!["a1", "a2", "b2", "c3"]);
    }

    #[test]
    fn test_later_sibling_branch_wins_conflict() {
        // Three-way fan-in: the deepest branch is entered before the merge
        let history = build(&[
            ("a1", &[], vec![set("foo", json!(2))]),
            ("a2", &["a1"], vec![set("foo", json!(3))]),
            ("b2", &["a1"], vec![set("foo", json!(50))]),
            ("a3", &["a2"], vec![set("bar", json!(true))]),
            ("c3", &["a2"], vec![set("corge", json!("bop"))]),
            ("b3", &["b2"], vec![set("baz", json!(true))]),
            ("c4", &["c3"], vec![set("foo", json!(100))]),
            ("d5", &["a3", "c4", "b3"], vec![]),
        ]);

        let order = topological_order(&history);
        assert_eq!(
            ids(&order),
            vec!["a1", "a2", "a3", "c3", "c4", "b2", "b3", "d5"]
        );
        assert_eq!(
            materialize(&json!({ "foo": 1 }), &history),
            json!({ "foo": 50, "bar": true, "baz": true, "corge": "bop" })
        );
    }

    #[test]
    fn test_walk_respects_include() {
        let history = build(&[
            ("a1", &[], vec![]),
            ("a2", &["a1"], vec![]),
            ("a3", &["a2"], vec![]),
        ]);
        let order = walk(&history.versions, &"a1".into(), |id| id.as_str() != "a3");
        assert_eq!(ids(&order), vec!["a1", "a2"]);
    }
}
