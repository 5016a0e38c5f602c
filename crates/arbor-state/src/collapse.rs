//! Collapse engine - folds fully acknowledged history into the base
//!
//! A bubble is a region of the DAG, bounded by a single start and a single
//! end version, in which every version is acked by every quorum member and
//! every branch opened inside the region also closes inside it. The bubble's
//! versions can be replayed into the base and dropped without changing the
//! materialized view. The end version stays live and becomes the new root.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use arbor_core::{PeerId, Value, Version, VersionId};
use serde::{Deserialize, Serialize};

use crate::{replay, walk, SyncObject};

/// A history collapse ready to be applied with [`SyncObject::apply_collapse`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collapse {
    /// Base with every removed version replayed onto it
    pub new_base: Value,
    /// End of the bubble; `None` when the whole history collapsed
    pub new_root: Option<VersionId>,
    /// Removed versions, in discovery order
    pub remove_versions: Vec<VersionId>,
}

/// Find the largest bubble starting at the root of `object`.
///
/// Every removed version is acked by every member of `quorum`. Returns
/// `None` when nothing can be collapsed.
pub fn find_collapse(object: &SyncObject, quorum: &BTreeSet<PeerId>) -> Option<Collapse> {
    let acks = &object.peer_acks;
    find_collapse_by(object, |id| acks.acked_by_all(id, quorum))
}

/// Like [`find_collapse`], but only folds versions every quorum member has
/// already built past.
///
/// A version is settled once each member has acked it and at least one of
/// its children. A member that acked a child no longer holds the version as
/// a leaf, so none of its later edits can branch from it. The last version
/// is never settled and always stays live as the new root.
pub fn find_settled_collapse(
    object: &SyncObject,
    quorum: &BTreeSet<PeerId>,
) -> Option<Collapse> {
    let acks = &object.peer_acks;
    let versions = &object.history.versions;
    let settled = |id: &VersionId| {
        let Some(version) = versions.get(id) else {
            return false;
        };
        quorum.iter().all(|peer| {
            acks.has_acked(peer, id)
                && version
                    .children
                    .iter()
                    .any(|child| acks.has_acked(peer, child))
        })
    };
    find_collapse_by(object, settled)
}

/// Bubble search gated on `ready`, which decides whether a version may be
/// folded
fn find_collapse_by<F>(object: &SyncObject, ready: F) -> Option<Collapse>
where
    F: Fn(&VersionId) -> bool,
{
    let history = &object.history;
    let root = history.root.as_ref()?;

    let mut removed: Vec<VersionId> = Vec::new();
    let mut end: Option<VersionId> = Some(root.clone());
    let mut frontier = history.get(root);

    while let Some(start) = frontier {
        match explore(&history.versions, start, &ready) {
            Some(bubble) => {
                removed.extend(bubble.contains);
                end = bubble.end.clone();
                frontier = bubble.end.as_ref().and_then(|id| history.get(id));
            }
            None => break,
        }
    }

    if removed.is_empty() {
        return None;
    }

    let in_bubble: HashSet<&VersionId> = removed.iter().collect();
    let new_base = replay(
        &object.base,
        walk(&history.versions, root, |id| in_bubble.contains(id)),
    );

    Some(Collapse {
        new_base,
        new_root: end,
        remove_versions: removed,
    })
}

struct SubBubble {
    end: Option<VersionId>,
    contains: Vec<VersionId>,
}

/// Explore one bubble starting at `start`
fn explore<F>(
    versions: &BTreeMap<VersionId, Version>,
    start: &Version,
    ready: &F,
) -> Option<SubBubble>
where
    F: Fn(&VersionId) -> bool,
{
    if !ready(&start.id) {
        return None;
    }

    // No branch here: the bubble advances one version
    if start.children.len() < 2 {
        return Some(SubBubble {
            end: start.children.first().cloned(),
            contains: vec![start.id.clone()],
        });
    }

    let mut seen: HashSet<&VersionId> = HashSet::new();
    seen.insert(&start.id);
    let mut contains = vec![start.id.clone()];

    let mut branches = start.children.len() - 1;
    let mut queue: VecDeque<&Version> = VecDeque::new();
    enqueue_ready(start, versions, &seen, &mut queue);

    while let Some(version) = queue.pop_front() {
        if seen.contains(&version.id) {
            continue;
        }
        if !ready(&version.id) {
            return None;
        }

        // Every parent of a queued version was processed, so a merge of n
        // parents always closes n - 1 open branches.
        branches = branches.saturating_sub(version.parents.len().saturating_sub(1));
        branches += version.children.len().saturating_sub(1);

        if branches == 0 {
            return Some(SubBubble {
                end: Some(version.id.clone()),
                contains,
            });
        }

        seen.insert(&version.id);
        contains.push(version.id.clone());
        enqueue_ready(version, versions, &seen, &mut queue);
    }

    // Ran out of versions with branches still open
    None
}

/// Queue the children of `version` whose parents have all been processed
fn enqueue_ready<'a>(
    version: &Version,
    versions: &'a BTreeMap<VersionId, Version>,
    seen: &HashSet<&VersionId>,
    queue: &mut VecDeque<&'a Version>,
) {
    for child_id in &version.children {
        if seen.contains(child_id) {
            continue;
        }
        let Some(child) = versions.get(child_id) else {
            continue;
        };
        if child.parents.iter().all(|p| seen.contains(p)) {
            queue.push_back(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{materialize, AckTable, History};
    use arbor_core::{KeyPath, Patch};
    use proptest::prelude::*;
    use serde_json::json;

    fn set(path: &str, value: Value) -> Patch {
        Patch::set(KeyPath::parse(path).unwrap(), value)
    }

    fn ids(list: &[&str]) -> Vec<VersionId> {
        list.iter().map(|s| VersionId::from(*s)).collect()
    }

    fn quorum() -> BTreeSet<PeerId> {
        [PeerId::from("peerA"), PeerId::from("peerB")]
            .into_iter()
            .collect()
    }

    /// Build an object from (id, parents, patches) entries, in insertion order
    fn object(entries: Vec<(&str, Vec<&str>, Vec<Patch>)>) -> SyncObject {
        let mut obj = SyncObject::new(json!({ "foo": 1 }));
        for (id, parents, patches) in entries {
            obj.history
                .insert(arbor_core::VersionInfo::new(id.into(), ids(&parents), patches))
                .unwrap();
        }
        obj
    }

    fn ack_all(obj: &mut SyncObject, peer: &str, versions: &[&str]) {
        obj.peer_acks.ensure_peer(&peer.into());
        for v in versions {
            obj.peer_acks.ack(&peer.into(), &(*v).into());
        }
    }

    fn linear() -> SyncObject {
        object(vec![
            ("a1", vec![], vec![set("foo", json!(2))]),
            ("a2", vec!["a1"], vec![set("foo", json!(3))]),
            ("a3", vec!["a2"], vec![set("bar", json!(true))]),
        ])
    }

    fn two_branches() -> SyncObject {
        object(vec![
            ("a1", vec![], vec![set("foo", json!(2))]),
            ("a2", vec!["a1"], vec![set("foo", json!(3))]),
            ("a3", vec!["a2"], vec![set("bar", json!(true))]),
            ("b2", vec!["a1"], vec![set("foo", json!(0))]),
            ("b3", vec!["b2"], vec![set("baz", json!(true))]),
            ("c4", vec!["a3", "b3"], vec![]),
            ("c5", vec!["c4"], vec![set("baz", json!(false))]),
        ])
    }

    #[test]
    fn test_linear_fully_acked_collapses_everything() {
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);
        ack_all(&mut obj, "peerB", &["a1", "a2", "a3"]);

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.new_base, json!({ "foo": 3, "bar": true }));
        assert_eq!(collapse.new_root, None);
        assert_eq!(collapse.remove_versions, ids(&["a1", "a2", "a3"]));
    }

    #[test]
    fn test_settled_collapse_keeps_last_version() {
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);
        ack_all(&mut obj, "peerB", &["a1", "a2", "a3"]);

        let collapse = find_settled_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.new_base, json!({ "foo": 3 }));
        assert_eq!(collapse.new_root, Some("a3".into()));
        assert_eq!(collapse.remove_versions, ids(&["a1", "a2"]));

        // A lone root has nothing to fold
        let mut single = object(vec![("a1", vec![], vec![set("foo", json!(2))])]);
        ack_all(&mut single, "peerA", &["a1"]);
        ack_all(&mut single, "peerB", &["a1"]);
        assert_eq!(find_settled_collapse(&single, &quorum()), None);
    }

    #[test]
    fn test_settled_collapse_waits_for_acked_child() {
        // peerB holds a2 but has not seen a3 yet, so it may still branch
        // from a2
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);
        ack_all(&mut obj, "peerB", &["a1", "a2"]);

        let collapse = find_settled_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.remove_versions, ids(&["a1"]));
        assert_eq!(collapse.new_root, Some("a2".into()));

        // The literal search folds a2 as well
        let literal = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(literal.remove_versions, ids(&["a1", "a2"]));
    }

    #[test]
    fn test_settled_collapse_keeps_open_branch_point() {
        let mut obj = two_branches();
        let acked = ["a1", "a2", "a3", "b2", "b3", "c4", "c5"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);

        let collapse = find_settled_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.new_root, Some("c5".into()));
        assert_eq!(
            collapse.remove_versions,
            ids(&["a1", "a2", "b2", "a3", "b3", "c4"])
        );

        // Without c4 acked by peerB, neither branch is settled
        let mut obj = two_branches();
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &["a1", "a2", "a3", "b2", "b3"]);
        let collapse = find_settled_collapse(&obj, &quorum());
        assert_eq!(collapse, None);
    }

    #[test]
    fn test_linear_collapses_up_to_consensus() {
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);
        ack_all(&mut obj, "peerB", &["a1", "a2"]);

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.new_base, json!({ "foo": 3 }));
        assert_eq!(collapse.new_root, Some("a3".into()));
        assert_eq!(collapse.remove_versions, ids(&["a1", "a2"]));
    }

    #[test]
    fn test_no_consensus_returns_none() {
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);
        ack_all(&mut obj, "peerB", &[]);

        assert_eq!(find_collapse(&obj, &quorum()), None);
    }

    #[test]
    fn test_quorum_member_without_entry_blocks_collapse() {
        let mut obj = linear();
        ack_all(&mut obj, "peerA", &["a1", "a2", "a3"]);

        assert_eq!(find_collapse(&obj, &quorum()), None);
    }

    #[test]
    fn test_two_branches_collapse_to_merge() {
        let mut obj = two_branches();
        let acked = ["a1", "a2", "a3", "b2", "b3", "c4"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(
            collapse.new_base,
            json!({ "foo": 0, "bar": true, "baz": true })
        );
        assert_eq!(collapse.new_root, Some("c5".into()));
        assert_eq!(
            collapse.remove_versions,
            ids(&["a1", "a2", "b2", "a3", "b3", "c4"])
        );
    }

    #[test]
    fn test_three_branches_collapse_to_merge() {
        let mut obj = object(vec![
            ("a1", vec![], vec![set("foo", json!(2))]),
            ("a2", vec!["a1"], vec![set("foo", json!(3))]),
            ("a3", vec!["a2"], vec![set("bar", json!(true))]),
            ("b2", vec!["a1"], vec![set("foo", json!(50))]),
            ("b3", vec!["b2"], vec![set("baz", json!(true))]),
            ("c3", vec!["a2"], vec![set("corge", json!("bop"))]),
            ("c4", vec!["c3"], vec![set("foo", json!(100))]),
            ("d5", vec!["a3", "c4", "b3"], vec![]),
            ("d6", vec!["d5"], vec![set("baz", json!(false))]),
        ]);
        let acked = ["a1", "a2", "a3", "c3", "b2", "b3", "c4", "d5"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(
            collapse.new_base,
            json!({ "foo": 50, "bar": true, "baz": true, "corge": "bop" })
        );
        assert_eq!(collapse.new_root, Some("d6".into()));
        assert_eq!(
            collapse.remove_versions,
            ids(&["a1", "a2", "b2", "a3", "c3", "b3", "c4", "d5"])
        );
    }

    #[test]
    fn test_open_branch_only_collapses_prefix() {
        let mut obj = object(vec![
            ("a0", vec![], vec![set("foo", json!(0))]),
            ("a1", vec!["a0"], vec![set("foo", json!(2))]),
            ("a2", vec!["a1"], vec![set("foo", json!(3))]),
            ("a3", vec!["a2"], vec![set("bar", json!(true))]),
            ("b2", vec!["a1"], vec![set("foo", json!(50))]),
            ("b3", vec!["b2"], vec![set("baz", json!(true))]),
            ("c3", vec!["a2"], vec![set("corge", json!("bop"))]),
            ("d4", vec!["c3"], vec![set("foo", json!(100))]),
        ]);
        let acked = ["a0", "a1", "a2", "a3", "c3", "b2", "b3", "d4"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.new_base, json!({ "foo": 0 }));
        assert_eq!(collapse.new_root, Some("a1".into()));
        assert_eq!(collapse.remove_versions, ids(&["a0"]));
    }

    #[test]
    fn test_merge_child_of_branch_point_waits_for_all_parents() {
        // a1 -> {a9, b0}, b0 -> a9: a9 sorts first but must not be
        // processed before b0
        let mut obj = object(vec![
            ("a1", vec![], vec![set("x", json!(1))]),
            ("b0", vec!["a1"], vec![set("y", json!(2))]),
            ("a9", vec!["a1", "b0"], vec![set("z", json!(3))]),
            ("c1", vec!["a9"], vec![set("x", json!(4))]),
        ]);
        let acked = ["a1", "b0", "a9"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);
        let before = obj.view();

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        assert_eq!(collapse.remove_versions, ids(&["a1", "b0", "a9"]));
        assert_eq!(collapse.new_root, Some("c1".into()));

        obj.apply_collapse(&collapse);
        assert_eq!(obj.view(), before);
    }

    #[test]
    fn test_apply_collapse_preserves_view() {
        let mut obj = two_branches();
        let acked = ["a1", "a2", "a3", "b2", "b3", "c4"];
        ack_all(&mut obj, "peerA", &acked);
        ack_all(&mut obj, "peerB", &acked);
        let before = obj.view();

        let collapse = find_collapse(&obj, &quorum()).unwrap();
        obj.apply_collapse(&collapse);

        assert_eq!(obj.view(), before);
        assert_eq!(obj.history.root, Some("c5".into()));
        assert!(obj.history.get(&"c5".into()).unwrap().parents.is_empty());
        assert_eq!(obj.history.len(), 1);
        assert!(obj.peer_acks.acked(&"peerA".into()).unwrap().is_empty());
    }

    /// Random single-root DAG: each version picks one or two earlier parents
    fn arb_object() -> impl Strategy<Value = (SyncObject, Vec<bool>)> {
        let size = 1usize..12;
        size.prop_flat_map(|n| {
            (
                proptest::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>(), any::<bool>()), n),
                proptest::collection::vec(any::<bool>(), n),
                proptest::collection::vec(0i64..5, n),
            )
        })
        .prop_map(|(shape, acked, values)| {
            let mut history = History::new();
            let mut acks = AckTable::new();
            let peer_a = PeerId::from("peerA");
            let peer_b = PeerId::from("peerB");
            acks.ensure_peer(&peer_a);
            acks.ensure_peer(&peer_b);

            let mut created: Vec<VersionId> = Vec::new();
            for (i, (first, second, merge)) in shape.iter().enumerate() {
                let id = VersionId::from(format!("v{i:02}"));
                let mut parents = Vec::new();
                if !created.is_empty() {
                    parents.push(created[first.index(created.len())].clone());
                    let other = created[second.index(created.len())].clone();
                    if *merge && !parents.contains(&other) {
                        parents.push(other);
                    }
                }
                let key = format!("k{}", i % 3);
                let patch = set(&key, json!(values[i]));
                history
                    .insert(arbor_core::VersionInfo::new(id.clone(), parents, vec![patch]))
                    .unwrap();
                acks.ack(&peer_a, &id);
                if acked[i] {
                    acks.ack(&peer_b, &id);
                }
                created.push(id);
            }

            let obj = SyncObject {
                base: json!({}),
                history,
                peer_acks: acks,
            };
            (obj, acked)
        })
    }

    proptest! {
        #[test]
        fn prop_collapse_preserves_view((obj, _acked) in arb_object()) {
            let before = materialize(&obj.base, &obj.history);
            if let Some(collapse) = find_collapse(&obj, &quorum()) {
                for id in &collapse.remove_versions {
                    prop_assert!(obj.peer_acks.acked_by_all(id, &quorum()));
                }
                let mut collapsed = obj.clone();
                collapsed.apply_collapse(&collapse);
                prop_assert_eq!(collapsed.view(), before.clone());
            }
            if let Some(collapse) = find_settled_collapse(&obj, &quorum()) {
                prop_assert!(collapse.new_root.is_some());
                let mut collapsed = obj.clone();
                collapsed.apply_collapse(&collapse);
                prop_assert_eq!(collapsed.view(), before);
            }
        }
    }
}
