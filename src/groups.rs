//! Group hierarchy flattening.
//!
//! Groups arrive as a forest of nested folders/tags. Downstream joins only
//! need `(id, name, type, parent id)`, so the tree is walked once with an
//! explicit stack and emitted parent-before-children. The walk has no depth
//! limit of its own; the body parse does (see `rank_tracker::decode_body`).

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::StructureError;
use crate::schema::{id_string, FlatGroupRow};

/// A group as delivered by the groups endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupNode {
    #[serde(default)]
    pub group_id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub group_type: Option<String>,
    /// Absent on leaves.
    #[serde(default)]
    pub subgroups: Option<Vec<GroupNode>>,
}

/// Flatten a group forest into one row per node.
///
/// Fails if any node lacks an id. A repeated id keeps its first row.
pub fn flatten(roots: &[GroupNode]) -> Result<Vec<FlatGroupRow>, StructureError> {
    let mut rows = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates = 0usize;

    // (node, parent id, depth); reversed so siblings pop in document order
    let mut stack: Vec<(&GroupNode, Option<String>, usize)> =
        roots.iter().rev().map(|node| (node, None, 0)).collect();

    while let Some((node, parent_id, depth)) = stack.pop() {
        let group_id = node
            .group_id
            .as_ref()
            .and_then(id_string)
            .ok_or_else(|| StructureError::MissingGroupId {
                depth,
                name: node.name.clone(),
            })?;

        if let Some(children) = &node.subgroups {
            for child in children.iter().rev() {
                stack.push((child, Some(group_id.clone()), depth + 1));
            }
        }

        if !seen.insert(group_id.clone()) {
            duplicates += 1;
            continue;
        }

        rows.push(FlatGroupRow {
            group_id,
            group_name: node.name.clone().unwrap_or_default(),
            group_type: node.group_type.clone().unwrap_or_default(),
            parent_id,
        });
    }

    if duplicates > 0 {
        warn!("Skipped {} repeated group ids while flattening", duplicates);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: u64, name: &str, children: Vec<GroupNode>) -> GroupNode {
        GroupNode {
            group_id: Some(json!(id)),
            name: Some(name.to_string()),
            group_type: Some("folder".to_string()),
            subgroups: if children.is_empty() {
                None
            } else {
                Some(children)
            },
        }
    }

    fn parent_of<'a>(rows: &'a [FlatGroupRow], id: &str) -> Option<&'a str> {
        rows.iter()
            .find(|r| r.group_id == id)
            .and_then(|r| r.parent_id.as_deref())
    }

    #[test]
    fn test_flatten_forest() {
        let roots = vec![
            node(1, "A", vec![node(2, "B", vec![node(4, "D", vec![])]), node(3, "C", vec![])]),
            node(5, "E", vec![]),
        ];
        let rows = flatten(&roots).unwrap();

        assert_eq!(rows.len(), 5);
        let ids: Vec<&str> = rows.iter().map(|r| r.group_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "4", "3", "5"]);
        assert_eq!(parent_of(&rows, "1"), None);
        assert_eq!(parent_of(&rows, "2"), Some("1"));
        assert_eq!(parent_of(&rows, "3"), Some("1"));
        assert_eq!(parent_of(&rows, "4"), Some("2"));
        assert_eq!(parent_of(&rows, "5"), None);
    }

    #[test]
    fn test_flatten_from_json() {
        let roots: Vec<GroupNode> = serde_json::from_value(json!([
            {"group_id": "10", "name": "Brand", "type": "folder", "subgroups": [
                {"group_id": 11, "name": "Shoes", "type": "tag", "subgroups": []},
                {"group_id": 12}
            ]}
        ]))
        .unwrap();
        let rows = flatten(&roots).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].group_type, "tag");
        assert_eq!(rows[2].group_name, "");
        assert_eq!(rows[2].group_type, "");
        assert_eq!(rows[2].parent_id.as_deref(), Some("10"));
    }

    #[test]
    fn test_missing_id_fails() {
        let roots = vec![node(
            1,
            "A",
            vec![GroupNode {
                name: Some("nameless".to_string()),
                ..GroupNode::default()
            }],
        )];
        let err = flatten(&roots).unwrap_err();
        assert!(matches!(
            err,
            StructureError::MissingGroupId { depth: 1, .. }
        ));
    }

    #[test]
    fn test_repeated_id_emitted_once() {
        let roots = vec![node(1, "A", vec![node(2, "B", vec![])]), node(2, "B again", vec![])];
        let rows = flatten(&roots).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].group_name, "B");
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut current = node(0, "leaf", vec![]);
        for id in 1..=20_000 {
            current = node(id, "level", vec![current]);
        }
        let rows = flatten(std::slice::from_ref(&current)).unwrap();

        assert_eq!(rows.len(), 20_001);
        assert_eq!(rows[0].group_id, "20000");
        assert_eq!(rows[0].parent_id, None);
        assert_eq!(rows[20_000].parent_id.as_deref(), Some("1"));

        // Drop iteratively; the derived Drop would recurse 20k levels.
        let mut next = current.subgroups.take();
        while let Some(mut children) = next {
            next = children.pop().and_then(|mut child| child.subgroups.take());
        }
    }

    #[test]
    fn test_empty_forest() {
        assert!(flatten(&[]).unwrap().is_empty());
    }
}
