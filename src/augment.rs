//! Keyword augmentation: group memberships and main-keyword resolution.
//!
//! Mirrors a relational plan: explode memberships, left-join groups, collapse
//! back per keyword, then self-join for the main keyword text. The collapsed
//! name and parent lists are `", "`-joined in order of first occurrence;
//! consumers rely on that ordering.

use std::collections::HashMap;

use tracing::warn;

use crate::schema::{AugmentedKeyword, FlatGroupRow, Keyword};

const LIST_SEPARATOR: &str = ", ";

/// One (keyword, group) pair after the left join.
struct JoinedMembership<'a> {
    keyword: &'a Keyword,
    group: Option<&'a FlatGroupRow>,
}

/// Augment keywords with group names, parent ids and main keyword text.
///
/// Produces one row per distinct keyword id. When an id repeats, the last
/// record seen wins and keeps the position of the first.
pub fn augment(keywords: &[Keyword], groups: &[FlatGroupRow]) -> Vec<AugmentedKeyword> {
    let keywords = dedup_last_wins(keywords);
    let joined = join_groups(&keywords, groups);
    let mut augmented = collapse(joined);
    resolve_main_keywords(&mut augmented);
    augmented
}

fn dedup_last_wins(keywords: &[Keyword]) -> Vec<&Keyword> {
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut unique: Vec<&Keyword> = Vec::with_capacity(keywords.len());

    for keyword in keywords {
        match position.get(keyword.id.as_str()) {
            Some(&idx) => unique[idx] = keyword,
            None => {
                position.insert(&keyword.id, unique.len());
                unique.push(keyword);
            }
        }
    }

    let duplicates = keywords.len() - unique.len();
    if duplicates > 0 {
        warn!(
            "{} duplicate keyword ids across pages; keeping the last record for each",
            duplicates
        );
    }
    unique
}

/// Explode memberships and left-join them against the group table. A
/// keyword without memberships still yields one pair with no group.
fn join_groups<'a>(
    keywords: &[&'a Keyword],
    groups: &'a [FlatGroupRow],
) -> Vec<JoinedMembership<'a>> {
    let by_id: HashMap<&str, &FlatGroupRow> =
        groups.iter().map(|g| (g.group_id.as_str(), g)).collect();

    let mut joined = Vec::new();
    for &keyword in keywords {
        if keyword.group_memberships.is_empty() {
            joined.push(JoinedMembership {
                keyword,
                group: None,
            });
            continue;
        }
        for group_id in &keyword.group_memberships {
            joined.push(JoinedMembership {
                keyword,
                group: by_id.get(group_id.as_str()).copied(),
            });
        }
    }
    joined
}

/// Group joined pairs back into one row per keyword, in first-seen order.
fn collapse(joined: Vec<JoinedMembership<'_>>) -> Vec<AugmentedKeyword> {
    struct Acc<'a> {
        keyword: &'a Keyword,
        names: Vec<&'a str>,
        parents: Vec<&'a str>,
    }

    let mut order: Vec<Acc<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for pair in joined {
        let idx = *index.entry(pair.keyword.id.as_str()).or_insert_with(|| {
            order.push(Acc {
                keyword: pair.keyword,
                names: Vec::new(),
                parents: Vec::new(),
            });
            order.len() - 1
        });
        let acc = &mut order[idx];

        let Some(group) = pair.group else { continue };
        push_unique(&mut acc.names, group.group_name.as_str());
        if let Some(parent) = group.parent_id.as_deref() {
            push_unique(&mut acc.parents, parent);
        }
    }

    order
        .into_iter()
        .map(|acc| AugmentedKeyword {
            keyword_id: acc.keyword.id.clone(),
            keyword: acc.keyword.text.clone(),
            main_keyword_id: acc.keyword.main_keyword_id.clone(),
            search_volume: acc.keyword.search_volume,
            variant_flag: acc.keyword.is_variant(),
            groups: acc.keyword.group_memberships.join(","),
            group_name: acc.names.join(LIST_SEPARATOR),
            parent_group_id: acc.parents.join(LIST_SEPARATOR),
            main_keyword: None,
        })
        .collect()
}

fn push_unique<'a>(values: &mut Vec<&'a str>, value: &'a str) {
    if !value.is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

/// Look up each row's main keyword text among the fetched keywords.
fn resolve_main_keywords(rows: &mut [AugmentedKeyword]) {
    let text_by_id: HashMap<String, String> = rows
        .iter()
        .map(|r| (r.keyword_id.clone(), r.keyword.clone()))
        .collect();

    let mut dangling = 0usize;
    for row in rows.iter_mut() {
        let Some(main_id) = row.main_keyword_id.as_deref() else {
            continue;
        };
        row.main_keyword = text_by_id.get(main_id).cloned();
        if row.main_keyword.is_none() {
            dangling += 1;
        }
    }

    if dangling > 0 {
        warn!(
            "{} keywords reference a main keyword outside this fetch",
            dangling
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword(id: &str, text: &str, main: Option<&str>, groups: &[&str]) -> Keyword {
        Keyword {
            id: id.to_string(),
            text: text.to_string(),
            main_keyword_id: main.map(str::to_string),
            search_volume: Some(100),
            group_memberships: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn group(id: &str, name: &str, parent: Option<&str>) -> FlatGroupRow {
        FlatGroupRow {
            group_id: id.to_string(),
            group_name: name.to_string(),
            group_type: "folder".to_string(),
            parent_id: parent.map(str::to_string),
        }
    }

    fn abc_groups() -> Vec<FlatGroupRow> {
        vec![
            group("A", "A", None),
            group("B", "B", Some("A")),
            group("C", "C", Some("A")),
        ]
    }

    #[test]
    fn test_variant_with_shared_parent() {
        let keywords = vec![
            keyword("K1", "running shoes", None, &["B"]),
            keyword("K2", "shoes for running", Some("K1"), &["B", "C"]),
        ];
        let rows = augment(&keywords, &abc_groups());

        assert_eq!(rows.len(), 2);
        let k1 = &rows[0];
        assert_eq!(k1.keyword_id, "K1");
        assert_eq!(k1.group_name, "B");
        assert_eq!(k1.parent_group_id, "A");
        assert_eq!(k1.main_keyword, None);
        assert!(!k1.variant_flag);

        let k2 = &rows[1];
        assert_eq!(k2.group_name, "B, C");
        assert_eq!(k2.parent_group_id, "A");
        assert_eq!(k2.main_keyword.as_deref(), Some("running shoes"));
        assert!(k2.variant_flag);
        assert_eq!(k2.groups, "B,C");
    }

    #[test]
    fn test_no_memberships_yields_one_row() {
        let rows = augment(&[keyword("K1", "solo", None, &[])], &abc_groups());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].group_name, "");
        assert_eq!(rows[0].parent_group_id, "");
        assert_eq!(rows[0].groups, "");
    }

    #[test]
    fn test_dangling_main_keyword_is_null() {
        let rows = augment(&[keyword("K2", "variant", Some("K404"), &[])], &[]);

        assert_eq!(rows[0].main_keyword, None);
        assert_eq!(rows[0].main_keyword_id.as_deref(), Some("K404"));
        assert!(rows[0].variant_flag);
    }

    #[test]
    fn test_self_reference_resolves_to_itself() {
        let rows = augment(&[keyword("K1", "itself", Some("K1"), &[])], &[]);
        assert_eq!(rows[0].main_keyword.as_deref(), Some("itself"));
    }

    #[test]
    fn test_unknown_groups_are_dropped() {
        let rows = augment(&[keyword("K1", "kw", None, &["X", "C", "Y"])], &abc_groups());

        assert_eq!(rows[0].group_name, "C");
        assert_eq!(rows[0].parent_group_id, "A");
        assert_eq!(rows[0].groups, "X,C,Y");
    }

    #[test]
    fn test_root_group_has_no_parent_entry() {
        let rows = augment(&[keyword("K1", "kw", None, &["A", "B"])], &abc_groups());

        assert_eq!(rows[0].group_name, "A, B");
        assert_eq!(rows[0].parent_group_id, "A");
    }

    #[test]
    fn test_order_of_first_occurrence_not_sorted() {
        let groups = vec![
            group("1", "Zeta", Some("P2")),
            group("2", "Alpha", Some("P1")),
            group("3", "Zeta", Some("P2")),
        ];
        let rows = augment(&[keyword("K", "kw", None, &["1", "2", "3"])], &groups);

        assert_eq!(rows[0].group_name, "Zeta, Alpha");
        assert_eq!(rows[0].parent_group_id, "P2, P1");
    }

    #[test]
    fn test_duplicate_keyword_ids_last_wins() {
        let keywords = vec![
            keyword("K1", "old text", None, &["B"]),
            keyword("K2", "other", Some("K1"), &[]),
            keyword("K1", "new text", None, &["C"]),
        ];
        let rows = augment(&keywords, &abc_groups());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].keyword_id, "K1");
        assert_eq!(rows[0].keyword, "new text");
        assert_eq!(rows[0].group_name, "C");
        assert_eq!(rows[1].main_keyword.as_deref(), Some("new text"));
    }
}
