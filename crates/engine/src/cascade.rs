//! Cascade deletion of strong references
//!
//! When an edit or delete drops the last strong reference an object held
//! to another, the target is deleted too. The rule compares the two sides
//! of a change:
//!
//! - from `prev`, every `[path, ref]` whose declared field type is strong;
//! - from `next`, every `[path, ref]` (regardless of strength).
//!
//! A strong `[path, ref]` of `prev` survives when the same target is still
//! strongly referenced anywhere in `next`, or when the same `(path, id)`
//! pair exists in `next` at any strength. Everything else is scheduled for
//! deletion through the database's normal delete path, outside the row
//! lock of the parent write.

use rustc_hash::FxHashSet;
use torus_core::{Oid, Schema, WebObject};

/// Ids to delete after a `(prev, next)` change commits.
///
/// Deduplicated, in `prev` declaration order. The recursion downstream
/// terminates because every cascade deletes a distinct id out of a finite
/// object set.
pub fn cascade_targets(
    schema: &Schema,
    prev: Option<&WebObject>,
    next: Option<&WebObject>,
) -> Vec<Oid> {
    let Some(prev) = prev else {
        return Vec::new();
    };
    let prev_strong = schema.strong_refs(&prev.data);
    if prev_strong.is_empty() {
        return Vec::new();
    }

    let (next_strong_ids, next_pairs) = match next {
        Some(next) => {
            let strong: FxHashSet<Oid> = schema
                .strong_refs(&next.data)
                .into_iter()
                .map(|(_, id)| id)
                .collect();
            let mut all = Vec::new();
            for (field, value) in &next.data {
                value.collect_refs(field, &mut all);
            }
            let pairs: FxHashSet<(String, Oid)> = all.into_iter().collect();
            (strong, pairs)
        }
        None => (FxHashSet::default(), FxHashSet::default()),
    };

    let mut seen = FxHashSet::default();
    let mut targets = Vec::new();
    for (path, id) in prev_strong {
        if next_strong_ids.contains(&id) {
            continue; // still strongly held somewhere
        }
        if next_pairs.contains(&(path.clone(), id)) {
            continue; // same slot still points at the target
        }
        if seen.insert(id) {
            targets.push(id);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use torus_core::{FieldType, Value};

    fn schema() -> Schema {
        Schema::new()
            .with_field("child", FieldType::Ref { strong: true })
            .with_field("sibling", FieldType::Ref { strong: true })
            .with_field("link", FieldType::Ref { strong: false })
    }

    fn object(fields: &[(&str, Value)]) -> WebObject {
        WebObject::draft(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_dropped_strong_ref_cascades() {
        let prev = object(&[("child", Value::Ref(9))]);
        let next = object(&[]);
        assert_eq!(cascade_targets(&schema(), Some(&prev), Some(&next)), vec![9]);
    }

    #[test]
    fn test_delete_cascades_all_strong_refs() {
        let prev = object(&[("child", Value::Ref(9)), ("sibling", Value::Ref(10))]);
        assert_eq!(cascade_targets(&schema(), Some(&prev), None), vec![9, 10]);
    }

    #[test]
    fn test_kept_strong_ref_survives() {
        let prev = object(&[("child", Value::Ref(9))]);
        let next = object(&[("child", Value::Ref(9))]);
        assert!(cascade_targets(&schema(), Some(&prev), Some(&next)).is_empty());
    }

    #[test]
    fn test_moved_strong_ref_survives() {
        // The target moved to a different strong field
        let prev = object(&[("child", Value::Ref(9))]);
        let next = object(&[("sibling", Value::Ref(9))]);
        assert!(cascade_targets(&schema(), Some(&prev), Some(&next)).is_empty());
    }

    #[test]
    fn test_demoted_ref_on_same_path_survives() {
        // Same (path, id) pair, now under a weak declaration: the record
        // keeps pointing there, so no cascade
        let weak_now = Schema::new()
            .with_field("child", FieldType::Ref { strong: false })
            .with_field("sibling", FieldType::Ref { strong: true });
        let prev = object(&[("child", Value::Ref(9))]);
        let next = object(&[("child", Value::Ref(9))]);
        // prev is judged under the old schema
        let mut targets = cascade_targets(&schema(), Some(&prev), Some(&next));
        // next's (child, 9) pair matches regardless of strength under the
        // new schema
        targets.extend(cascade_targets(&weak_now, Some(&prev), Some(&next)));
        assert!(targets.is_empty());
    }

    #[test]
    fn test_weak_refs_never_cascade() {
        let prev = object(&[("link", Value::Ref(9))]);
        assert!(cascade_targets(&schema(), Some(&prev), None).is_empty());
    }

    #[test]
    fn test_plural_strong_field_cascades_dropped_elements() {
        let schema = Schema::new().with_field("parts", FieldType::Ref { strong: true });
        let prev = object(&[(
            "parts",
            Value::Array(vec![Value::Ref(1), Value::Ref(2), Value::Ref(3)]),
        )]);
        let next = object(&[("parts", Value::Array(vec![Value::Ref(2)]))]);
        assert_eq!(cascade_targets(&schema, Some(&prev), Some(&next)), vec![1, 3]);
    }

    #[test]
    fn test_duplicate_targets_deduplicated() {
        let prev = object(&[("child", Value::Ref(9)), ("sibling", Value::Ref(9))]);
        assert_eq!(cascade_targets(&schema(), Some(&prev), None), vec![9]);
    }

    #[test]
    fn test_insert_never_cascades() {
        let next = object(&[("child", Value::Ref(9))]);
        assert!(cascade_targets(&schema(), None, Some(&next)).is_empty());
    }
}
