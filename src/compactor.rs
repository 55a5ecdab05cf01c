use std::collections::BTreeMap;

use serde_json::Value;

use crate::envelope::EntityTable;
use crate::oplog::{OpKind, Operation};

/// Single-pass, in-memory reduction of the outbox (spec.md §4.5). Pure function: given
/// the current outbox, produces an equivalent outbox whose application to any
/// consistent remote yields an observationally identical end state, with the strongest
/// possible reduction in record count. Grounded on the teacher's `merge.rs::lww_merge_row`
/// field-overlay idea for how later values override earlier ones within a group.
pub fn compact(ops: Vec<Operation>) -> Vec<Operation> {
    let mut groups: BTreeMap<(EntityTable, String), Vec<Operation>> = BTreeMap::new();
    // Preserve first-seen group order so output ordering matches input seq order.
    let mut group_order: Vec<(EntityTable, String)> = Vec::new();

    for op in ops {
        let key = (op.table, op.entity_id.clone());
        if !groups.contains_key(&key) {
            group_order.push(key.clone());
        }
        groups.entry(key).or_default().push(op);
    }

    let mut out = Vec::new();
    for key in group_order {
        let group = groups.remove(&key).unwrap_or_default();
        out.extend(compact_group(group));
    }
    out.sort_by_key(|op| op.seq);
    out
}

fn compact_group(mut group: Vec<Operation>) -> Vec<Operation> {
    if group.is_empty() {
        return group;
    }
    group.sort_by_key(|op| op.seq);
    let oldest_timestamp = group[0].timestamp;
    let oldest_seq = group[0].seq;
    let table = group[0].table;
    let entity_id = group[0].entity_id.clone();

    // --- Cross-operation rules ---
    let has_create = group.iter().any(|op| matches!(op.kind, OpKind::Create { .. }));
    let has_delete = group.iter().any(|op| matches!(op.kind, OpKind::Delete));

    if has_create && has_delete {
        // create ... delete -> drop both (and everything between).
        return Vec::new();
    }
    if has_delete && !has_create {
        // update(s) ... delete with no preceding create -> keep only the terminal delete.
        return vec![Operation {
            seq: oldest_seq,
            table,
            entity_id,
            kind: OpKind::Delete,
            timestamp: oldest_timestamp,
            retries: 0,
        }];
    }

    if has_create {
        // create followed by any mix of set/increment -> a single folded create.
        let mut value = match &group[0].kind {
            OpKind::Create { value } => value.clone(),
            _ => Value::Object(Default::default()),
        };
        for op in &group[1..] {
            apply_into_create_value(&mut value, &op.kind);
        }
        return vec![Operation {
            seq: oldest_seq,
            table,
            entity_id,
            kind: OpKind::Create { value },
            timestamp: oldest_timestamp,
            retries: 0,
        }];
    }

    // --- Same-field rules for the remainder (no create, no delete in this group) ---
    let mut field_state: Vec<(String, FieldAccum)> = Vec::new();
    let mut multi_set: serde_json::Map<String, Value> = serde_json::Map::new();

    for op in &group {
        match &op.kind {
            OpKind::SetField { field, value } => {
                upsert_field(&mut field_state, field, FieldAccum::Set(value.clone()));
            }
            OpKind::Increment { field, delta } => {
                let existing = field_state.iter_mut().find(|(f, _)| f == field);
                match existing {
                    Some((_, FieldAccum::Increment(acc))) => *acc += delta,
                    Some((_, slot @ FieldAccum::Set(_))) => {
                        // set(v1) followed by increment(delta) where v1 is numeric -> set(v1+delta)
                        if let FieldAccum::Set(v) = slot {
                            if let Some(num) = v.as_f64() {
                                *slot = FieldAccum::Set(Value::from(num + delta));
                            } else {
                                *slot = FieldAccum::Increment(*delta);
                            }
                        }
                    }
                    None => field_state.push((field.clone(), FieldAccum::Increment(*delta))),
                }
            }
            OpKind::SetMany { fields } => {
                for (k, v) in fields {
                    upsert_field(&mut field_state, k, FieldAccum::Set(v.clone()));
                }
            }
            OpKind::Create { .. } | OpKind::Delete => unreachable!("handled above"),
        }
    }

    // Drop no-ops: Δ=0 increments, and `updated_at`-only state is handled by the caller
    // never storing `updated_at` as a trackable field (the engine never enqueues it).
    field_state.retain(|(_, acc)| !matches!(acc, FieldAccum::Increment(d) if *d == 0.0));

    if field_state.is_empty() {
        return Vec::new();
    }

    if field_state.len() == 1 {
        let (field, acc) = field_state.into_iter().next().unwrap();
        let kind = match acc {
            FieldAccum::Set(v) => OpKind::SetField { field, value: v },
            FieldAccum::Increment(d) => OpKind::Increment { field, delta: d },
        };
        return vec![Operation {
            seq: oldest_seq,
            table,
            entity_id,
            kind,
            timestamp: oldest_timestamp,
            retries: 0,
        }];
    }

    // Multiple distinct fields survive: plain sets merge into one `SetMany` (later values
    // overriding earlier ones), but a field that still carries increment intent is kept as
    // its own surviving `Increment` op rather than folded into the mapping as a snapshot —
    // an `increment(field, Δ)` must not be silently rewritten to `set(field, Δ)` (spec.md
    // §3 field-level intent preservation, §8 property 9).
    let mut increments: Vec<(String, f64)> = Vec::new();
    for (field, acc) in field_state {
        match acc {
            FieldAccum::Set(v) => {
                multi_set.insert(field, v);
            }
            FieldAccum::Increment(d) => increments.push((field, d)),
        }
    }

    // Distinct seqs are required: `OperationLog::replace_all` re-inserts ops by explicit
    // `seq`, so two emitted ops can't share one. Draw from the group's own seqs, which are
    // guaranteed not to collide with any other group's.
    let mut seq_pool: Vec<i64> = group.iter().map(|op| op.seq).collect();
    seq_pool.sort();
    let mut next_seq = seq_pool.into_iter();

    let mut out = Vec::new();
    if !multi_set.is_empty() {
        out.push(Operation {
            seq: next_seq.next().unwrap_or(oldest_seq),
            table,
            entity_id: entity_id.clone(),
            kind: OpKind::SetMany { fields: multi_set },
            timestamp: oldest_timestamp,
            retries: 0,
        });
    }
    for (field, delta) in increments {
        out.push(Operation {
            seq: next_seq.next().unwrap_or(oldest_seq),
            table,
            entity_id: entity_id.clone(),
            kind: OpKind::Increment { field, delta },
            timestamp: oldest_timestamp,
            retries: 0,
        });
    }
    out
}

enum FieldAccum {
    Set(Value),
    Increment(f64),
}

fn upsert_field(state: &mut Vec<(String, FieldAccum)>, field: &str, value: FieldAccum) {
    if let Some(entry) = state.iter_mut().find(|(f, _)| f == field) {
        entry.1 = value;
    } else {
        state.push((field.to_string(), value));
    }
}

fn apply_into_create_value(value: &mut Value, kind: &OpKind) {
    let obj = match value.as_object_mut() {
        Some(obj) => obj,
        None => {
            *value = Value::Object(Default::default());
            value.as_object_mut().unwrap()
        }
    };
    match kind {
        OpKind::SetField { field, value: v } => {
            obj.insert(field.clone(), v.clone());
        }
        OpKind::SetMany { fields } => {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        OpKind::Increment { field, delta } => {
            let base = obj.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
            obj.insert(field.clone(), Value::from(base + delta));
        }
        OpKind::Create { .. } | OpKind::Delete => {}
    }
}
