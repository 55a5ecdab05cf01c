use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::envelope::EntityRow;
use crate::oplog::{OpKind, Operation};

/// Which side a field's value came from, recorded in `conflict_history` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

/// The strategy that produced a field resolution, matching the Tier 3 table of
/// spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LocalPending,
    DeleteWins,
    LastWrite,
}

/// A single non-trivial field resolution, appended to `conflict_history`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub entity_id: String,
    pub field: String,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub resolved_value: Value,
    pub winner: Winner,
    pub strategy: Strategy,
    pub timestamp: DateTime<Utc>,
}

/// Three-tier field-level merge of an incoming remote row against the local row and any
/// pending outbox operations for that entity (spec.md §4.7). Grounded on the teacher's
/// `merge.rs`: `should_overwrite`'s HLC-style comparison becomes Tier 3's
/// `updated_at`-then-`device_id` rule, and `lww_merge_row`'s per-field overlay becomes
/// Tier 2's field-disjointness application.
pub struct Resolver;

pub struct ResolveOutcome {
    pub merged: EntityRow,
    pub conflicts: Vec<FieldConflict>,
}

impl Resolver {
    pub fn resolve(
        local: Option<&EntityRow>,
        remote: &EntityRow,
        pending: &[Operation],
        now: DateTime<Utc>,
    ) -> ResolveOutcome {
        // Tier 1 — trivial cases.
        let Some(local) = local else {
            return ResolveOutcome { merged: remote.clone(), conflicts: Vec::new() };
        };

        if remote.updated_at == local.updated_at && remote.version == local.version {
            return ResolveOutcome { merged: local.clone(), conflicts: Vec::new() };
        }

        // Tier 2 — field disjointness: only fields that actually differ are subject to
        // Tier 3; everything else just carries its common value.
        let local_fields = local.fields.as_object().cloned().unwrap_or_default();
        let remote_fields = remote.fields.as_object().cloned().unwrap_or_default();

        let mut all_field_names: Vec<String> = local_fields.keys().cloned().collect();
        for k in remote_fields.keys() {
            if !all_field_names.contains(k) {
                all_field_names.push(k.clone());
            }
        }

        let mut merged_fields = serde_json::Map::new();
        let mut conflicts = Vec::new();

        for field in &all_field_names {
            let local_value = local_fields.get(field);
            let remote_value = remote_fields.get(field);
            if local_value == remote_value {
                if let Some(v) = local_value.or(remote_value) {
                    merged_fields.insert(field.clone(), v.clone());
                }
                continue;
            }
            let pending_field = Self::has_pending_field(pending, field);
            let (resolved, winner, strategy) = Self::resolve_field_tier3(
                field,
                local_value,
                remote_value,
                local,
                remote,
                pending_field,
            );
            if let Some(v) = &resolved {
                merged_fields.insert(field.clone(), v.clone());
            }
            conflicts.push(FieldConflict {
                entity_id: local.id.clone(),
                field: field.clone(),
                local_value: local_value.cloned(),
                remote_value: remote_value.cloned(),
                resolved_value: resolved.unwrap_or(Value::Null),
                winner,
                strategy,
                timestamp: now,
            });
        }

        // `deleted` is not a fields-map entry; it's a top-level envelope column, but the
        // same Tier 3 "delete side wins" rule applies to it directly.
        let deleted = if local.deleted != remote.deleted {
            let resolved_deleted = local.deleted || remote.deleted;
            conflicts.push(FieldConflict {
                entity_id: local.id.clone(),
                field: "deleted".to_string(),
                local_value: Some(Value::Bool(local.deleted)),
                remote_value: Some(Value::Bool(remote.deleted)),
                resolved_value: Value::Bool(resolved_deleted),
                winner: if resolved_deleted == local.deleted { Winner::Local } else { Winner::Remote },
                strategy: Strategy::DeleteWins,
                timestamp: now,
            });
            resolved_deleted
        } else {
            local.deleted
        };

        let merged = EntityRow {
            id: local.id.clone(),
            user_id: local.user_id.clone(),
            created_at: local.created_at,
            updated_at: local.updated_at.max(remote.updated_at),
            deleted,
            version: local.version.max(remote.version) + 1,
            device_id: remote.device_id.clone(),
            fields: Value::Object(merged_fields),
        };

        ResolveOutcome { merged, conflicts }
    }

    fn has_pending_field(pending: &[Operation], field: &str) -> bool {
        pending.iter().any(|op| match &op.kind {
            OpKind::SetField { field: f, .. } => f == field,
            OpKind::SetMany { fields } => fields.contains_key(field),
            OpKind::Increment { field: f, .. } => f == field,
            OpKind::Create { .. } | OpKind::Delete => false,
        })
    }

    /// Tier 3, evaluated top-down per spec.md §4.7's table.
    fn resolve_field_tier3(
        _field: &str,
        local_value: Option<&Value>,
        remote_value: Option<&Value>,
        local: &EntityRow,
        remote: &EntityRow,
        has_pending: bool,
    ) -> (Option<Value>, Winner, Strategy) {
        if has_pending {
            // Pending-op field shield: local wins, preserves user intent. The caller
            // (C8/pull) must not let this overwrite the in-flight op itself.
            return (local_value.cloned(), Winner::Local, Strategy::LocalPending);
        }

        if local.updated_at > remote.updated_at {
            return (local_value.cloned(), Winner::Local, Strategy::LastWrite);
        }
        if remote.updated_at > local.updated_at {
            return (remote_value.cloned(), Winner::Remote, Strategy::LastWrite);
        }

        // Timestamps equal: deterministic tiebreak on the two rows' own envelope
        // device_id, lexicographically lower wins (spec.md §4.7 Tier 3, last row) —
        // this must be the row's provenance, not the resolving engine's own identity,
        // or two different observers could pick different winners for the same pair.
        let local_device = local.device_id.as_deref().unwrap_or("");
        let remote_device = remote.device_id.as_deref().unwrap_or("");
        if local_device <= remote_device {
            (local_value.cloned(), Winner::Local, Strategy::LastWrite)
        } else {
            (remote_value.cloned(), Winner::Remote, Strategy::LastWrite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, updated_at: DateTime<Utc>, version: i64, device: &str, fields: Value) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            created_at: updated_at,
            updated_at,
            deleted: false,
            version,
            device_id: Some(device.to_string()),
            fields,
        }
    }

    #[test]
    fn local_absent_takes_remote() {
        let remote = row("g1", Utc::now(), 1, "dev-b", json!({"name": "Run"}));
        let out = Resolver::resolve(None, &remote, &[], Utc::now());
        assert_eq!(out.merged, remote);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn identical_envelope_is_a_no_op() {
        let t = Utc::now();
        let local = row("g1", t, 1, "dev-a", json!({"name": "Run"}));
        let remote = row("g1", t, 1, "dev-a", json!({"name": "Run"}));
        let out = Resolver::resolve(Some(&local), &remote, &[], t);
        assert_eq!(out.merged, local);
    }

    #[test]
    fn pending_field_shield_preserves_local_value() {
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        let t1 = Utc::now();
        let local = row("h1", t0, 1, "dev-a", json!({"current_value": 8}));
        let remote = row("h1", t1, 1, "dev-b", json!({"current_value": 3}));
        let pending = vec![Operation {
            seq: 1,
            table: crate::envelope::EntityTable::Habit,
            entity_id: "h1".into(),
            kind: OpKind::Increment { field: "current_value".into(), delta: 5.0 },
            timestamp: t0,
            retries: 0,
        }];
        let out = Resolver::resolve(Some(&local), &remote, &pending, t1);
        assert_eq!(out.merged.field("current_value"), Some(&json!(8)));
    }

    #[test]
    fn delete_wins_over_rename() {
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        let t1 = Utc::now();
        let mut local = row("g1", t1, 1, "dev-a", json!({"name": "Run"}));
        local.deleted = false;
        let mut remote = row("g1", t0, 1, "dev-b", json!({"name": "Old"}));
        remote.deleted = true;
        let out = Resolver::resolve(Some(&local), &remote, &[], t1);
        assert!(out.merged.deleted);
        // local's rename still carries through on the `name` field since it's the newer side.
        assert_eq!(out.merged.field("name"), Some(&json!("Run")));
    }

    #[test]
    fn last_write_wins_by_timestamp() {
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        let t1 = Utc::now();
        let local = row("g1", t0, 1, "dev-a", json!({"name": "Old"}));
        let remote = row("g1", t1, 1, "dev-b", json!({"name": "New"}));
        let out = Resolver::resolve(Some(&local), &remote, &[], t1);
        assert_eq!(out.merged.field("name"), Some(&json!("New")));
        assert_eq!(out.conflicts[0].winner, Winner::Remote);
    }

    #[test]
    fn deterministic_tiebreak_on_equal_timestamps() {
        let t = Utc::now();
        let local = row("g1", t, 1, "dev-a", json!({"name": "A"}));
        let remote = row("g1", t, 1, "dev-z", json!({"name": "Z"}));
        let out_a = Resolver::resolve(Some(&local), &remote, &[], t);
        assert_eq!(out_a.merged.field("name"), Some(&json!("A")), "dev-a < dev-z, local wins");

        // From the other device's perspective (dev-z is local, dev-a is remote) both
        // sides must still converge on "A" — dev-a is the lexicographically lower id.
        let local_z = row("g1", t, 1, "dev-z", json!({"name": "Z"}));
        let remote_a = row("g1", t, 1, "dev-a", json!({"name": "A"}));
        let out_z = Resolver::resolve(Some(&local_z), &remote_a, &[], t);
        assert_eq!(out_z.merged.field("name"), Some(&json!("A")));
    }

    #[test]
    fn version_strictly_increases_on_merge() {
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        let t1 = Utc::now();
        let local = row("g1", t0, 3, "dev-a", json!({"name": "Old"}));
        let remote = row("g1", t1, 5, "dev-b", json!({"name": "New"}));
        let out = Resolver::resolve(Some(&local), &remote, &[], t1);
        assert_eq!(out.merged.version, 6);
    }
}
