//! Change detection: compare two graph states entity by entity.
//!
//! Entities are matched by identity and compared on their serialized form.
//! Bookkeeping fields that move on every scan are left out, so an unchanged
//! network produces an empty change set.

use std::collections::{BTreeMap, BTreeSet};

use netloom_core::{ChangeSet, EntityChanges, FieldChange, JobMetadata, Modification, TopologyGraph};
use serde::Serialize;
use serde_json::Value;

/// Fields that change on every sighting and never count as a change.
const VOLATILE: &[&str] = &["last_seen", "missed_scans", "confidence"];

pub fn compute(before: &TopologyGraph, after: &TopologyGraph, meta: JobMetadata) -> ChangeSet {
    let devices = diff_entities(&before.devices, &after.devices, |d| {
        let mut value = project(d);
        if let Value::Object(map) = &mut value {
            // Membership only; interface details are diffed on their own.
            let ips: Vec<Value> = d.interfaces.keys().map(|ip| Value::String(ip.to_string())).collect();
            map.insert("interfaces".into(), Value::Array(ips));
        }
        value
    });

    let interfaces_before: BTreeMap<_, _> = before
        .interface_records()
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();
    let interfaces_after: BTreeMap<_, _> = after
        .interface_records()
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();
    let interfaces = diff_entities(&interfaces_before, &interfaces_after, project);

    let links = diff_entities(&before.links, &after.links, project);

    let changes = ChangeSet {
        meta,
        devices,
        interfaces,
        links,
    };
    let summary = changes.summary();
    tracing::debug!(?summary, "Change set computed");
    changes
}

fn diff_entities<K, T, F>(before: &BTreeMap<K, T>, after: &BTreeMap<K, T>, project: F) -> EntityChanges<T>
where
    K: Ord,
    T: Clone,
    F: Fn(&T) -> Value,
{
    let mut changes = EntityChanges::default();

    for (key, old) in before {
        match after.get(key) {
            None => changes.removed.push(old.clone()),
            Some(new) => {
                let fields = field_changes(&project(old), &project(new));
                if !fields.is_empty() {
                    changes.modified.push(Modification {
                        before: old.clone(),
                        after: new.clone(),
                        fields,
                    });
                }
            }
        }
    }
    changes.added = after
        .iter()
        .filter(|(key, _)| !before.contains_key(key))
        .map(|(_, new)| new.clone())
        .collect();

    changes
}

/// Serialized form with the volatile fields stripped.
fn project<T: Serialize>(entity: &T) -> Value {
    let mut value = serde_json::to_value(entity).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for field in VOLATILE {
            map.remove(*field);
        }
    }
    value
}

fn field_changes(before: &Value, after: &Value) -> Vec<FieldChange> {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            names
                .into_iter()
                .filter_map(|name| {
                    let b = old.get(name).unwrap_or(&Value::Null);
                    let a = new.get(name).unwrap_or(&Value::Null);
                    (a != b).then(|| FieldChange {
                        field: name.clone(),
                        before: b.clone(),
                        after: a.clone(),
                    })
                })
                .collect()
        }
        _ if before != after => vec![FieldChange {
            field: String::new(),
            before: before.clone(),
            after: after.clone(),
        }],
        _ => Vec::new(),
    }
}
