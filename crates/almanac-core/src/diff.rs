//! Structural diffing of dataset trees.
//!
//! The delta is a tree of ops `[" " | "+" | "-", key, value, sub-ops?]`
//! plus a stat block counting nodes and weights on each side and the
//! insert/update/delete/move totals.

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffStat {
    pub left_nodes: usize,
    pub right_nodes: usize,
    pub left_weight: usize,
    pub right_weight: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub moves: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Present on both sides. `value` is set for unchanged leaves; changed
    /// containers carry their children in `sub` instead.
    Context {
        key: Value,
        value: Option<Value>,
        sub: Vec<DiffOp>,
    },
    Insert {
        key: Value,
        value: Value,
    },
    Delete {
        key: Value,
        value: Value,
    },
}

impl Serialize for DiffOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DiffOp::Context { key, value, sub } if sub.is_empty() => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(" ")?;
                seq.serialize_element(key)?;
                seq.serialize_element(value)?;
                seq.end()
            }
            DiffOp::Context { key, sub, .. } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(" ")?;
                seq.serialize_element(key)?;
                seq.serialize_element(&Value::Null)?;
                seq.serialize_element(sub)?;
                seq.end()
            }
            DiffOp::Insert { key, value } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("+")?;
                seq.serialize_element(key)?;
                seq.serialize_element(value)?;
                seq.end()
            }
            DiffOp::Delete { key, value } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("-")?;
                seq.serialize_element(key)?;
                seq.serialize_element(value)?;
                seq.end()
            }
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DiffResponse {
    pub stat: DiffStat,
    pub diff: Vec<DiffOp>,
}

/// Diff two JSON trees.
pub fn diff_values(left: &Value, right: &Value) -> DiffResponse {
    let mut stat = DiffStat {
        left_nodes: count_nodes(left),
        right_nodes: count_nodes(right),
        left_weight: weight(left),
        right_weight: weight(right),
        ..Default::default()
    };
    let diff = diff_pair(Value::String("root".into()), left, right, &mut stat);
    DiffResponse { stat, diff }
}

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

fn diff_pair(key: Value, left: &Value, right: &Value, stat: &mut DiffStat) -> Vec<DiffOp> {
    if left == right {
        return vec![DiffOp::Context {
            key,
            value: Some(right.clone()),
            sub: Vec::new(),
        }];
    }
    if is_container(left) && is_container(right) {
        return vec![DiffOp::Context {
            key,
            value: None,
            sub: diff_children(left, right, stat),
        }];
    }
    stat.updates += 1;
    vec![
        DiffOp::Delete {
            key: key.clone(),
            value: left.clone(),
        },
        DiffOp::Insert {
            key,
            value: right.clone(),
        },
    ]
}

fn diff_children(left: &Value, right: &Value, stat: &mut DiffStat) -> Vec<DiffOp> {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
            keys.sort();
            keys.dedup();
            let mut ops = Vec::new();
            for key in keys {
                let key_value = Value::String(key.clone());
                match (l.get(key), r.get(key)) {
                    (Some(lv), Some(rv)) => ops.extend(diff_pair(key_value, lv, rv, stat)),
                    (Some(lv), None) => {
                        stat.deletes += 1;
                        ops.push(DiffOp::Delete {
                            key: key_value,
                            value: lv.clone(),
                        });
                    }
                    (None, Some(rv)) => {
                        stat.inserts += 1;
                        ops.push(DiffOp::Insert {
                            key: key_value,
                            value: rv.clone(),
                        });
                    }
                    (None, None) => unreachable!("key came from one of the maps"),
                }
            }
            ops
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut ops = Vec::new();
            let shared = l.len().min(r.len());
            for i in 0..shared {
                ops.extend(diff_pair(Value::from(i), &l[i], &r[i], stat));
            }
            for (i, lv) in l.iter().enumerate().skip(shared) {
                stat.deletes += 1;
                ops.push(DiffOp::Delete {
                    key: Value::from(i),
                    value: lv.clone(),
                });
            }
            for (i, rv) in r.iter().enumerate().skip(shared) {
                stat.inserts += 1;
                ops.push(DiffOp::Insert {
                    key: Value::from(i),
                    value: rv.clone(),
                });
            }
            ops
        }
        _ => unreachable!("caller checked both sides are containers of one kind"),
    }
}

fn count_nodes(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(count_nodes).sum::<usize>(),
        Value::Array(items) => 1 + items.iter().map(count_nodes).sum::<usize>(),
        _ => 1,
    }
}

fn weight(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
