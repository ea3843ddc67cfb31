//! Flat record <-> fixed-length feature vector.
//!
//! Bounded hypers take one scalar slot, booleans one 0/1 slot, categoricals a
//! one-hot block with a slot per declared value. The layout is derived from
//! the schema alone so it exists before any run has been stored.

use serde_json::{Value, json};

use crate::hypers::{FlatRecord, HyperKind, HyperSchema, as_f64, truthy};

#[derive(Clone, Debug)]
struct Group {
    key: String,
    kind: HyperKind,
    /// First slot index of this group
    start: usize,
    /// One entry per slot for categoricals; empty otherwise
    values: Vec<Value>,
}

impl Group {
    fn width(&self) -> usize {
        match self.kind {
            HyperKind::Categorical => self.values.len(),
            HyperKind::Bounded | HyperKind::Boolean => 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VectorCodec {
    groups: Vec<Group>,
    names: Vec<String>,
    bounds: Vec<(f64, f64)>,
}

impl VectorCodec {
    pub fn new(schema: &HyperSchema) -> Self {
        let sample = coverage_sample(schema);

        let mut groups = Vec::new();
        let mut names = Vec::new();
        let mut bounds = Vec::new();

        for (key, spec) in schema.tunables() {
            let start = names.len();
            let mut group = Group {
                key: key.to_string(),
                kind: spec.kind,
                start,
                values: Vec::new(),
            };
            match spec.kind {
                HyperKind::Bounded => {
                    names.push(key.to_string());
                    bounds.push(spec.bounds().unwrap_or((0.0, 1.0)));
                }
                HyperKind::Boolean => {
                    names.push(key.to_string());
                    bounds.push((0.0, 1.0));
                }
                HyperKind::Categorical => {
                    for row in &sample {
                        let Some(v) = row.get(key) else { continue };
                        if !group.values.contains(v) {
                            names.push(format!("{key}={}", label(v)));
                            bounds.push((0.0, 1.0));
                            group.values.push(v.clone());
                        }
                    }
                }
            }
            groups.push(group);
        }

        Self {
            groups,
            names,
            bounds,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.names
    }

    /// `[min, max]` per slot: declared bounds for bounded hypers, `[0, 1]`
    /// otherwise.
    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    /// Keys outside the layout (hardcoded values, or hypers since removed from
    /// the schema) are ignored. Unknown categorical values leave their block
    /// at zero.
    pub fn encode(&self, flat: &FlatRecord) -> Vec<f64> {
        let mut vec = vec![0.0; self.len()];
        for g in &self.groups {
            let Some(v) = flat.get(&g.key) else { continue };
            match g.kind {
                HyperKind::Bounded => {
                    vec[g.start] = as_f64(v).unwrap_or(0.0);
                }
                HyperKind::Boolean => {
                    vec[g.start] = if truthy(v) { 1.0 } else { 0.0 };
                }
                HyperKind::Categorical => {
                    if let Some(i) = g.values.iter().position(|x| same_value(x, v)) {
                        vec[g.start + i] = 1.0;
                    }
                }
            }
        }
        vec
    }

    /// Every tunable key is populated, booleans included. Categorical ties go
    /// to the first declared value.
    pub fn decode(&self, vec: &[f64]) -> FlatRecord {
        let at = |i: usize| vec.get(i).copied().unwrap_or(0.0);
        let mut flat = FlatRecord::new();
        for g in &self.groups {
            let v = match g.kind {
                HyperKind::Bounded => json!(at(g.start)),
                HyperKind::Boolean => Value::Bool(at(g.start).round_ties_even() >= 1.0),
                HyperKind::Categorical => {
                    let mut best: Option<(usize, f64)> = None;
                    for i in 0..g.width() {
                        let score = at(g.start + i);
                        if best.map(|(_, s)| score > s).unwrap_or(true) {
                            best = Some((i, score));
                        }
                    }
                    match best {
                        Some((i, _)) => g.values[i].clone(),
                        None => Value::Null,
                    }
                }
            };
            flat.insert(g.key.clone(), v);
        }
        flat
    }
}

/// One row per domain position, shorter domains forward-filled with their
/// last value, so every declared value of every tunable shows up somewhere.
pub fn coverage_sample(schema: &HyperSchema) -> Vec<FlatRecord> {
    let columns: Vec<(&str, Vec<Value>)> = schema
        .tunables()
        .map(|(k, s)| (k, s.domain_values()))
        .collect();
    let rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);

    (0..rows)
        .map(|i| {
            columns
                .iter()
                .filter_map(|(k, vals)| {
                    let v = vals.get(i).or_else(|| vals.last())?;
                    Some((k.to_string(), v.clone()))
                })
                .collect()
        })
        .collect()
}

fn label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypers::{HyperSpec, Section};

    fn small_schema() -> HyperSchema {
        let agent = Section::new()
            .with("lr", HyperSpec::bounded(0.0, 8.0, 6.5))
            .with("opt", HyperSpec::categorical(vec!["nadam", "adam", "sgd"], "adam"))
            .with("baseline", HyperSpec::boolean(true))
            .with("pinned", json!(3));
        HyperSchema::compose("a", "n", &agent, &Section::new(), &Section::new())
    }

    #[test]
    fn layout_covers_every_declared_value() {
        let codec = VectorCodec::new(&small_schema());
        assert_eq!(
            codec.feature_names(),
            &["lr", "opt=nadam", "opt=adam", "opt=sgd", "baseline"]
        );
        assert_eq!(codec.bounds()[0], (0.0, 8.0));
        assert!(codec.bounds()[1..].iter().all(|b| *b == (0.0, 1.0)));
    }

    #[test]
    fn coverage_sample_forward_fills() {
        let rows = coverage_sample(&small_schema());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["lr"], json!(8.0));
        assert_eq!(rows[2]["baseline"], json!(true));
        assert_eq!(rows[2]["opt"], json!("sgd"));
        assert!(rows.iter().all(|r| !r.contains_key("pinned")));
    }

    #[test]
    fn encode_handles_missing_and_null() {
        let codec = VectorCodec::new(&small_schema());
        let mut flat = FlatRecord::new();
        flat.insert("lr".into(), Value::Null);
        flat.insert("opt".into(), json!("sgd"));
        flat.insert("pinned".into(), json!(3));
        assert_eq!(codec.encode(&flat), vec![0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn bounded_slot_round_trips() {
        let codec = VectorCodec::new(&small_schema());
        for x in [0.0, 0.37, 4.2, 8.0] {
            let v = vec![x, 1.0, 0.0, 0.0, 1.0];
            let back = codec.encode(&codec.decode(&v));
            assert!((back[0] - x).abs() < 1e-12);
        }
    }

    #[test]
    fn categorical_and_boolean_round_trip() {
        let codec = VectorCodec::new(&small_schema());
        for opt in ["nadam", "adam", "sgd"] {
            for flag in [false, true] {
                let mut flat = FlatRecord::new();
                flat.insert("lr".into(), json!(1.0));
                flat.insert("opt".into(), json!(opt));
                flat.insert("baseline".into(), json!(flag));
                let back = codec.decode(&codec.encode(&flat));
                assert_eq!(back["opt"], json!(opt));
                assert_eq!(back["baseline"], json!(flag));
            }
        }
    }

    #[test]
    fn decode_picks_max_with_first_tie_and_keeps_false() {
        let codec = VectorCodec::new(&small_schema());
        let flat = codec.decode(&[1.0, 0.4, 0.7, 0.7, 0.2]);
        assert_eq!(flat["opt"], json!("adam"));
        assert_eq!(flat["baseline"], json!(false));

        let flat = codec.decode(&[1.0, 0.5, 0.5, 0.5, 0.5]);
        assert_eq!(flat["opt"], json!("nadam"));
        assert_eq!(flat["baseline"], json!(false));
    }
}
