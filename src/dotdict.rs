//! Dotted-key access over a tree of JSON objects.
//!
//! `a.b.c` addresses `{"a": {"b": {"c": ..}}}`. Every nested config in the
//! crate is assembled through [`DotDict`] so reads and writes split paths the
//! same way.

use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DotDict {
    data: Map<String, Value>,
}

impl DotDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    /// Returns `None` when any segment along the path is missing or when an
    /// intermediate value is not an object.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut cur = self.data.get(first)?;
        for seg in segments {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Creates intermediate objects as needed. A non-object sitting on the
    /// path is replaced by an object.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let (last, parents) = match segments.split_last() {
            Some(x) => x,
            None => return,
        };

        let mut cur = &mut self.data;
        for seg in parents {
            let slot = cur
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(next) = slot else {
                return;
            };
            cur = next;
        }
        cur.insert(last.to_string(), value);
    }

    /// Merges a fragment into the tree. Objects merge key by key, recursing
    /// where both sides hold an object; anything else replaces.
    pub fn merge(&mut self, fragment: Map<String, Value>) {
        merge_into(&mut self.data, fragment);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn to_dict(self) -> Map<String, Value> {
        self.data
    }
}

fn merge_into(target: &mut Map<String, Value>, fragment: Map<String, Value>) {
    for (k, v) in fragment {
        match (target.get_mut(&k), v) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, v) => {
                target.insert(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_missing_intermediate_is_none() {
        let d = DotDict::new();
        assert!(d.get("a.b.c").is_none());

        let mut d = DotDict::new();
        d.set("a", json!(3));
        assert!(d.get("a.b").is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut d = DotDict::new();
        d.set("net.width", json!(64));
        d.set("net.activation", json!("tanh"));
        d.set("discount", json!(0.99));

        assert_eq!(d.get("net.width"), Some(&json!(64)));
        assert_eq!(
            Value::Object(d.to_dict()),
            json!({"net": {"width": 64, "activation": "tanh"}, "discount": 0.99})
        );
    }

    #[test]
    fn set_overwrites_scalar_on_path() {
        let mut d = DotDict::new();
        d.set("optimizer", json!("adam"));
        d.set("optimizer.learning_rate", json!(1e-3));
        assert_eq!(d.get("optimizer"), Some(&json!({"learning_rate": 1e-3})));
    }

    #[test]
    fn merge_is_recursive_for_objects() {
        let mut d = DotDict::new();
        d.set("baseline.type", json!("custom"));
        d.set("baseline.size", json!(8));
        let frag = json!({"baseline": {"type": "mlp"}, "baseline_mode": "states"});
        d.merge(frag.as_object().cloned().unwrap_or_default());

        assert_eq!(d.get("baseline.type"), Some(&json!("mlp")));
        assert_eq!(d.get("baseline.size"), Some(&json!(8)));
        assert_eq!(d.get("baseline_mode"), Some(&json!("states")));
    }
}
