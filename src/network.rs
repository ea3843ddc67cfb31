//! Seam to the network-architecture builder.
//!
//! The search engine never constructs layers itself. It hands the hydrated
//! `custom` tree to a [`NetworkBuilder`] and passes whatever comes back to the
//! trainer untouched.

use anyhow::Result;
use serde_json::{Map, Value, json};

pub trait NetworkBuilder: Send + Sync {
    /// `baseline` asks for the variant used by the policy-gradient baseline.
    fn build(&self, custom: &Map<String, Value>, baseline: bool) -> Result<Value>;
}

impl<F> NetworkBuilder for F
where
    F: Fn(&Map<String, Value>, bool) -> Result<Value> + Send + Sync,
{
    fn build(&self, custom: &Map<String, Value>, baseline: bool) -> Result<Value> {
        self(custom, baseline)
    }
}

/// Forwards the custom tree as the network spec, for trainers that build
/// their own layers from it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TreeNetwork;

impl NetworkBuilder for TreeNetwork {
    fn build(&self, custom: &Map<String, Value>, baseline: bool) -> Result<Value> {
        Ok(json!({
            "net": custom.get("net").cloned().unwrap_or(Value::Null),
            "baseline": baseline,
        }))
    }
}
