//! Hyperparameter schema: parameter definitions, transform hooks and the
//! section catalogue for each agent/net family.
//!
//! Each tunable is keyed by a dotted path such as `net.width` or
//! `step_optimizer.learning_rate`, which lets a search mix and match fields
//! inside one config block without enumerating whole-block combinations.
//!
//! Hooks run at three points:
//! - `pre`: applied to the raw optimizer output; the result is what gets
//!   persisted.
//! - `post`: applied after every `pre`, with the whole flat record in view, for
//!   hypers that depend on siblings. A post hook may only read keys that come
//!   earlier in schema order.
//! - `hydrate`: turns the persisted value into what the trainer sees. Returning
//!   an object merges it into the config tree.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{Result as AnyResult, bail};
use serde_json::{Map, Value, json};

use crate::error::{HyperError, Result};

pub type FlatRecord = Map<String, Value>;

pub type PreHook = Arc<dyn Fn(&Value) -> AnyResult<Value> + Send + Sync>;
pub type PostHook = Arc<dyn Fn(&Value, &FlatRecord) -> AnyResult<Value> + Send + Sync>;
pub type HydrateHook = Arc<dyn Fn(&Value, &FlatRecord) -> AnyResult<Value> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HyperKind {
    /// Choose one of an enumerated list
    Categorical,
    /// Continuous value in `[min, max]`
    Bounded,
    Boolean,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Domain {
    Choices(Vec<Value>),
    /// Option name -> config fragment injected when that option is chosen
    Options(Map<String, Value>),
    Bounds { min: f64, max: f64 },
    Flags,
}

impl Domain {
    /// Declared values in order. Bounds yield `[min, max]`.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Domain::Choices(vals) => vals.clone(),
            Domain::Options(opts) => opts.keys().map(|k| Value::String(k.clone())).collect(),
            Domain::Bounds { min, max } => vec![json!(min), json!(max)],
            Domain::Flags => vec![Value::Bool(false), Value::Bool(true)],
        }
    }
}

#[derive(Clone)]
pub struct HyperSpec {
    pub kind: HyperKind,
    pub domain: Option<Domain>,
    pub guess: Value,
    pub pre: Option<PreHook>,
    pub post: Option<PostHook>,
    pub hydrate: Option<HydrateHook>,
}

impl fmt::Debug for HyperSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperSpec")
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("guess", &self.guess)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("hydrate", &self.hydrate.is_some())
            .finish()
    }
}

impl HyperSpec {
    fn new(kind: HyperKind, domain: Option<Domain>, guess: Value) -> Self {
        Self {
            kind,
            domain,
            guess,
            pre: None,
            post: None,
            hydrate: None,
        }
    }

    pub fn bounded(min: f64, max: f64, guess: impl Into<Value>) -> Self {
        Self::new(
            HyperKind::Bounded,
            Some(Domain::Bounds { min, max }),
            guess.into(),
        )
    }

    pub fn categorical<V: Into<Value>>(choices: Vec<V>, guess: impl Into<Value>) -> Self {
        let choices = choices.into_iter().map(Into::into).collect();
        Self::new(
            HyperKind::Categorical,
            Some(Domain::Choices(choices)),
            guess.into(),
        )
    }

    /// Categorical whose option names select a config fragment.
    pub fn options(options: Map<String, Value>, guess: &str) -> Self {
        Self::new(
            HyperKind::Categorical,
            Some(Domain::Options(options)),
            Value::String(guess.to_string()),
        )
    }

    /// Domain is filled in as `{false, true}` when the schema is assembled.
    pub fn boolean(guess: bool) -> Self {
        Self::new(HyperKind::Boolean, None, Value::Bool(guess))
    }

    pub fn pre(mut self, hook: PreHook) -> Self {
        self.pre = Some(hook);
        self
    }

    pub fn post(mut self, hook: PostHook) -> Self {
        self.post = Some(hook);
        self
    }

    pub fn hydrate(mut self, hook: HydrateHook) -> Self {
        self.hydrate = Some(hook);
        self
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        match self.domain {
            Some(Domain::Bounds { min, max }) => Some((min.min(max), min.max(max))),
            _ => None,
        }
    }

    pub fn domain_values(&self) -> Vec<Value> {
        match &self.domain {
            Some(d) => d.values(),
            None if self.kind == HyperKind::Boolean => Domain::Flags.values(),
            None => Vec::new(),
        }
    }
}

/// A schema entry: either a tunable or a literal pinned for every run.
#[derive(Clone, Debug)]
pub enum Hyper {
    Spec(HyperSpec),
    Fixed(Value),
}

impl From<HyperSpec> for Hyper {
    fn from(spec: HyperSpec) -> Self {
        Hyper::Spec(spec)
    }
}

impl From<Value> for Hyper {
    fn from(v: Value) -> Self {
        Hyper::Fixed(v)
    }
}

/// Ordered `dotted key -> Hyper` mapping. Re-inserting a key keeps its
/// position; new keys append.
#[derive(Clone, Debug, Default)]
pub struct Section {
    entries: Vec<(String, Hyper)>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, hyper: impl Into<Hyper>) -> Self {
        self.insert(key, hyper.into());
        self
    }

    pub fn insert(&mut self, key: &str, hyper: Hyper) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = hyper,
            None => self.entries.push((key.to_string(), hyper)),
        }
    }

    pub fn extend(&mut self, other: &Section) {
        for (k, h) in &other.entries {
            self.insert(k, h.clone());
        }
    }

    /// Moves `from` to `to` at the end of the section, so merged sections that
    /// share a key can keep both under distinct names.
    pub fn rekey(&mut self, from: &str, to: &str) {
        if let Some(pos) = self.entries.iter().position(|(k, _)| k == from) {
            let (_, hyper) = self.entries.remove(pos);
            self.entries.retain(|(k, _)| k != to);
            self.entries.push((to.to_string(), hyper));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Hyper> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, h)| h)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Hyper)> {
        self.entries.iter().map(|(k, h)| (k.as_str(), h))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The merged schema for one agent/net pair. Immutable once built.
#[derive(Clone, Debug)]
pub struct HyperSchema {
    agent: String,
    net: String,
    hypers: Section,
    agent_keys: HashSet<String>,
    hardcoded: FlatRecord,
}

impl HyperSchema {
    /// Looks up the standard catalogue.
    pub fn load(agent: &str, net: &str) -> Result<Self> {
        let not_found = || HyperError::SchemaNotFound {
            agent: agent.to_string(),
            net: net.to_string(),
        };
        let agent_section = catalogue::agent_section(agent).ok_or_else(not_found)?;
        let net_section = catalogue::net_section(net).ok_or_else(not_found)?;
        Ok(Self::compose(
            agent,
            net,
            &agent_section,
            &catalogue::custom_section(),
            &net_section,
        ))
    }

    /// Merge order: agent section, custom section, `net.type` literal, net
    /// section. Keys from the agent section route to the trainer config; all
    /// others to the network config.
    pub fn compose(
        agent: &str,
        net: &str,
        agent_section: &Section,
        custom: &Section,
        net_section: &Section,
    ) -> Self {
        let mut hypers = agent_section.clone();
        hypers.extend(custom);
        hypers.insert("net.type", Hyper::Fixed(Value::String(net.to_string())));
        hypers.extend(net_section);

        for (_, h) in hypers.entries.iter_mut() {
            if let Hyper::Spec(spec) = h {
                if spec.kind == HyperKind::Boolean && spec.domain.is_none() {
                    spec.domain = Some(Domain::Flags);
                }
            }
        }

        let hardcoded = hypers
            .iter()
            .filter_map(|(k, h)| match h {
                Hyper::Fixed(v) => Some((k.to_string(), v.clone())),
                Hyper::Spec(_) => None,
            })
            .collect();

        Self {
            agent: agent.to_string(),
            net: net.to_string(),
            agent_keys: agent_section.iter().map(|(k, _)| k.to_string()).collect(),
            hypers,
            hardcoded,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn net(&self) -> &str {
        &self.net
    }

    pub fn get(&self, key: &str) -> Option<&Hyper> {
        self.hypers.get(key)
    }

    pub fn spec(&self, key: &str) -> Option<&HyperSpec> {
        match self.hypers.get(key) {
            Some(Hyper::Spec(s)) => Some(s),
            _ => None,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Hyper)> {
        self.hypers.iter()
    }

    /// Non-hardcoded entries in schema order.
    pub fn tunables(&self) -> impl Iterator<Item = (&str, &HyperSpec)> {
        self.hypers.iter().filter_map(|(k, h)| match h {
            Hyper::Spec(s) => Some((k, s)),
            Hyper::Fixed(_) => None,
        })
    }

    pub fn hardcoded(&self) -> &FlatRecord {
        &self.hardcoded
    }

    pub fn is_agent_key(&self, key: &str) -> bool {
        self.agent_keys.contains(key)
    }

    /// `{key: guess}` for every tunable.
    pub fn guesses(&self) -> FlatRecord {
        self.tunables()
            .map(|(k, s)| (k.to_string(), s.guess.clone()))
            .collect()
    }
}

/// JSON truthiness: null, false, zero, and empty strings/containers are false.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn as_f64(v: &Value) -> AnyResult<f64> {
    match v {
        Value::Number(n) => match n.as_f64() {
            Some(x) => Ok(x),
            None => bail!("number {n} is not representable as f64"),
        },
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => bail!("expected a number, got {other}"),
    }
}

/// Stock hook constructors used by the catalogue.
pub mod hooks {
    use super::*;

    /// Round half to even, as integer.
    pub fn round() -> PreHook {
        Arc::new(|v: &Value| -> AnyResult<Value> {
            Ok(json!(as_f64(v)?.round_ties_even() as i64))
        })
    }

    /// Truncate toward zero, as integer.
    pub fn truncate() -> PreHook {
        Arc::new(|v: &Value| -> AnyResult<Value> { Ok(json!(as_f64(v)?.trunc() as i64)) })
    }

    pub fn two_to_the() -> HydrateHook {
        Arc::new(|v: &Value, _: &FlatRecord| -> AnyResult<Value> {
            if let Some(exp) = v.as_i64() {
                if (0..63).contains(&exp) {
                    return Ok(json!(1_i64 << exp));
                }
            }
            Ok(json!(2_f64.powf(as_f64(v)?)))
        })
    }

    pub fn ten_to_the_neg() -> HydrateHook {
        Arc::new(|v: &Value, _: &FlatRecord| -> AnyResult<Value> {
            Ok(json!(10_f64.powf(-as_f64(v)?)))
        })
    }

    /// Keeps `x` when it is truthy and above `thresh`, else `fallback`.
    pub fn min_threshold(thresh: f64, fallback: Value) -> HydrateHook {
        Arc::new(move |v: &Value, _: &FlatRecord| -> AnyResult<Value> {
            if truthy(v) && as_f64(v)? > thresh {
                Ok(v.clone())
            } else {
                Ok(fallback.clone())
            }
        })
    }

    /// `min_threshold` applied to `10^-x`.
    pub fn min_ten_neg(thresh: f64, fallback: Value) -> HydrateHook {
        let pow = ten_to_the_neg();
        let gate = min_threshold(thresh, fallback);
        Arc::new(move |v: &Value, flat: &FlatRecord| -> AnyResult<Value> {
            gate(&pow(v, flat)?, flat)
        })
    }

    /// Keeps `x` only when it exceeds `thresh` and the `flag` key is truthy.
    pub fn above_when_flag(thresh: f64, flag: &'static str) -> PostHook {
        Arc::new(move |v: &Value, flat: &FlatRecord| -> AnyResult<Value> {
            let flag_on = flat.get(flag).map(truthy).unwrap_or(false);
            if truthy(v) && as_f64(v)? > thresh && flag_on {
                Ok(v.clone())
            } else {
                Ok(Value::Null)
            }
        })
    }

    /// Expands the baseline toggle into the baseline block. `optimizer` is the
    /// key prefix the agent family uses for its step optimizer.
    pub fn hydrate_baseline(optimizer: &'static str) -> HydrateHook {
        Arc::new(move |v: &Value, flat: &FlatRecord| -> AnyResult<Value> {
            baseline_block(truthy(v), flat, optimizer)
        })
    }

    pub fn baseline_block(on: bool, flat: &FlatRecord, optimizer: &str) -> AnyResult<Value> {
        if !on {
            return Ok(json!({"baseline_mode": null}));
        }
        let lookup = |key: String| -> AnyResult<&Value> {
            match flat.get(&key) {
                Some(v) => Ok(v),
                None => bail!("baseline block needs `{key}`"),
            }
        };
        let num_steps = lookup("optimization_steps".to_string())?.clone();
        let opt_type = lookup(format!("{optimizer}.type"))?.clone();
        let lr = as_f64(lookup(format!("{optimizer}.learning_rate"))?)?;
        Ok(json!({
            "baseline": {"type": "custom"},
            "baseline_mode": "states",
            "baseline_optimizer": {
                "type": "multi_step",
                "num_steps": num_steps,
                "optimizer": {
                    "type": opt_type,
                    "learning_rate": 10_f64.powf(-lr),
                }
            }
        }))
    }
}

/// The built-in sections for the trading agent.
pub mod catalogue {
    use super::hooks::*;
    use super::*;

    pub const AGENTS: &[&str] = &["ppo_agent", "vpg_agent", "trpo_agent"];
    pub const NETS: &[&str] = &["conv2d", "lstm"];

    pub fn base_agent() -> Section {
        Section::new()
    }

    pub fn batch_agent() -> Section {
        Section::new()
            .with(
                "batch_size",
                HyperSpec::bounded(3.0, 11.0, 10)
                    .pre(round())
                    .hydrate(two_to_the()),
            )
            .with("keep_last_timestep", HyperSpec::boolean(true))
    }

    pub fn model() -> Section {
        Section::new()
            .with(
                "optimizer.type",
                HyperSpec::categorical(vec!["nadam", "adam"], "adam"),
            )
            .with(
                "optimizer.learning_rate",
                HyperSpec::bounded(0.0, 8.0, 6.5).hydrate(ten_to_the_neg()),
            )
            .with(
                "optimization_steps",
                HyperSpec::bounded(1.0, 30.0, 10).pre(round()),
            )
            .with("discount", HyperSpec::bounded(0.9, 0.99, 0.99))
    }

    pub fn distribution_model() -> Section {
        Section::new().with(
            "entropy_regularization",
            HyperSpec::bounded(0.0, 5.0, 2).hydrate(min_ten_neg(1e-4, json!(0.0))),
        )
    }

    pub fn pg_model(optimizer: &'static str) -> Section {
        Section::new()
            .with(
                "baseline_mode",
                HyperSpec::boolean(true).hydrate(hydrate_baseline(optimizer)),
            )
            .with(
                "gae_lambda",
                HyperSpec::bounded(0.8, 1.0, 0.95).post(above_when_flag(0.9, "baseline_mode")),
            )
    }

    pub fn pg_prob_ratio_model() -> Section {
        Section::new().with(
            "likelihood_ratio_clipping",
            HyperSpec::bounded(0.0, 1.0, 0.2).hydrate(min_threshold(0.05, Value::Null)),
        )
    }

    /// Merged agent-level section, or `None` for an unknown family.
    pub fn agent_section(agent: &str) -> Option<Section> {
        let mut s = base_agent();
        match agent {
            "ppo_agent" => {
                s.extend(&batch_agent());
                s.extend(&model());
                s.extend(&distribution_model());
                s.extend(&pg_model("step_optimizer"));
                s.extend(&pg_prob_ratio_model());
                s.rekey("optimizer.learning_rate", "step_optimizer.learning_rate");
                s.rekey("optimizer.type", "step_optimizer.type");
            }
            "vpg_agent" | "trpo_agent" => {
                s.extend(&batch_agent());
                s.extend(&model());
                s.extend(&distribution_model());
                s.extend(&pg_model("optimizer"));
            }
            _ => return None,
        }
        Some(s)
    }

    /// Network shape and feature toggles, shared by every agent family.
    pub fn custom_section() -> Section {
        Section::new()
            .with("indicators", HyperSpec::boolean(true))
            .with(
                "net.depth_mid",
                HyperSpec::bounded(1.0, 3.0, 3).pre(round()),
            )
            .with(
                "net.depth_post",
                HyperSpec::bounded(1.0, 3.0, 2).pre(round()),
            )
            .with(
                "net.width",
                HyperSpec::bounded(3.0, 9.0, 6)
                    .pre(round())
                    .hydrate(two_to_the()),
            )
            .with("net.funnel", HyperSpec::boolean(true))
            .with(
                "net.activation",
                HyperSpec::categorical(vec!["tanh", "relu"], "tanh"),
            )
            .with(
                "net.dropout",
                HyperSpec::bounded(0.0, 0.5, 0.001).hydrate(min_threshold(0.1, Value::Null)),
            )
            .with(
                "net.l2",
                HyperSpec::bounded(0.0, 7.0, 7).hydrate(min_ten_neg(1e-6, json!(0.0))),
            )
            .with(
                "net.l1",
                HyperSpec::bounded(0.0, 7.0, 3).hydrate(min_ten_neg(1e-6, json!(0.0))),
            )
            .with("pct_change", HyperSpec::boolean(false))
            .with("unimodal", HyperSpec::boolean(false))
            .with("scale", HyperSpec::boolean(true))
            // false doubles the reward on repeated actions, true punishes
            .with("punish_repeats", HyperSpec::boolean(false))
            .with("arbitrage", HyperSpec::boolean(true))
    }

    pub fn net_section(net: &str) -> Option<Section> {
        match net {
            "lstm" => Some(Section::new().with(
                "net.depth_pre",
                HyperSpec::bounded(0.0, 3.0, 2).pre(truncate()),
            )),
            "conv2d" => Some(
                Section::new()
                    // window size: smaller is more destructive
                    .with("net.window", HyperSpec::bounded(1.0, 3.0, 2).pre(round()))
                    // 1 = no overlap, 2 = half overlap
                    .with("net.stride", HyperSpec::bounded(1.0, 3.0, 3).pre(round()))
                    .with(
                        "step_window",
                        HyperSpec::bounded(100.0, 400.0, 200).pre(round()),
                    ),
            ),
            _ => None,
        }
    }
}
