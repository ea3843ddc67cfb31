//! Flatten/hydrate: raw actions -> persisted flat record -> nested configs.
//!
//! `flat` is what gets written to the run ledger, one dotted key per hyper,
//! easy to analyze. `main` and `custom` are the nested trees the trainer and
//! the network builder consume.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::dotdict::DotDict;
use crate::error::{HyperError, Result};
use crate::hypers::{Domain, FlatRecord, Hyper, HyperSchema, hooks, truthy};
use crate::network::NetworkBuilder;

#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Number of processes sharing one GPU. Below 1 it is read as the
    /// memory fraction itself.
    pub gpu_split: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { gpu_split: 1.0 }
    }
}

/// Everything one training run needs.
#[derive(Clone, Debug, Serialize)]
pub struct HyperSet {
    pub flat: FlatRecord,
    pub main: Map<String, Value>,
    pub custom: Map<String, Value>,
    pub network: Value,
    pub baseline_network: Option<Value>,
}

pub struct Pipeline {
    schema: HyperSchema,
    network: Box<dyn NetworkBuilder>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        schema: HyperSchema,
        network: Box<dyn NetworkBuilder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            schema,
            network,
            config,
        }
    }

    pub fn schema(&self) -> &HyperSchema {
        &self.schema
    }

    /// Builds the full hyper set for one candidate.
    pub fn build(&self, actions: &FlatRecord) -> Result<HyperSet> {
        self.build_with(actions, self.schema.hardcoded())
    }

    /// Replays a stored record (or the all-guesses default when `record` is
    /// `None`). The record stands in for the hardcoded set, so pre hooks do
    /// not run again.
    pub fn winner(&self, record: Option<FlatRecord>) -> Result<HyperSet> {
        let fixed = match record {
            Some(r) => r,
            None => {
                let mut guesses = self.schema.guesses();
                for (k, v) in self.schema.hardcoded() {
                    guesses.insert(k.clone(), v.clone());
                }
                guesses
            }
        };
        self.build_with(&FlatRecord::new(), &fixed)
    }

    fn build_with(&self, actions: &FlatRecord, fixed: &FlatRecord) -> Result<HyperSet> {
        let flat = self.flatten(actions, fixed)?;
        let (mut main, custom) = self.hydrate(&flat)?;

        let network = self
            .network
            .build(custom.as_map(), false)
            .map_err(|e| HyperError::Network(format!("{e:#}")))?;

        let mut baseline_network = None;
        if flat.get("baseline_mode").map(truthy).unwrap_or(false) {
            if let Some(Hyper::Fixed(Value::Bool(on))) = self.schema.get("baseline_mode") {
                match hooks::baseline_block(*on, &flat, self.optimizer_prefix()) {
                    Ok(Value::Object(block)) => main.merge(block),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "pinned baseline_mode could not expand"),
                }
            }
            let net = self
                .network
                .build(custom.as_map(), true)
                .map_err(|e| HyperError::Network(format!("{e:#}")))?;
            main.set("baseline.network_spec", net.clone());
            baseline_network = Some(net);
        }

        main.set("session_config", self.session_config());

        debug!(
            "--- Flat ---\n{}",
            serde_json::to_string_pretty(&flat).unwrap_or_default()
        );
        debug!(
            "--- Hydrated ---\n{}",
            serde_json::to_string_pretty(main.as_map()).unwrap_or_default()
        );

        Ok(HyperSet {
            flat,
            main: main.to_dict(),
            custom: custom.to_dict(),
            network,
            baseline_network,
        })
    }

    /// Pre phase then post phase. Every key in `actions` must exist in the
    /// schema and survive its pre hook; `fixed` values are merged after the
    /// pre hooks.
    pub fn flatten(&self, actions: &FlatRecord, fixed: &FlatRecord) -> Result<FlatRecord> {
        let mut flat = FlatRecord::new();

        for (k, raw) in actions {
            let hyper = self
                .schema
                .get(k)
                .ok_or_else(|| HyperError::UnknownHyper(k.clone()))?;
            let v = match hyper {
                Hyper::Spec(spec) => match &spec.pre {
                    Some(pre) => pre(raw).map_err(|e| HyperError::Coercion {
                        key: k.clone(),
                        reason: format!("{e:#}"),
                    })?,
                    None => raw.clone(),
                },
                Hyper::Fixed(_) => raw.clone(),
            };
            flat.insert(k.clone(), v);
        }
        for (k, v) in fixed {
            flat.insert(k.clone(), v.clone());
        }

        // Later keys see earlier keys' finalized values.
        let keys: Vec<String> = flat.keys().cloned().collect();
        for k in keys {
            let hyper = self
                .schema
                .get(&k)
                .ok_or_else(|| HyperError::UnknownHyper(k.clone()))?;
            let Hyper::Spec(spec) = hyper else {
                continue;
            };
            let Some(post) = &spec.post else {
                continue;
            };
            let cur = flat.get(&k).cloned().unwrap_or(Value::Null);
            match post(&cur, &flat) {
                Ok(v) => {
                    flat.insert(k, v);
                }
                Err(e) => warn!(key = %k, error = %e, "post hook failed, keeping value"),
            }
        }

        Ok(flat)
    }

    /// Routes each key into `main` (agent-level keys) or `custom`, applying
    /// hydrate hooks. A failing hook degrades to setting the flat value.
    pub fn hydrate(&self, flat: &FlatRecord) -> Result<(DotDict, DotDict)> {
        let mut main = DotDict::new();
        let mut custom = DotDict::new();

        for (k, v) in flat {
            let hyper = self
                .schema
                .get(k)
                .ok_or_else(|| HyperError::UnknownHyper(k.clone()))?;
            let target = if self.schema.is_agent_key(k) {
                &mut main
            } else {
                &mut custom
            };

            let Hyper::Spec(spec) = hyper else {
                target.set(k, v.clone());
                continue;
            };

            if let Some(hydrate) = &spec.hydrate {
                match hydrate(v, flat) {
                    Ok(Value::Object(fragment)) => target.merge(fragment),
                    Ok(x) => target.set(k, x),
                    Err(e) => {
                        warn!(key = %k, error = %e, "hydrate hook failed, using flat value");
                        target.set(k, v.clone());
                    }
                }
                continue;
            }

            if let Some(Domain::Options(options)) = &spec.domain {
                let chosen = v.as_str().and_then(|name| options.get(name));
                match chosen {
                    Some(fragment) => target.set(k, fragment.clone()),
                    None => {
                        warn!(key = %k, value = %v, "not one of the declared options");
                        target.set(k, v.clone());
                    }
                }
                continue;
            }

            target.set(k, v.clone());
        }

        Ok((main, custom))
    }

    fn optimizer_prefix(&self) -> &'static str {
        if self.schema.get("step_optimizer.type").is_some() {
            "step_optimizer"
        } else {
            "optimizer"
        }
    }

    fn session_config(&self) -> Value {
        let split = self.config.gpu_split;
        if split == 1.0 {
            return Value::Null;
        }
        let fraction = if split > 1.0 { 0.9 / split } else { split };
        json!({ "gpu_memory_fraction": fraction })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypers::{HyperSpec, Section};
    use crate::network::TreeNetwork;
    use std::sync::Arc;

    fn ppo(net: &str) -> Pipeline {
        let schema = HyperSchema::load("ppo_agent", net).unwrap();
        Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig::default())
    }

    fn actions(pairs: &[(&str, Value)]) -> FlatRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn width_rounds_then_hydrates_to_power_of_two() {
        let p = ppo("conv2d");
        let flat = p.flatten(&actions(&[("net.width", json!(6.0))]), p.schema().hardcoded());
        let flat = flat.unwrap();
        assert_eq!(flat["net.width"], json!(6));

        let (_, custom) = p.hydrate(&flat).unwrap();
        assert_eq!(custom.get("net.width"), Some(&json!(64)));
    }

    #[test]
    fn ratio_clipping_thresholds() {
        let p = ppo("conv2d");
        let mut flat = p.schema().guesses();
        flat.insert("likelihood_ratio_clipping".into(), json!(0.02));
        let (main, _) = p.hydrate(&flat).unwrap();
        assert!(matches!(
            main.get("likelihood_ratio_clipping"),
            None | Some(Value::Null)
        ));

        flat.insert("likelihood_ratio_clipping".into(), json!(0.3));
        let (main, _) = p.hydrate(&flat).unwrap();
        assert_eq!(main.get("likelihood_ratio_clipping"), Some(&json!(0.3)));
    }

    #[test]
    fn unknown_action_key_is_fatal() {
        let p = ppo("conv2d");
        let err = p.build(&actions(&[("net.nope", json!(1))])).unwrap_err();
        assert!(matches!(err, HyperError::UnknownHyper(k) if k == "net.nope"));
    }

    #[test]
    fn failing_pre_hook_rejects_the_candidate() {
        let p = ppo("conv2d");
        let err = p
            .build(&actions(&[("batch_size", json!("huge"))]))
            .unwrap_err();
        assert!(matches!(err, HyperError::Coercion { key, .. } if key == "batch_size"));
    }

    #[test]
    fn pinned_baseline_mode_expands_after_hydration() {
        let agent = Section::new()
            .with(
                "optimizer.type",
                HyperSpec::categorical(vec!["nadam", "adam"], "adam"),
            )
            .with("optimizer.learning_rate", HyperSpec::bounded(0.0, 8.0, 3.0))
            .with(
                "optimization_steps",
                HyperSpec::bounded(1.0, 30.0, 10).pre(hooks::round()),
            )
            .with("baseline_mode", json!(true));
        let schema = HyperSchema::compose("a", "n", &agent, &Section::new(), &Section::new());
        assert_eq!(schema.hardcoded().get("baseline_mode"), Some(&json!(true)));
        let p = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig::default());

        let set = p.winner(None).unwrap();
        assert_eq!(set.flat["baseline_mode"], json!(true));
        assert_eq!(set.main["baseline_mode"], json!("states"));
        assert_eq!(set.main["baseline"]["type"], json!("custom"));
        assert_eq!(set.main["baseline_optimizer"]["type"], json!("multi_step"));
        assert_eq!(set.main["baseline_optimizer"]["num_steps"], json!(10));
        assert_eq!(set.main["baseline_optimizer"]["optimizer"]["type"], json!("adam"));
        let lr = set.main["baseline_optimizer"]["optimizer"]["learning_rate"]
            .as_f64()
            .unwrap();
        assert!((lr - 1e-3).abs() < 1e-12);
        assert_eq!(set.main["baseline"]["network_spec"]["baseline"], json!(true));
        assert_eq!(set.baseline_network, Some(set.main["baseline"]["network_spec"].clone()));
    }

    #[test]
    fn baseline_toggle_expands_block_and_builds_baseline_net() {
        let p = ppo("lstm");
        let set = p.winner(None).unwrap();

        assert_eq!(set.main["baseline_mode"], json!("states"));
        assert_eq!(set.main["baseline"]["type"], json!("custom"));
        assert_eq!(set.main["baseline_optimizer"]["num_steps"], json!(10));
        assert_eq!(set.main["baseline_optimizer"]["optimizer"]["type"], json!("adam"));
        assert_eq!(set.main["baseline"]["network_spec"]["baseline"], json!(true));
        assert!(set.baseline_network.is_some());
        assert_eq!(set.main["session_config"], Value::Null);
    }

    #[test]
    fn baseline_off_nulls_mode_and_gae() {
        let p = ppo("conv2d");
        let mut fixed = p.schema().guesses();
        fixed.insert("baseline_mode".into(), json!(false));
        fixed.insert("net.type".into(), json!("conv2d"));
        let set = p.winner(Some(fixed)).unwrap();

        assert_eq!(set.flat["gae_lambda"], Value::Null);
        assert_eq!(set.main["baseline_mode"], Value::Null);
        assert!(set.baseline_network.is_none());
        assert!(set.main.get("baseline").is_none());
    }

    #[test]
    fn failing_hydrate_falls_back_to_flat_value() {
        let agent = Section::new().with(
            "batch_size",
            HyperSpec::bounded(3.0, 11.0, 10).hydrate(Arc::new(
                |_: &Value, _: &FlatRecord| -> anyhow::Result<Value> { anyhow::bail!("boom") },
            )),
        );
        let schema = HyperSchema::compose("a", "n", &agent, &Section::new(), &Section::new());
        let p = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig::default());
        let set = p.build(&actions(&[("batch_size", json!(7))])).unwrap();
        assert_eq!(set.main["batch_size"], json!(7));
        assert_eq!(set.custom["net"]["type"], json!("n"));
    }

    #[test]
    fn option_domains_inject_fragment() {
        let mut opts = Map::new();
        opts.insert("small".into(), json!({"size": 32}));
        opts.insert("big".into(), json!({"size": 256}));
        let custom = Section::new().with("memory", HyperSpec::options(opts, "small"));
        let schema = HyperSchema::compose("a", "n", &Section::new(), &custom, &Section::new());
        let p = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig::default());

        let set = p.build(&actions(&[("memory", json!("big"))])).unwrap();
        assert_eq!(set.flat["memory"], json!("big"));
        assert_eq!(set.custom["memory"]["size"], json!(256));
    }

    #[test]
    fn hydration_is_idempotent() {
        let p = ppo("conv2d");
        let flat = p.winner(None).unwrap().flat;
        let (m1, c1) = p.hydrate(&flat).unwrap();
        let (m2, c2) = p.hydrate(&flat).unwrap();
        assert_eq!(m1, m2);
        assert_eq!(c1, c2);
    }

    #[test]
    fn gpu_split_sets_session_fraction() {
        let schema = HyperSchema::load("ppo_agent", "conv2d").unwrap();
        let p = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig { gpu_split: 3.0 });
        let set = p.winner(None).unwrap();
        let f = set.main["session_config"]["gpu_memory_fraction"]
            .as_f64()
            .unwrap();
        assert!((f - 0.3).abs() < 1e-12);

        let schema = HyperSchema::load("ppo_agent", "conv2d").unwrap();
        let p = Pipeline::new(schema, Box::new(TreeNetwork), PipelineConfig { gpu_split: 0.5 });
        let set = p.winner(None).unwrap();
        assert_eq!(set.main["session_config"]["gpu_memory_fraction"], json!(0.5));
    }
}
