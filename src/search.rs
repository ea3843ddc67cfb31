//! The search loop: optional guess phase, then feedback rounds that refit
//! a surrogate on the full run ledger and score one new proposal each.
//!
//! The driver keeps no state between rounds beyond the schema. Everything
//! the optimizer learns from is re-read from the ledger, so a restarted
//! process (or a second one sharing the ledger) picks up where it left off.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::codec::VectorCodec;
use crate::error::{HyperError, Result};
use crate::gp::jitter;
use crate::hypers::FlatRecord;
use crate::optimizer::Optimizer;
use crate::pipeline::{HyperSet, Pipeline};
use crate::store::{NewRun, Run, RunStore};
use crate::surrogate::{GridSearchConfig, fit_surrogate};
use crate::trainer::Trainer;

#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Override group to score before feedback rounds; `None` skips it
    pub guess_group: Option<usize>,
    /// Stop after this many feedback rounds; `None` runs until killed
    pub max_rounds: Option<usize>,
    pub seed: u64,
    pub grid: GridSearchConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            guess_group: None,
            max_rounds: None,
            seed: 0,
            grid: GridSearchConfig::default(),
        }
    }
}

/// Hand-picked warm-start overrides, applied on top of every guess.
/// Keys the active schema does not tune are skipped.
pub fn guess_overrides() -> Vec<Vec<FlatRecord>> {
    fn group(entries: [Value; 3]) -> Vec<FlatRecord> {
        entries
            .into_iter()
            .map(|v| match v {
                Value::Object(m) => m,
                _ => FlatRecord::new(),
            })
            .collect()
    }

    vec![
        group([
            json!({}),
            // l2 + dropout
            json!({"net.l1": 7.0, "net.l2": 3.0, "net.dropout": 0.5}),
            json!({"pct_change": true}),
        ]),
        group([
            // no regularization
            json!({"net.l1": 7.0, "net.l2": 7.0, "net.dropout": 0.001}),
            json!({"optimization_steps": 20}),
            json!({"step_optimizer.learning_rate": 5.5}),
        ]),
        group([
            // dropout only
            json!({"net.l1": 7.0, "net.l2": 7.0, "net.dropout": 0.5}),
            json!({"net.width": 4}),
            json!({"net.width": 8}),
        ]),
        group([
            // l2 only
            json!({"net.l1": 7.0, "net.l2": 3.0, "net.dropout": 0.001}),
            json!({"net.activation": "relu"}),
            json!({"net.stride": 2}),
        ]),
        group([
            // everything
            json!({"net.l1": 3.0, "net.l2": 3.0, "net.dropout": 0.5}),
            json!({"step_window": 400}),
            json!({"unimodal": true}),
        ]),
        group([
            json!({"scale": false}),
            json!({"baseline_mode": false}),
            json!({"net.window": 1}),
        ]),
        group([
            json!({"net.window": 3}),
            json!({"net.depth_post": 1}),
            json!({"net.stride": 1}),
        ]),
        group([
            json!({"net.depth_mid": 2}),
            json!({"punish_repeats": true}),
            json!({"arbitrage": false}),
        ]),
        group([
            json!({"batch_size": 9}),
            json!({"batch_size": 11}),
            json!({"indicators": false}),
        ]),
    ]
}

pub struct SearchDriver {
    pipeline: Pipeline,
    codec: VectorCodec,
    store: Arc<dyn RunStore>,
    trainer: Box<dyn Trainer>,
    optimizer: Box<dyn Optimizer>,
    config: SearchConfig,
    rng: StdRng,
}

impl SearchDriver {
    pub fn new(
        pipeline: Pipeline,
        store: Arc<dyn RunStore>,
        trainer: Box<dyn Trainer>,
        optimizer: Box<dyn Optimizer>,
        config: SearchConfig,
    ) -> Self {
        let codec = VectorCodec::new(pipeline.schema());
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            pipeline,
            codec,
            store,
            trainer,
            optimizer,
            config,
            rng,
        }
    }

    pub fn codec(&self) -> &VectorCodec {
        &self.codec
    }

    /// Guess phase (if configured), then feedback rounds until `max_rounds`.
    pub fn run(&mut self) -> Result<()> {
        if let Some(group) = self.config.guess_group {
            self.run_guess_phase(group)?;
        }

        let mut round = 0usize;
        while self.config.max_rounds.is_none_or(|max| round < max) {
            round += 1;
            info!(round, strategy = self.optimizer.name(), "feedback round");
            self.feedback_round()?;
        }
        Ok(())
    }

    /// Scores each override of `group` on top of the schema guesses.
    pub fn run_guess_phase(&mut self, group: usize) -> Result<()> {
        let table = guess_overrides();
        let available = table.len();
        let overrides = table
            .into_iter()
            .nth(group)
            .ok_or(HyperError::GuessGroupOutOfRange {
                index: group,
                available,
            })?;

        for (step, overrides) in overrides.into_iter().enumerate() {
            let mut actions = self.pipeline.schema().guesses();
            for (k, v) in overrides {
                if actions.contains_key(&k) {
                    actions.insert(k, v);
                } else {
                    warn!(key = %k, "override names a hyper this schema does not tune, skipping");
                }
            }
            info!(group, step, "scoring guess");
            self.score(&actions)?;
        }
        Ok(())
    }

    /// One real evaluation of `actions`. `Ok(None)` marks a failed round:
    /// nothing is persisted and the search goes on.
    pub fn score(&mut self, actions: &FlatRecord) -> Result<Option<f64>> {
        evaluate(
            &self.pipeline,
            self.trainer.as_mut(),
            self.store.as_ref(),
            actions,
        )
    }

    /// Scored history for the active agent and network family.
    pub fn history(&self) -> Result<Vec<Run>> {
        let agent = self.pipeline.schema().agent();
        Ok(self
            .store
            .select_all(self.pipeline.schema().net())?
            .into_iter()
            .filter(|r| r.agent == agent && r.score.is_finite())
            .collect())
    }

    /// Reload history, refit the surrogate, let the optimizer propose and
    /// score.
    pub fn feedback_round(&mut self) -> Result<()> {
        let runs = self.history()?;
        let mut x_list: Vec<Vec<f64>> = runs.iter().map(|r| self.codec.encode(&r.flat)).collect();
        let mut y_list: Vec<f64> = runs.iter().map(|r| r.score).collect();
        debug!(runs = runs.len(), "history loaded");

        let surrogate = fit_surrogate(&x_list, &y_list, &self.config.grid, &mut self.rng);
        match &surrogate {
            Some(model) => {
                info!(
                    cv_mse = model.cv_mse,
                    n_estimators = model.params.n_estimators,
                    "surrogate fit"
                );
                let ranked = model.ranked_importances(self.codec.feature_names());
                let lines: Vec<String> = ranked
                    .iter()
                    .map(|(name, imp)| format!("{name}: {imp:.4}"))
                    .collect();
                info!("--- Feature Importances ---\n{}", lines.join("\n"));
            }
            None => debug!(runs = runs.len(), "not enough history for a surrogate"),
        }
        self.optimizer.use_surrogate(surrogate);

        if self.optimizer.needs_distinct_inputs() {
            jitter(&mut x_list, &mut self.rng);
        }

        let Self {
            pipeline,
            codec,
            store,
            trainer,
            optimizer,
            ..
        } = self;
        let mut loss_fn = |vec: &[f64]| -> Result<Option<f64>> {
            let actions = codec.decode(vec);
            evaluate(pipeline, trainer.as_mut(), store.as_ref(), &actions)
        };
        optimizer.optimize(&mut loss_fn, codec.bounds(), &mut x_list, &mut y_list)
    }

    /// Hyper set of a stored run, or of the all-guesses default.
    pub fn winner(&self, id: Option<&str>) -> Result<HyperSet> {
        let record = match id {
            Some(id) => Some(self.store.select_by_id(id)?.flat),
            None => None,
        };
        self.pipeline.winner(record)
    }
}

fn evaluate(
    pipeline: &Pipeline,
    trainer: &mut dyn Trainer,
    store: &dyn RunStore,
    actions: &FlatRecord,
) -> Result<Option<f64>> {
    let hypers = match pipeline.build(actions) {
        Ok(h) => h,
        Err(e @ (HyperError::Network(_) | HyperError::Coercion { .. })) => {
            warn!(error = %e, "round failed");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let outcome = match trainer.train(&hypers) {
        Ok(o) => o,
        Err(e) => {
            let err = HyperError::Evaluation(format!("{e:#}"));
            warn!(error = %err, "round failed");
            return Ok(None);
        }
    };
    let score = match outcome.final_score() {
        Some(s) if s.is_finite() => s,
        other => {
            let err = HyperError::Evaluation(format!("unusable score {other:?}"));
            warn!(error = %err, "round failed");
            return Ok(None);
        }
    };

    let schema = pipeline.schema();
    let id = store.insert(NewRun {
        agent: schema.agent().to_string(),
        net: schema.net().to_string(),
        flat: hypers.flat,
        score,
        advantages: outcome.advantages,
        uniques: outcome.uniques,
        prices: outcome.prices,
        signals: outcome.signals,
    })?;
    info!(run = %id, "run scored: {score:.4}");
    Ok(Some(score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypers::HyperSchema;

    #[test]
    fn override_table_shape() {
        let table = guess_overrides();
        assert_eq!(table.len(), 9);
        assert!(table.iter().all(|g| g.len() == 3));
        assert!(table[0][0].is_empty());
        assert_eq!(table[8][2]["indicators"], json!(false));
    }

    #[test]
    fn overrides_name_known_hypers() {
        let conv = HyperSchema::load("ppo_agent", "conv2d").unwrap();
        let lstm = HyperSchema::load("ppo_agent", "lstm").unwrap();
        for group in guess_overrides() {
            for o in group {
                for k in o.keys() {
                    assert!(
                        conv.spec(k).is_some() || lstm.spec(k).is_some(),
                        "unknown override key {k}"
                    );
                }
            }
        }
    }
}
