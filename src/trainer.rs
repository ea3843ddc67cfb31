//! The training collaborator: takes a hyper set, trains and back-tests an
//! agent, reports how it did.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::HyperSet;

/// What one training run reports back.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    /// Explicit score; when absent the final advantage is used
    #[serde(default)]
    pub score: Option<f64>,
    /// Per-episode advantage over buy-and-hold
    #[serde(default)]
    pub advantages: Vec<f64>,
    /// Per-episode count of distinct actions taken
    #[serde(default)]
    pub uniques: Vec<f64>,
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub signals: Vec<f64>,
}

impl TrainOutcome {
    pub fn final_score(&self) -> Option<f64> {
        self.score.or_else(|| self.advantages.last().copied())
    }
}

pub trait Trainer {
    fn train(&mut self, hypers: &HyperSet) -> Result<TrainOutcome>;
}

impl<F> Trainer for F
where
    F: FnMut(&HyperSet) -> Result<TrainOutcome>,
{
    fn train(&mut self, hypers: &HyperSet) -> Result<TrainOutcome> {
        self(hypers)
    }
}

/// Runs an external program per candidate: the hyper set goes to its stdin
/// as JSON, a [`TrainOutcome`] is read back from its stdout.
#[derive(Clone, Debug)]
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
}

impl CommandTrainer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Trainer for CommandTrainer {
    fn train(&mut self, hypers: &HyperSet) -> Result<TrainOutcome> {
        let payload = serde_json::to_vec(hypers).context("Failed to serialize hyper set")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start trainer `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .context("Failed to write hyper set to trainer stdin")?;
        }

        let output = child
            .wait_with_output()
            .context("Failed to wait for trainer")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Trainer exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(bytes = stdout.len(), "trainer finished");
        serde_json::from_str(stdout.trim()).context("Trainer output is not a valid outcome")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_score_falls_back_to_last_advantage() {
        let outcome: TrainOutcome =
            serde_json::from_value(json!({"advantages": [0.5, -1.0, 2.5]})).unwrap();
        assert_eq!(outcome.final_score(), Some(2.5));

        let outcome: TrainOutcome =
            serde_json::from_value(json!({"score": 1.0, "advantages": [2.5]})).unwrap();
        assert_eq!(outcome.final_score(), Some(1.0));

        assert_eq!(TrainOutcome::default().final_score(), None);
    }
}
