//! Hyperparameter search for reinforcement-learning trading agents.
//!
//! A declarative schema of tunable hypers is compiled into a flat record
//! (persisted per run) and nested trainer/network configs. Scored runs feed a
//! surrogate model that proposes the next candidate.

pub mod codec;
pub mod dotdict;
pub mod error;
pub mod gp;
pub mod hypers;
pub mod network;
pub mod optimizer;
pub mod pipeline;
pub mod search;
pub mod store;
pub mod surrogate;
pub mod trainer;

pub use codec::VectorCodec;
pub use dotdict::DotDict;
pub use error::{HyperError, Result, StoreError, StoreResult};
pub use hypers::{FlatRecord, Hyper, HyperKind, HyperSchema, HyperSpec, Section};
pub use network::{NetworkBuilder, TreeNetwork};
pub use optimizer::{BayesConfig, BayesianSearch, BoostConfig, BoostedSearch, Optimizer};
pub use pipeline::{HyperSet, Pipeline, PipelineConfig};
pub use search::{SearchConfig, SearchDriver};
pub use store::{JsonlRunStore, MemoryRunStore, NewRun, Run, RunStore};
pub use surrogate::GridSearchConfig;
pub use trainer::{CommandTrainer, TrainOutcome, Trainer};
