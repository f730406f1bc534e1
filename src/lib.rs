extern crate either;
extern crate ndarray;
extern crate rand;
extern crate regex;
extern crate statrs;

pub mod def;
pub mod error;
pub use error::{Error, Result};

pub mod logging;

pub mod special;
pub mod stirling;
pub mod ars;

pub mod prior;
pub use prior::{HierarchyKind, Hyper, NodePrior, PriorFamily};

mod counts;
pub use counts::TopicWordCounts;

pub mod corpus;
pub use corpus::{Corpus, Document, TermMapping, Vocabulary};

pub mod pyp;
pub mod hierarchy;
pub mod sparse;
pub mod document;

pub mod model;
pub use model::{Model, ModelSpec};

pub mod sampler;
pub use sampler::Sampler;

pub mod hyper;

pub mod eval;
pub use eval::{EvalMode, EvalReport, Estimator, Evaluator, TrainedDistributions};

pub mod snapshot;
pub use snapshot::Snapshot;

pub mod config;
pub use config::Config;

mod trainer;
pub use trainer::{Phase, RunSummary, Trainer};
