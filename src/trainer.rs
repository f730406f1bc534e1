//! The run itself: load, sample, resample hyperparameters, evaluate, save.

use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ars::Settings;
use crate::config::{Config, RestartMode};
use crate::corpus::{read_groups, Corpus, TermMapping, Vocabulary};
use crate::def::*;
use crate::error::{Error, Result};
use crate::eval::{EvalMode, EvalReport, Estimator, Evaluator, TrainedDistributions};
use crate::hyper::{current_values, resample_model, HyperStats, Resampling};
use crate::model::Model;
use crate::prior::HierarchyKind;
use crate::sampler::Sampler;
use crate::snapshot::{write_doc_topic, write_top_words, write_topic_word, Snapshot, SnapshotMeta};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    BurnIn,
    Sampling,
    HyperparamResample,
    Evaluating,
    Persisting,
    Terminated,
}

/// One `log_2(perp)=` report.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PerplexityPoint {
    pub cycle: usize,
    pub train: f64,
    pub test: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    /// Cycles run in this invocation.
    pub cycles: usize,
    /// In-sample fit of the final distributions.
    pub train: Option<EvalReport>,
    pub test: Option<EvalReport>,
    pub hyper: HyperStats,
    pub trace: Vec<PerplexityPoint>,
    /// Values after each resampling pass, by cycle.
    pub hyper_history: Vec<(usize, Vec<(String, f64)>)>,
    pub hyperparameters: Vec<(String, f64)>,
}

pub struct Trainer {
    config: Config,
    corpus: Corpus,
    test_corpus: Option<Corpus>,
    vocabulary: Vocabulary,
    model: Model,
    sampler: Sampler,
    rng: StdRng,
    phase: Phase,
    // cycles completed before this invocation
    start_cycle: usize,
    // saved distributions of an evaluation-only restart
    restored: Option<TrainedDistributions>,
    theta_sum: Array2<f64>,
    phi_sum: Array2<f64>,
    samples: usize,
    hyper_settings: Resampling,
    hyper_stats: HyperStats,
}

impl Trainer {
    pub fn new(mut config: Config) -> Result<Self> {
        info!(stem = %config.stem.display(), "loading corpus");
        let vocabulary_path = config.vocabulary_path();
        let vocabulary = if vocabulary_path.exists() {
            Vocabulary::read(&vocabulary_path)?
        } else {
            Vocabulary::new()
        };
        let mapping = match &config.mapping {
            Some(path) => {
                let v = if vocabulary.is_empty() { None } else { Some(&vocabulary) };
                Some(TermMapping::read(path, v)?)
            }
            None => None,
        };
        let corpus = Corpus::read_ldac(&config.corpus_path(), mapping.as_ref())?;
        let mut num_words = vocabulary.len().max(corpus.id_bound());

        if config.eval_mode.is_none() && config.estimate {
            if config.test_corpus.exists() {
                config.eval_mode = Some(EvalMode::HeldOut);
            } else {
                info!(path = %config.test_corpus.display(), "no test corpus, reporting training perplexity only");
            }
        }
        let test_corpus = match config.eval_mode {
            Some(mode) => {
                let test = Corpus::read_ldac(&config.test_corpus, mapping.as_ref())?;
                if mode == EvalMode::HeldOut && test.num_documents() > corpus.num_documents() {
                    return Err(Error::config(format!(
                        "held-out corpus has {} documents but the training corpus {}",
                        test.num_documents(),
                        corpus.num_documents()
                    )));
                }
                Some(test)
            }
            None => None,
        };

        let groups = match (config.spec.hierarchy, config.groups_path()) {
            (HierarchyKind::Grouped, Some(path)) => Some(read_groups(path, corpus.num_documents())?),
            _ => None,
        };

        let snapshot = match config.restart {
            Some(_) => {
                let s = Snapshot::load(&config.out_stem)?;
                // without a vocabulary file the saved size is the better guess
                if vocabulary.is_empty() && num_words <= s.meta.num_words {
                    num_words = s.meta.num_words;
                }
                s.check_compatible(config.spec.num_topics, num_words)?;
                Some(s)
            }
            None => None,
        };

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut start_cycle = 0;
        let mut restored = None;
        let model = match (config.restart, snapshot) {
            (Some(RestartMode::Resume), Some(s)) => {
                if config.priors_given() {
                    for name in config.spec.differences(&s.meta.spec) {
                        warn!(setting = name, "command-line prior differs from the snapshot; using the saved one");
                    }
                }
                let mut spec = s.meta.spec.clone();
                if config.hyper_every == 0 {
                    spec = spec.frozen();
                }
                let mut model = Model::new(&spec, &corpus, num_words, groups.as_ref().map(|g| &g[..]), None)?;
                model.initialize(Some(&s.assignments), &mut rng)?;
                start_cycle = s.meta.cycles;
                if config.cycles == 0 {
                    restored = Some(TrainedDistributions {
                        theta: s.theta,
                        phi: s.phi,
                        prior_mean: s.meta.doc_prior_mean,
                        concentration: s.meta.doc_concentration,
                    });
                }
                info!(cycles = start_cycle, "resumed from snapshot");
                model
            }
            (Some(RestartMode::Topics), Some(s)) => {
                let mut model = Model::new(
                    &config.spec,
                    &corpus,
                    num_words,
                    groups.as_ref().map(|g| &g[..]),
                    Some(s.phi),
                )?;
                model.initialize(None, &mut rng)?;
                info!("topic-word distributions fixed from snapshot");
                model
            }
            _ => {
                let mut model = Model::new(&config.spec, &corpus, num_words, groups.as_ref().map(|g| &g[..]), None)?;
                model.initialize(None, &mut rng)?;
                model
            }
        };
        info!(
            documents = model.num_documents(),
            tokens = model.num_tokens(),
            words = model.num_words(),
            topics = model.num_topics(),
            "model initialized"
        );

        let sampler = Sampler::new(config.threads, config.seed)?;
        let hyper_settings = Resampling {
            sampler: Settings::default(),
            max_customers: config.stirling_limits.0,
            max_tables: config.stirling_limits.1,
        };
        let k = model.num_topics();
        Ok(Trainer {
            theta_sum: Array2::zeros((model.num_documents(), k)),
            phi_sum: Array2::zeros((k, model.num_words())),
            config: config,
            corpus: corpus,
            test_corpus: test_corpus,
            vocabulary: vocabulary,
            model: model,
            sampler: sampler,
            rng: rng,
            phase: Phase::Initializing,
            start_cycle: start_cycle,
            restored: restored,
            samples: 0,
            hyper_settings: hyper_settings,
            hyper_stats: HyperStats::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            match (self.phase, phase) {
                (Phase::HyperparamResample, _) | (_, Phase::HyperparamResample) => {
                    debug!(from = ?self.phase, to = ?phase, "phase")
                }
                _ => info!(from = ?self.phase, to = ?phase, "phase"),
            }
            self.phase = phase;
        }
    }

    /// Every remaining phase. On error the trainer is left `Terminated` and
    /// files already written stay in place.
    pub fn run(&mut self) -> Result<RunSummary> {
        match self.run_phases() {
            Ok(summary) => {
                self.enter(Phase::Terminated);
                Ok(summary)
            }
            Err(e) => {
                self.enter(Phase::Terminated);
                Err(e)
            }
        }
    }

    fn run_phases(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        self.train(&mut summary)?;

        let dist = self.distributions();
        let in_sample = Evaluator::new(&dist, EvalMode::HeldOut, Estimator::DocumentCompletion, 0, self.config.seed)
            .evaluate(&self.corpus)?;
        info!(report = %in_sample, "training fit");
        summary.train = Some(in_sample);

        if let Some(mode) = self.config.eval_mode {
            self.enter(Phase::Evaluating);
            summary.test = Some(self.evaluate(&dist, mode)?);
        }

        self.enter(Phase::Persisting);
        self.persist(&dist)?;
        summary.hyper = self.hyper_stats;
        summary.hyperparameters = current_values(&self.model);
        Ok(summary)
    }

    fn train(&mut self, summary: &mut RunSummary) -> Result<()> {
        let cycles = self.config.cycles;
        let burn_in = self.config.burn_in;
        if cycles == 0 {
            return Ok(());
        }
        let started = Instant::now();
        for c in 0..cycles {
            self.enter(if c < burn_in { Phase::BurnIn } else { Phase::Sampling });
            let sweep = (self.start_cycle + c) as u64;
            self.sampler.sweep(&mut self.model, sweep, &mut self.rng);

            if c >= burn_in {
                self.theta_sum += &self.model.theta();
                self.phi_sum += &self.model.phi();
                self.samples += 1;
            }

            let done = c + 1;
            if self.config.hyper_every > 0 && done % self.config.hyper_every == 0 {
                self.enter(Phase::HyperparamResample);
                resample_model(&mut self.model, &self.hyper_settings, &mut self.hyper_stats, &mut self.rng);
                summary
                    .hyper_history
                    .push((self.start_cycle + done, current_values(&self.model)));
            }
            if self.config.report_every > 0 && done % self.config.report_every == 0 {
                let point = self.report(self.start_cycle + done)?;
                summary.trace.push(point);
            }
            debug!(cycle = self.start_cycle + done, "sweep done");
        }
        summary.cycles = cycles;
        info!(
            cycles = cycles,
            elapsed_ms = started.elapsed().as_millis() as u64,
            draws = self.hyper_stats.draws,
            failures = self.hyper_stats.failures,
            "training done"
        );
        Ok(())
    }

    // The `log_2(perp)=train[,test]` line is read by the orchestration
    // scripts, which take the first value.
    fn report(&self, cycle: usize) -> Result<PerplexityPoint> {
        let dist = TrainedDistributions::current(&self.model);
        let train = Evaluator::new(&dist, EvalMode::HeldOut, Estimator::DocumentCompletion, 0, self.config.seed)
            .evaluate(&self.corpus)?
            .log2_perplexity();
        let test = match (&self.test_corpus, self.config.eval_mode) {
            (Some(test), Some(EvalMode::HeldOut)) => Some(
                Evaluator::new(&dist, EvalMode::HeldOut, Estimator::DocumentCompletion, 0, self.config.seed)
                    .evaluate(test)?
                    .log2_perplexity(),
            ),
            _ => None,
        };
        match test {
            Some(t) => eprintln!("log_2(perp)={:.4},{:.4}", train, t),
            None => eprintln!("log_2(perp)={:.4}", train),
        }
        info!(cycle = cycle, train = train, test = ?test, "perplexity");
        Ok(PerplexityPoint {
            cycle: cycle,
            train: train,
            test: test,
        })
    }

    /// Averaged estimates over the sampling sweeps, the saved ones of an
    /// evaluation-only restart, or the current ones.
    pub fn distributions(&self) -> TrainedDistributions {
        if let Some(d) = &self.restored {
            return d.clone();
        }
        if self.samples == 0 {
            return TrainedDistributions::current(&self.model);
        }
        let n = self.samples as f64;
        TrainedDistributions::new(&self.model, &self.theta_sum / n, &self.phi_sum / n)
    }

    fn evaluate(&self, dist: &TrainedDistributions, mode: EvalMode) -> Result<EvalReport> {
        let test = match &self.test_corpus {
            Some(t) => t,
            None => return Err(Error::config("evaluation requested without a test corpus")),
        };
        let report = Evaluator::new(dist, mode, self.config.estimator, self.config.test_cycles, self.config.seed)
            .evaluate(test)?;
        if report.tokens == 0 {
            warn!("test corpus has no scorable tokens");
        }
        info!(mode = ?mode, report = %report, "evaluation");
        Ok(report)
    }

    fn persist(&self, dist: &TrainedDistributions) -> Result<()> {
        let hyperparameters: BTreeMap<String, f64> = current_values(&self.model).into_iter().collect();
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                version: SNAPSHOT_VERSION,
                num_topics: self.model.num_topics(),
                num_words: self.model.num_words(),
                num_documents: self.model.num_documents(),
                spec: self.model.current_spec(),
                cycles: self.start_cycle + self.config.cycles,
                seed: self.config.seed,
                hyperparameters: hyperparameters,
                doc_prior_mean: dist.prior_mean.clone(),
                doc_concentration: dist.concentration,
            },
            theta: dist.theta.clone(),
            phi: dist.phi.clone(),
            assignments: self.model.assignments(),
        };
        snapshot.save(&self.config.out_stem)?;

        let outputs = self.config.outputs;
        if outputs.doc_topic {
            write_doc_topic(&self.config.output(DOC_TOPIC_SUFFIX), &self.model.doc_topic_counts())?;
        }
        if outputs.topic_word {
            write_topic_word(&self.config.output(TOPIC_WORD_SUFFIX), &self.model.shared.raw)?;
        }
        if outputs.top_words {
            write_top_words(
                &self.config.output(TOP_WORDS_SUFFIX),
                &dist.phi,
                &self.vocabulary,
                self.config.top_words,
            )?;
        }
        Ok(())
    }
}
