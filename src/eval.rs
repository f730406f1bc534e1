//! Perplexity of held-out or new documents against trained distributions.
//!
//! Nothing here touches the training state: an [`Evaluator`] borrows a
//! [`TrainedDistributions`] and every document draws from its own generator,
//! so the same inputs always give the same report.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::corpus::{Corpus, Document};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::sampler::{derive_seed, sample_index};

// Keeps evaluation streams apart from the training sweeps.
const EVAL_STREAM: u64 = 0x6576_616c;

/// What training leaves behind for evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainedDistributions {
    /// D x K
    pub theta: Array2<f64>,
    /// K x W
    pub phi: Array2<f64>,
    /// Mean topic proportions of a new document.
    pub prior_mean: Vec<f64>,
    pub concentration: f64,
}

impl TrainedDistributions {
    pub fn new(model: &Model, theta: Array2<f64>, phi: Array2<f64>) -> Self {
        let (mean, b) = model.doc_prior_mean();
        TrainedDistributions {
            theta: theta,
            phi: phi,
            prior_mean: mean,
            concentration: b,
        }
    }

    /// Current point estimates of a model.
    pub fn current(model: &Model) -> Self {
        Self::new(model, model.theta(), model.phi())
    }

    pub fn num_topics(&self) -> usize {
        self.phi.rows()
    }

    pub fn num_words(&self) -> usize {
        self.phi.cols()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalMode {
    /// Test document d holds out tokens of training document d.
    HeldOut,
    /// Test documents are new; only the topics carry over.
    Query,
}

impl FromStr for EvalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "heldout" | "held-out" => Ok(EvalMode::HeldOut),
            "query" => Ok(EvalMode::Query),
            _ => Err(Error::config(format!("unknown test mode {:?}, expected heldout or query", s))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Estimator {
    /// Sample topics on the even positions, score the odd ones.
    DocumentCompletion,
    /// Wallach et al. (2009) left-to-right particle estimate.
    LeftToRight { particles: usize },
}

impl Estimator {
    pub fn parse(name: &str, particles: usize) -> Result<Self> {
        match name {
            "dc" | "completion" => Ok(Estimator::DocumentCompletion),
            "l2r" | "left-to-right" => {
                if particles == 0 {
                    return Err(Error::config("the left-to-right estimator needs at least one particle"));
                }
                Ok(Estimator::LeftToRight { particles: particles })
            }
            _ => Err(Error::config(format!("unknown estimator {:?}, expected dc or l2r", name))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct EvalReport {
    pub log_likelihood: f64,
    pub tokens: u64,
    pub oov: u64,
}

impl EvalReport {
    pub fn perplexity(&self) -> f64 {
        if self.tokens == 0 {
            return std::f64::NAN;
        }
        (-self.log_likelihood / self.tokens as f64).exp()
    }

    pub fn log2_perplexity(&self) -> f64 {
        if self.tokens == 0 {
            return std::f64::NAN;
        }
        -self.log_likelihood / (self.tokens as f64 * std::f64::consts::LN_2)
    }

    fn merge(&mut self, other: &EvalReport) {
        self.log_likelihood += other.log_likelihood;
        self.tokens += other.tokens;
        self.oov += other.oov;
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "tokens={} oov={} loglik={:.4} perplexity={:.4}",
            self.tokens,
            self.oov,
            self.log_likelihood,
            self.perplexity()
        )
    }
}

pub struct Evaluator<'a> {
    dist: &'a TrainedDistributions,
    mode: EvalMode,
    estimator: Estimator,
    test_cycles: usize,
    seed: u64,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        dist: &'a TrainedDistributions,
        mode: EvalMode,
        estimator: Estimator,
        test_cycles: usize,
        seed: u64,
    ) -> Self {
        Evaluator {
            dist: dist,
            mode: mode,
            estimator: estimator,
            test_cycles: test_cycles,
            seed: seed,
        }
    }

    pub fn evaluate(&self, corpus: &Corpus) -> Result<EvalReport> {
        if self.mode == EvalMode::HeldOut && corpus.num_documents() > self.dist.theta.rows() {
            return Err(Error::config(format!(
                "held-out corpus has {} documents but training had {}",
                corpus.num_documents(),
                self.dist.theta.rows()
            )));
        }
        let docs: Vec<(usize, &Document)> = corpus.documents.iter().enumerate().collect();

        #[cfg(feature = "parallel")]
        let reports: Vec<EvalReport> = docs.par_iter().map(|&(d, doc)| self.document(d, doc)).collect();
        #[cfg(not(feature = "parallel"))]
        let reports: Vec<EvalReport> = docs.iter().map(|&(d, doc)| self.document(d, doc)).collect();

        // summed in document order so the total does not depend on scheduling
        let mut total = EvalReport::default();
        for r in &reports {
            total.merge(r);
        }
        if total.oov > 0 {
            warn!(oov = total.oov, "skipped out-of-vocabulary tokens");
        }
        debug!(mode = ?self.mode, report = %total, "evaluated");
        Ok(total)
    }

    fn document(&self, d: usize, doc: &Document) -> EvalReport {
        let w = self.dist.num_words();
        let words: Vec<usize> = doc
            .words
            .iter()
            .map(|&x| x as usize)
            .filter(|&x| x < w)
            .collect();
        let mut report = EvalReport {
            oov: (doc.len() - words.len()) as u64,
            ..EvalReport::default()
        };
        if words.is_empty() {
            return report;
        }
        match self.mode {
            EvalMode::HeldOut => {
                let theta: Vec<f64> = self.dist.theta.row(d).to_vec();
                for &x in &words {
                    report.log_likelihood += self.token_ln_p(&theta, x);
                    report.tokens += 1;
                }
            }
            EvalMode::Query => {
                let mut rng = StdRng::seed_from_u64(derive_seed(self.seed, EVAL_STREAM, d as u64));
                match self.estimator {
                    Estimator::DocumentCompletion => self.completion(&words, &mut report, &mut rng),
                    Estimator::LeftToRight { particles } => {
                        self.left_to_right(&words, particles, &mut report, &mut rng)
                    }
                }
            }
        }
        report
    }

    fn token_ln_p(&self, theta: &[f64], word: usize) -> f64 {
        let mut p = 0.0;
        for (k, &t) in theta.iter().enumerate() {
            p += t * self.dist.phi[[k, word]];
        }
        p.ln()
    }

    // alpha_k = b m_k
    fn alpha(&self) -> Vec<f64> {
        self.dist
            .prior_mean
            .iter()
            .map(|&m| m * self.dist.concentration)
            .collect()
    }

    fn completion(&self, words: &[usize], report: &mut EvalReport, rng: &mut StdRng) {
        let k = self.dist.num_topics();
        let alpha = self.alpha();
        let b = self.dist.concentration;
        let observed: Vec<usize> = words.iter().step_by(2).cloned().collect();
        let held: Vec<usize> = words.iter().skip(1).step_by(2).cloned().collect();

        let theta = if self.test_cycles == 0 {
            self.dist.prior_mean.clone()
        } else {
            let mut z: Vec<usize> = observed.iter().map(|_| rng.gen_range(0, k)).collect();
            let mut n = vec![0u32; k];
            for &t in &z {
                n[t] += 1;
            }
            let total = observed.len() as f64;
            let mut theta = vec![0.0; k];
            let mut weights = Vec::with_capacity(k);
            let first_kept = self.test_cycles / 2;
            for sweep in 0..self.test_cycles {
                for (i, &x) in observed.iter().enumerate() {
                    n[z[i]] -= 1;
                    weights.clear();
                    for t in 0..k {
                        weights.push((n[t] as f64 + alpha[t]) * self.dist.phi[[t, x]]);
                    }
                    z[i] = sample_index(&weights, rng);
                    n[z[i]] += 1;
                }
                if sweep >= first_kept {
                    for t in 0..k {
                        theta[t] += (n[t] as f64 + alpha[t]) / (total + b);
                    }
                }
            }
            let kept = (self.test_cycles - first_kept) as f64;
            for t in theta.iter_mut() {
                *t /= kept;
            }
            theta
        };

        for &x in &held {
            report.log_likelihood += self.token_ln_p(&theta, x);
            report.tokens += 1;
        }
    }

    fn left_to_right(&self, words: &[usize], particles: usize, report: &mut EvalReport, rng: &mut StdRng) {
        let k = self.dist.num_topics();
        let alpha = self.alpha();
        let b = self.dist.concentration;
        // per position, summed over particles
        let mut p_sum = vec![0.0; words.len()];
        let mut weights = Vec::with_capacity(k);

        for _ in 0..particles {
            let mut z: Vec<usize> = Vec::with_capacity(words.len());
            let mut n = vec![0u32; k];
            for (pos, &x) in words.iter().enumerate() {
                // revisit the topics of the earlier positions
                for i in 0..pos {
                    let xi = words[i];
                    n[z[i]] -= 1;
                    weights.clear();
                    for t in 0..k {
                        weights.push((n[t] as f64 + alpha[t]) * self.dist.phi[[t, xi]]);
                    }
                    z[i] = sample_index(&weights, rng);
                    n[z[i]] += 1;
                }
                weights.clear();
                let mut p = 0.0;
                for t in 0..k {
                    let wt = (n[t] as f64 + alpha[t]) * self.dist.phi[[t, x]];
                    weights.push(wt);
                    p += wt;
                }
                p_sum[pos] += p / (pos as f64 + b);
                let t = sample_index(&weights, rng);
                z.push(t);
                n[t] += 1;
            }
        }

        for &p in &p_sum {
            report.log_likelihood += (p / particles as f64).ln();
            report.tokens += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    // Two topics over four words; topic 0 covers words 0-1, topic 1 words 2-3.
    fn distributions() -> TrainedDistributions {
        TrainedDistributions {
            theta: arr2(&[[0.9, 0.1], [0.2, 0.8]]),
            phi: arr2(&[[0.45, 0.45, 0.05, 0.05], [0.05, 0.05, 0.45, 0.45]]),
            prior_mean: vec![0.5, 0.5],
            concentration: 1.0,
        }
    }

    fn corpus() -> Corpus {
        Corpus::from_documents(vec![vec![0, 1, 0, 1, 0, 9], vec![2, 3, 3, 2]])
    }

    #[test]
    fn held_out_uses_training_proportions() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::HeldOut, Estimator::DocumentCompletion, 10, 1);
        let report = eval.evaluate(&corpus()).unwrap();
        assert_eq!(report.tokens, 9);
        assert_eq!(report.oov, 1);
        let p0 = (0.9f64 * 0.45 + 0.1 * 0.05).ln();
        let p1 = (0.2f64 * 0.05 + 0.8 * 0.45).ln();
        assert_relative_eq!(report.log_likelihood, 5.0 * p0 + 4.0 * p1, max_relative = 1e-12);
        assert_relative_eq!(
            report.log2_perplexity(),
            report.perplexity().log2(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn held_out_rejects_extra_documents() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::HeldOut, Estimator::DocumentCompletion, 10, 1);
        let big = Corpus::from_documents(vec![vec![0], vec![1], vec![2]]);
        assert!(eval.evaluate(&big).is_err());
    }

    #[test]
    fn query_is_repeatable() {
        let dist = distributions();
        for &est in &[Estimator::DocumentCompletion, Estimator::LeftToRight { particles: 5 }] {
            let eval = Evaluator::new(&dist, EvalMode::Query, est, 20, 7);
            let a = eval.evaluate(&corpus()).unwrap();
            let b = eval.evaluate(&corpus()).unwrap();
            assert_eq!(a, b);
            assert!(a.log_likelihood.is_finite());
        }
    }

    #[test]
    fn completion_scores_odd_positions() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::Query, Estimator::DocumentCompletion, 0, 1);
        let report = eval.evaluate(&corpus()).unwrap();
        // document 0 keeps 5 in-vocabulary tokens, document 1 keeps 4
        assert_eq!(report.tokens, 2 + 2);
        // with no sweeps theta is the prior mean
        let ll = 2.0 * (0.5f64 * 0.45 + 0.5 * 0.05).ln() * 2.0;
        assert_relative_eq!(report.log_likelihood, ll, max_relative = 1e-12);
    }

    #[test]
    fn completion_learns_the_document_topic() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::Query, Estimator::DocumentCompletion, 40, 3);
        let doc = Corpus::from_documents(vec![vec![2, 3, 2, 3, 2, 3, 2, 3, 2, 3]]);
        let report = eval.evaluate(&doc).unwrap();
        let flat = (0.5f64 * 0.45 + 0.5 * 0.05).ln() * 5.0;
        assert!(report.log_likelihood > flat);
    }

    #[test]
    fn left_to_right_scores_every_token() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::Query, Estimator::LeftToRight { particles: 3 }, 0, 2);
        let report = eval.evaluate(&corpus()).unwrap();
        assert_eq!(report.tokens, 9);
        assert_eq!(report.oov, 1);
        // first token of a document is scored under the prior mean
        let single = Corpus::from_documents(vec![vec![1]]);
        let r = eval.evaluate(&single).unwrap();
        assert_relative_eq!(r.log_likelihood, (0.5f64 * 0.45 + 0.5 * 0.05).ln(), max_relative = 1e-12);
    }

    #[test]
    fn parses_modes_and_estimators() {
        assert_eq!("query".parse::<EvalMode>().unwrap(), EvalMode::Query);
        assert!("both".parse::<EvalMode>().is_err());
        assert_eq!(
            Estimator::parse("l2r", 4).unwrap(),
            Estimator::LeftToRight { particles: 4 }
        );
        assert!(Estimator::parse("l2r", 0).is_err());
        assert!(Estimator::parse("is", 4).is_err());
    }

    #[test]
    fn empty_documents_score_nothing() {
        let dist = distributions();
        let eval = Evaluator::new(&dist, EvalMode::Query, Estimator::DocumentCompletion, 5, 1);
        let report = eval.evaluate(&Corpus::from_documents(vec![vec![], vec![]])).unwrap();
        assert_eq!(report.tokens, 0);
        assert!(report.perplexity().is_nan());
    }
}
