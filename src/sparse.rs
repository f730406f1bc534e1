//! Sparse topic-word prior. Each topic switches words on or off; a word that
//! is off keeps a small leak of prior mass so it can still be drawn, and is
//! switched on as soon as a token of it lands in the topic.
//!
//!   p(w | k) = (n_kw + beta g(s_kw)) / (N_k + beta A_k)
//!   g(1) = 1, g(0) = SPARSE_LEAK, A_k = sum_w g(s_kw)

use rand::distributions::{Beta, Distribution};
use rand::Rng;

use crate::counts::zeroed;
use crate::def::{SPARSE_LEAK, SPARSITY_MAX, SPARSITY_MIN, SPARSITY_PRIOR_A, SPARSITY_PRIOR_B};
use crate::error::Result;
use crate::prior::Hyper;
use crate::special::ln_rising;

#[derive(Clone, Debug)]
pub struct SparseTopics {
    topics: usize,
    words: usize,
    pub concentration: Hyper,
    pub sparsity: Hyper,
    counts: Vec<u32>,
    totals: Vec<u64>,
    active: Vec<bool>,
    num_active: Vec<u32>,
}

fn gate(active: bool) -> f64 {
    if active {
        1.0
    } else {
        SPARSE_LEAK
    }
}

impl SparseTopics {
    /// Every word starts switched on.
    pub fn new(topics: usize, words: usize, concentration: Hyper, sparsity: Hyper) -> Result<Self> {
        let len = topics * words;
        let mut active: Vec<bool> = zeroed(len, "sparse topic indicators")?;
        for a in active.iter_mut() {
            *a = true;
        }
        Ok(Self {
            topics: topics,
            words: words,
            concentration: concentration,
            sparsity: sparsity,
            counts: zeroed(len, "sparse topic counts")?,
            totals: vec![0; topics],
            active: active,
            num_active: vec![words as u32; topics],
        })
    }

    pub fn num_topics(&self) -> usize {
        self.topics
    }

    pub fn count(&self, topic: usize, word: usize) -> u32 {
        self.counts[topic * self.words + word]
    }

    pub fn topic_total(&self, topic: usize) -> u64 {
        self.totals[topic]
    }

    pub fn is_active(&self, topic: usize, word: usize) -> bool {
        self.active[topic * self.words + word]
    }

    pub fn num_active(&self, topic: usize) -> u32 {
        self.num_active[topic]
    }

    /// A_k, the prior mass of topic k in units of beta.
    pub fn prior_mass(&self, topic: usize) -> f64 {
        let s = self.num_active[topic] as f64;
        s + SPARSE_LEAK * (self.words as f64 - s)
    }

    pub fn predictive(&self, topic: usize, word: usize) -> f64 {
        let beta = self.concentration.value;
        let i = topic * self.words + word;
        (self.counts[i] as f64 + beta * gate(self.active[i]))
            / (self.totals[topic] as f64 + beta * self.prior_mass(topic))
    }

    pub fn add(&mut self, topic: usize, word: usize) {
        let i = topic * self.words + word;
        self.counts[i] += 1;
        self.totals[topic] += 1;
        if !self.active[i] {
            self.active[i] = true;
            self.num_active[topic] += 1;
        }
    }

    pub fn remove(&mut self, topic: usize, word: usize) {
        let i = topic * self.words + word;
        if self.counts[i] > 0 {
            self.counts[i] -= 1;
            self.totals[topic] -= 1;
        }
    }

    /// Fold a worker's counts into these; a word switched on anywhere stays on.
    pub fn apply_delta(&mut self, base: &SparseTopics, worker: &SparseTopics) {
        for i in 0..self.counts.len() {
            let d = worker.counts[i] as i64 - base.counts[i] as i64;
            if d != 0 {
                self.counts[i] = (self.counts[i] as i64 + d).max(0) as u32;
            }
            self.active[i] = self.active[i] || worker.active[i];
        }
        self.recount();
    }

    fn recount(&mut self) {
        for k in 0..self.topics {
            let row = k * self.words..(k + 1) * self.words;
            self.totals[k] = self.counts[row.clone()].iter().map(|&c| c as u64).sum();
            self.num_active[k] = self.active[row].iter().filter(|&&a| a).count() as u32;
        }
    }

    /// Redraw the indicator of every word with no tokens in its topic. The
    /// ratio compares the collapsed likelihood of the topic's counts with the
    /// word switched on and off.
    pub fn resample_indicators<R: Rng>(&mut self, rng: &mut R) -> usize {
        let beta = self.concentration.value;
        let ln_on = self.sparsity.value.ln();
        let ln_off = (1.0 - self.sparsity.value).ln();
        let mut flips = 0;
        for k in 0..self.topics {
            let n_k = self.totals[k];
            let n_k32 = n_k.min(std::u32::MAX as u64) as u32;
            for w in 0..self.words {
                let i = k * self.words + w;
                if self.counts[i] > 0 {
                    continue;
                }
                let rest = self.prior_mass(k) - gate(self.active[i]);
                let lp_on = ln_on - ln_rising(beta * (rest + 1.0), n_k32);
                let lp_off = ln_off - ln_rising(beta * (rest + SPARSE_LEAK), n_k32);
                let p_on = 1.0 / (1.0 + (lp_off - lp_on).exp());
                let on = rng.gen::<f64>() < p_on;
                if on != self.active[i] {
                    flips += 1;
                    self.active[i] = on;
                    if on {
                        self.num_active[k] += 1;
                    } else {
                        self.num_active[k] -= 1;
                    }
                }
            }
        }
        flips
    }

    /// Conjugate Beta draw of the probability that a word is switched on.
    pub fn resample_sparsity<R: Rng>(&mut self, rng: &mut R) {
        if !self.sparsity.learn {
            return;
        }
        let on: f64 = self.num_active.iter().map(|&s| s as f64).sum();
        let all = (self.topics * self.words) as f64;
        let dist = Beta::new(SPARSITY_PRIOR_A + on, SPARSITY_PRIOR_B + all - on);
        let draw = dist.sample(rng);
        self.sparsity.value = draw.max(SPARSITY_MIN).min(SPARSITY_MAX);
    }

    /// ln p(counts | beta) up to terms free of beta.
    pub fn ln_likelihood(&self, beta: f64) -> f64 {
        let mut ll = 0.0;
        for k in 0..self.topics {
            let n_k = self.totals[k].min(std::u32::MAX as u64) as u32;
            ll -= ln_rising(beta * self.prior_mass(k), n_k);
            for &c in &self.counts[k * self.words..(k + 1) * self.words] {
                if c > 0 {
                    ll += ln_rising(beta, c);
                }
            }
        }
        ll
    }

    /// d/d beta of `ln_likelihood`.
    pub fn ln_likelihood_derivative(&self, beta: f64) -> f64 {
        use crate::special::digamma_rising;
        let mut d = 0.0;
        for k in 0..self.topics {
            let n_k = self.totals[k].min(std::u32::MAX as u64) as u32;
            let mass = self.prior_mass(k);
            d -= mass * digamma_rising(beta * mass, n_k);
            for &c in &self.counts[k * self.words..(k + 1) * self.words] {
                if c > 0 {
                    d += digamma_rising(beta, c);
                }
            }
        }
        d
    }

    pub fn check(&self) -> std::result::Result<(), String> {
        for k in 0..self.topics {
            let row = &self.counts[k * self.words..(k + 1) * self.words];
            let total: u64 = row.iter().map(|&c| c as u64).sum();
            if total != self.totals[k] {
                return Err(format!("sparse topic {} total is out of date", k));
            }
            for (w, &c) in row.iter().enumerate() {
                if c > 0 && !self.is_active(k, w) {
                    return Err(format!("word {} has tokens in topic {} but is off", w, k));
                }
            }
        }
        Ok(())
    }
}
