//! Hyperparameter resampling. Every concentration and discount is drawn from
//! its conditional given the current customer and table counts, one at a
//! time with the rest held fixed.

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::ars::{self, LogDensity, SampleError, Settings};
use crate::def::*;
use crate::model::{Model, WordSide};
use crate::prior::NodePrior;
use crate::pyp::Restaurant;
use crate::sparse::SparseTopics;
use crate::special::{digamma_rising, discounted_harmonic, ln_rising, ln_rising_discounted};
use crate::stirling::ln_stirling_sum;

/// Counts of every restaurant sharing one prior.
#[derive(Clone, Debug, Default)]
pub struct NodeStats {
    // (customers, tables) per restaurant
    totals: Vec<(u64, u64)>,
    // (customers, tables) per occupied dish
    pairs: Vec<(u32, u32)>,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_restaurants<'a, I: IntoIterator<Item = &'a Restaurant>>(restaurants: I) -> Self {
        let mut stats = NodeStats::new();
        for r in restaurants {
            stats.add_restaurant(r);
        }
        stats
    }

    pub fn add_restaurant(&mut self, r: &Restaurant) {
        if r.is_empty() {
            return;
        }
        self.add_totals(r.total_customers(), r.total_tables());
        for (&n, &t) in r.customer_counts().iter().zip(r.table_counts().iter()) {
            if n > 0 {
                self.pairs.push((n, t));
            }
        }
    }

    pub fn add_totals(&mut self, customers: u64, tables: u64) {
        if customers > 0 {
            self.totals.push((customers, tables));
        }
    }

    pub fn add_pair(&mut self, customers: u32, tables: u32) {
        if customers > 0 {
            self.pairs.push((customers, tables));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

fn clamp_u32(x: u64) -> u32 {
    x.min(std::u32::MAX as u64) as u32
}

/// Univariate sampler settings, plus the largest customer and table counts
/// a discount is scored on (`-N maxN,maxM`).
#[derive(Clone, Copy, Debug)]
pub struct Resampling {
    pub sampler: Settings,
    pub max_customers: usize,
    pub max_tables: usize,
}

impl Default for Resampling {
    fn default() -> Self {
        Resampling {
            sampler: Settings::default(),
            max_customers: STIRLING_HYPER_MAX_N,
            max_tables: STIRLING_HYPER_MAX_T,
        }
    }
}

/// Draws, slice fallbacks and failures over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct HyperStats {
    pub draws: usize,
    pub slice_fallbacks: usize,
    pub failures: usize,
}

// Gamma prior on b, sampled as u = ln b. The Jacobian makes the target
// log-concave for Dirichlet nodes.
struct ConcentrationTarget<'a> {
    stats: &'a NodeStats,
    discount: f64,
}

impl<'a> LogDensity for ConcentrationTarget<'a> {
    fn ln_density(&self, u: f64) -> f64 {
        let b = u.exp();
        let mut lp = CONCENTRATION_PRIOR_SHAPE * u - CONCENTRATION_PRIOR_RATE * b;
        for &(n, t) in &self.stats.totals {
            lp += ln_rising_discounted(b, self.discount, clamp_u32(t)) - ln_rising(b, clamp_u32(n));
        }
        lp
    }

    fn derivative(&self, u: f64) -> f64 {
        let b = u.exp();
        let mut d = (CONCENTRATION_PRIOR_SHAPE - 1.0) / b - CONCENTRATION_PRIOR_RATE;
        for &(n, t) in &self.stats.totals {
            d += discounted_harmonic(b, self.discount, clamp_u32(t)) - digamma_rising(b, clamp_u32(n));
        }
        b * d + 1.0
    }

    fn support(&self) -> (f64, f64) {
        (CONCENTRATION_MIN.ln(), CONCENTRATION_MAX.ln())
    }
}

struct DiscountTarget<'a> {
    stats: &'a NodeStats,
    concentration: f64,
    max_customers: usize,
    max_tables: usize,
}

impl<'a> LogDensity for DiscountTarget<'a> {
    fn ln_density(&self, a: f64) -> f64 {
        let mut lp = (DISCOUNT_PRIOR_A - 1.0) * a.ln() + (DISCOUNT_PRIOR_B - 1.0) * (1.0 - a).ln();
        for &(_, t) in &self.stats.totals {
            lp += ln_rising_discounted(self.concentration, a, clamp_u32(t));
        }
        lp + ln_stirling_sum(a, &self.stats.pairs, self.max_customers, self.max_tables).0
    }

    fn support(&self) -> (f64, f64) {
        (DISCOUNT_MIN, DISCOUNT_MAX)
    }
}

// Concentration of the sparse topic-word prior, again in log space.
struct SparseTarget<'a> {
    topics: &'a SparseTopics,
}

impl<'a> LogDensity for SparseTarget<'a> {
    fn ln_density(&self, u: f64) -> f64 {
        let beta = u.exp();
        CONCENTRATION_PRIOR_SHAPE * u - CONCENTRATION_PRIOR_RATE * beta + self.topics.ln_likelihood(beta)
    }

    fn derivative(&self, u: f64) -> f64 {
        let beta = u.exp();
        CONCENTRATION_PRIOR_SHAPE - CONCENTRATION_PRIOR_RATE * beta
            + beta * self.topics.ln_likelihood_derivative(beta)
    }

    fn support(&self) -> (f64, f64) {
        (CONCENTRATION_MIN.ln(), CONCENTRATION_MAX.ln())
    }
}

fn draw<D: LogDensity, R: Rng>(
    target: &D,
    current: f64,
    settings: &Settings,
    stats: &mut HyperStats,
    rng: &mut R,
) -> Result<f64, SampleError> {
    stats.draws += 1;
    let d = ars::sample(target, current, settings, rng)?;
    if d.fell_back {
        stats.slice_fallbacks += 1;
    }
    Ok(d.value)
}

fn clamp(x: f64, lo: f64, hi: f64) -> f64 {
    x.max(lo).min(hi)
}

/// Resample whatever `prior` learns from the counts in `node`.
pub fn resample_node<R: Rng>(
    name: &str,
    prior: &mut NodePrior,
    node: &NodeStats,
    settings: &Resampling,
    stats: &mut HyperStats,
    rng: &mut R,
) {
    if node.is_empty() {
        return;
    }
    if prior.concentration.learn {
        let target = ConcentrationTarget {
            stats: node,
            discount: prior.a(),
        };
        match draw(&target, prior.b().ln(), &settings.sampler, stats, rng) {
            Ok(u) => prior.concentration.value = clamp(u.exp(), CONCENTRATION_MIN, CONCENTRATION_MAX),
            Err(e) => {
                stats.failures += 1;
                warn!(node = name, error = %e, "keeping previous concentration");
            }
        }
    }
    if prior.discount.learn {
        let (_, skipped) = ln_stirling_sum(prior.a(), &node.pairs, settings.max_customers, settings.max_tables);
        if skipped > 0 {
            warn!(node = name, skipped = skipped, "dishes beyond the Stirling limit left out of the discount");
        }
        let target = DiscountTarget {
            stats: node,
            concentration: prior.b(),
            max_customers: settings.max_customers,
            max_tables: settings.max_tables,
        };
        stats.draws += 1;
        match ars::slice(&target, prior.a(), &settings.sampler, rng) {
            Ok(a) => prior.discount.value = clamp(a, DISCOUNT_MIN, DISCOUNT_MAX),
            Err(e) => {
                stats.failures += 1;
                warn!(node = name, error = %e, "keeping previous discount");
            }
        }
    }
    debug!(node = name, concentration = prior.b(), discount = prior.a(), "resampled");
}

/// Indicators, then sparsity, then concentration.
pub fn resample_sparse<R: Rng>(topics: &mut SparseTopics, settings: &Resampling, stats: &mut HyperStats, rng: &mut R) {
    let flips = topics.resample_indicators(rng);
    topics.resample_sparsity(rng);
    if topics.concentration.learn {
        let current = topics.concentration.value.ln();
        let result = draw(&SparseTarget { topics: &*topics }, current, &settings.sampler, stats, rng);
        match result {
            Ok(u) => topics.concentration.value = clamp(u.exp(), CONCENTRATION_MIN, CONCENTRATION_MAX),
            Err(e) => {
                stats.failures += 1;
                warn!(error = %e, "keeping previous sparse concentration");
            }
        }
    }
    debug!(
        flips = flips,
        sparsity = topics.sparsity.value,
        concentration = topics.concentration.value,
        "resampled sparse topics"
    );
}

fn doc_level_name(depth: usize, l: usize) -> &'static str {
    if depth == 2 && l == 0 {
        "document group"
    } else {
        "document root"
    }
}

/// One pass over every learnable hyperparameter of the model. Must run on
/// merged state.
pub fn resample_model<R: Rng>(model: &mut Model, settings: &Resampling, stats: &mut HyperStats, rng: &mut R) {
    let mut leaf = *model.shared.doc_leaf();
    if leaf.learns() {
        let node = NodeStats::from_restaurants(model.docs.iter().map(|d| &d.restaurant));
        resample_node("document", &mut leaf, &node, settings, stats, rng);
        model.shared.set_doc_leaf(leaf);
    }

    let depth = model.shared.doc_upper.depth();
    for l in 0..depth {
        let mut prior = *model.shared.doc_upper.prior(l);
        if !prior.learns() {
            continue;
        }
        let node = NodeStats::from_restaurants(&model.shared.doc_upper.level(l).restaurants);
        resample_node(doc_level_name(depth, l), &mut prior, &node, settings, stats, rng);
        model.shared.doc_upper.set_prior(l, prior);
    }

    match &mut model.shared.words {
        WordSide::Hierarchical(h) => {
            for l in 0..h.depth() {
                let mut prior = *h.prior(l);
                if !prior.learns() {
                    continue;
                }
                let node = NodeStats::from_restaurants(&h.level(l).restaurants);
                let name = if l == 0 { "topic-word" } else { "word root" };
                resample_node(name, &mut prior, &node, settings, stats, rng);
                h.set_prior(l, prior);
            }
        }
        WordSide::Sparse(s) => resample_sparse(s, settings, stats, rng),
        WordSide::Fixed(_) => {}
    }

    let burst = model.shared.burst().cloned();
    if let Some(burst) = burst {
        if burst.learns() {
            let k = model.num_topics();
            let mut node = NodeStats::new();
            for doc in &model.docs {
                if let Some(b) = &doc.bursts {
                    for t in 0..k {
                        node.add_totals(b.topic_customers(t) as u64, b.topic_tables(t) as u64);
                    }
                    for (n, t) in b.dish_counts() {
                        node.add_pair(n, t);
                    }
                }
            }
            let mut burst = burst;
            resample_node("burst", &mut burst, &node, settings, stats, rng);
            model.shared.set_burst(burst);
        }
    }
}

/// Current value of every hyperparameter, named for logs and snapshots.
pub fn current_values(model: &Model) -> Vec<(String, f64)> {
    let mut values = Vec::new();
    let node = |name: &str, p: &NodePrior, values: &mut Vec<(String, f64)>| {
        values.push((format!("{}.concentration", name), p.b()));
        if p.a() > 0.0 || p.discount.learn {
            values.push((format!("{}.discount", name), p.a()));
        }
    };
    node("document", model.shared.doc_leaf(), &mut values);
    let depth = model.shared.doc_upper.depth();
    for l in 0..depth {
        node(doc_level_name(depth, l), model.shared.doc_upper.prior(l), &mut values);
    }
    match &model.shared.words {
        WordSide::Hierarchical(h) => {
            for l in 0..h.depth() {
                node(if l == 0 { "topic-word" } else { "word root" }, h.prior(l), &mut values);
            }
        }
        WordSide::Sparse(s) => {
            values.push(("sparse.concentration".to_owned(), s.concentration.value));
            values.push(("sparse.sparsity".to_owned(), s.sparsity.value));
        }
        WordSide::Fixed(_) => {}
    }
    if let Some(b) = model.shared.burst() {
        node("burst", b, &mut values);
    }
    values
}
