use std::sync::Arc;

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::corpus::Corpus;
use crate::counts::{ensure_available, TopicWordCounts};
use crate::def::STIRLING_MAX_N;
use crate::document::DocState;
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::prior::{Hyper, HierarchyKind, NodePrior, PriorFamily};
use crate::sparse::SparseTopics;
use crate::stirling::StirlingTable;

/// Prior configuration of a model. Written to the snapshot with the values
/// reached at the end of training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub num_topics: usize,
    pub doc_prior: PriorFamily,
    pub word_prior: PriorFamily,
    pub hierarchy: HierarchyKind,
    pub group_prior: NodePrior,
    pub root_prior: NodePrior,
    pub word_root_prior: NodePrior,
    pub burst: Option<NodePrior>,
}

impl ModelSpec {
    pub fn validate(&self) -> Result<()> {
        if self.num_topics == 0 {
            return Err(Error::config("the number of topics must be positive"));
        }
        if let PriorFamily::Sparse { .. } = self.doc_prior {
            return Err(Error::config("the sparse prior is only available for topic-word distributions"));
        }
        if let PriorFamily::DirichletAsymmetric { .. } = self.doc_prior {
            if self.hierarchy == HierarchyKind::Flat {
                return Err(Error::config(
                    "an asymmetric document prior needs the corpus or grouped hierarchy",
                ));
            }
        }
        Ok(())
    }

    /// Every hyperparameter held at its current value.
    pub fn frozen(&self) -> Self {
        ModelSpec {
            num_topics: self.num_topics,
            doc_prior: self.doc_prior.frozen(),
            word_prior: self.word_prior.frozen(),
            hierarchy: self.hierarchy,
            group_prior: self.group_prior.frozen(),
            root_prior: self.root_prior.frozen(),
            word_root_prior: self.word_root_prior.frozen(),
            burst: self.burst.map(|b| b.frozen()),
        }
    }

    /// Structural choices on which two configurations disagree. Values are
    /// not compared.
    pub fn differences(&self, other: &ModelSpec) -> Vec<&'static str> {
        let same_family = |a: &PriorFamily, b: &PriorFamily| std::mem::discriminant(a) == std::mem::discriminant(b);
        let mut diff = Vec::new();
        if self.hierarchy != other.hierarchy {
            diff.push("hierarchy");
        }
        if !same_family(&self.doc_prior, &other.doc_prior) {
            diff.push("document prior");
        }
        if !same_family(&self.word_prior, &other.word_prior) {
            diff.push("word prior");
        }
        if self.burst.is_some() != other.burst.is_some() {
            diff.push("burstiness");
        }
        diff
    }
}

// Write a node's current values back into the family it was built from.
fn family_with_values(family: &PriorFamily, node: &NodePrior, dim: usize) -> PriorFamily {
    match family {
        PriorFamily::DirichletSymmetric { .. } => PriorFamily::DirichletSymmetric {
            per_component: Hyper {
                value: node.b() / dim as f64,
                learn: node.concentration.learn,
            },
        },
        PriorFamily::DirichletAsymmetric { .. } => PriorFamily::DirichletAsymmetric {
            concentration: node.concentration,
        },
        PriorFamily::PitmanYor { .. } => PriorFamily::PitmanYor {
            concentration: node.concentration,
            discount: node.discount,
        },
        PriorFamily::Sparse { .. } => family.clone(),
    }
}

/// Topic-word side of the model.
#[derive(Clone, Debug)]
pub enum WordSide {
    /// Level 0 has one restaurant per topic, optionally under a corpus node.
    Hierarchical(Hierarchy),
    Sparse(SparseTopics),
    /// Topic-word distributions loaded from a snapshot and never updated.
    Fixed(Array2<f64>),
}

impl WordSide {
    pub fn predictive(&self, topic: usize, word: usize) -> f64 {
        match self {
            WordSide::Hierarchical(h) => h.predictive(0, topic, word),
            WordSide::Sparse(s) => s.predictive(topic, word),
            WordSide::Fixed(phi) => phi[[topic, word]],
        }
    }

    pub fn add<R: Rng>(&mut self, topic: usize, word: usize, rng: &mut R) {
        match self {
            WordSide::Hierarchical(h) => h.add(0, topic, word, rng),
            WordSide::Sparse(s) => s.add(topic, word),
            WordSide::Fixed(_) => {}
        }
    }

    pub fn remove<R: Rng>(&mut self, topic: usize, word: usize, rng: &mut R) {
        match self {
            WordSide::Hierarchical(h) => h.remove(0, topic, word, rng),
            WordSide::Sparse(s) => s.remove(topic, word),
            WordSide::Fixed(_) => {}
        }
    }

    fn apply_delta(&mut self, base: &WordSide, worker: &WordSide) {
        match (self, base, worker) {
            (WordSide::Hierarchical(h), WordSide::Hierarchical(b), WordSide::Hierarchical(w)) => {
                h.apply_delta(b, w)
            }
            (WordSide::Sparse(s), WordSide::Sparse(b), WordSide::Sparse(w)) => s.apply_delta(b, w),
            _ => {}
        }
    }

    fn reconcile(&mut self) {
        if let WordSide::Hierarchical(h) = self {
            h.reconcile(None);
        }
    }
}

/// State every worker needs a private copy of during a sweep. Document
/// state lives outside and is handed in token by token.
#[derive(Clone, Debug)]
pub struct Shared {
    pub num_topics: usize,
    doc_leaf: NodePrior,
    doc_stirling: Arc<StirlingTable>,
    pub doc_upper: Hierarchy,
    pub words: WordSide,
    burst: Option<NodePrior>,
    burst_stirling: Option<Arc<StirlingTable>>,
    pub raw: TopicWordCounts,
}

impl Shared {
    pub fn doc_leaf(&self) -> &NodePrior {
        &self.doc_leaf
    }

    pub fn set_doc_leaf(&mut self, prior: NodePrior) {
        if prior.a() != self.doc_leaf.a() {
            self.doc_stirling = Arc::new(StirlingTable::new(prior.a(), STIRLING_MAX_N));
        }
        self.doc_leaf = prior;
    }

    pub fn burst(&self) -> Option<&NodePrior> {
        self.burst.as_ref()
    }

    pub fn set_burst(&mut self, prior: NodePrior) {
        let rebuild = match self.burst {
            Some(old) => old.a() != prior.a(),
            None => true,
        };
        if rebuild {
            self.burst_stirling = Some(Arc::new(StirlingTable::new(prior.a(), STIRLING_MAX_N)));
        }
        self.burst = Some(prior);
    }

    /// Probability of `topic` under the document's parent node.
    pub fn doc_parent_p(&self, context: usize, topic: usize) -> f64 {
        self.doc_upper.predictive(0, context, topic)
    }

    pub fn doc_affinity(&self, doc: &DocState, topic: usize) -> f64 {
        let parent_p = self.doc_parent_p(doc.context, topic);
        doc.restaurant.predictive(topic, &self.doc_leaf, parent_p)
    }

    pub fn word_affinity(&self, doc: &DocState, topic: usize, word: u32) -> f64 {
        let p = self.words.predictive(topic, word as usize);
        match (&doc.bursts, &self.burst) {
            (Some(b), Some(prior)) => b.predictive(topic, word, prior, p),
            _ => p,
        }
    }

    /// Unnormalized conditional of every topic for `word` in `doc`, with the
    /// token itself already removed.
    pub fn topic_weights(&self, doc: &DocState, word: u32, weights: &mut Vec<f64>) {
        weights.clear();
        for k in 0..self.num_topics {
            weights.push(self.doc_affinity(doc, k) * self.word_affinity(doc, k, word));
        }
    }

    pub fn add_token<R: Rng>(&mut self, doc: &mut DocState, i: usize, topic: usize, rng: &mut R) {
        let word = doc.words[i];
        doc.topics[i] = topic;
        let parent_p = self.doc_parent_p(doc.context, topic);
        if doc
            .restaurant
            .seat(topic, &self.doc_leaf, parent_p, Some(&*self.doc_stirling), rng)
        {
            self.doc_upper.add(0, doc.context, topic, rng);
        }
        self.raw.add(topic, word as usize);

        let reaches_topic = match (doc.bursts.as_mut(), &self.burst) {
            (Some(b), Some(prior)) => {
                let p = self.words.predictive(topic, word as usize);
                let stirling = self.burst_stirling.as_ref().map(|s| &**s);
                b.seat(topic, word, prior, p, stirling, rng)
            }
            _ => true,
        };
        if reaches_topic {
            self.words.add(topic, word as usize, rng);
        }
    }

    /// Take token `i` out of every count; returns its old topic.
    pub fn remove_token<R: Rng>(&mut self, doc: &mut DocState, i: usize, rng: &mut R) -> usize {
        let word = doc.words[i];
        let topic = doc.topics[i];
        if doc.restaurant.unseat(topic, rng) {
            self.doc_upper.remove(0, doc.context, topic, rng);
        }
        self.raw.remove(topic, word as usize);
        let leaves_topic = match doc.bursts.as_mut() {
            Some(b) => b.unseat(topic, word, rng),
            None => true,
        };
        if leaves_topic {
            self.words.remove(topic, word as usize, rng);
        }
        topic
    }

    /// Fold a worker's sweep into this state. Upper levels are left for
    /// `Model::reconcile`.
    pub fn apply_delta(&mut self, base: &Shared, worker: &Shared) {
        self.raw.apply_delta(&base.raw, &worker.raw);
        self.words.apply_delta(&base.words, &worker.words);
        self.doc_upper.apply_delta(&base.doc_upper, &worker.doc_upper);
    }
}

pub struct Model {
    pub spec: ModelSpec,
    pub shared: Shared,
    pub docs: Vec<DocState>,
    num_words: usize,
    num_contexts: usize,
}

impl Model {
    /// Empty model over `corpus`; call `initialize` before sampling. With
    /// `fixed_phi` the topic-word side is frozen to the given distributions.
    pub fn new(
        spec: &ModelSpec,
        corpus: &Corpus,
        num_words: usize,
        groups: Option<&[usize]>,
        fixed_phi: Option<Array2<f64>>,
    ) -> Result<Self> {
        spec.validate()?;
        let k = spec.num_topics;
        let w = num_words.max(1);
        let d = corpus.num_documents();

        let doc_leaf = spec
            .doc_prior
            .leaf(k)
            .ok_or_else(|| Error::config("document prior cannot be sparse"))?;

        let (doc_upper, contexts) = match spec.hierarchy {
            HierarchyKind::Flat => (Hierarchy::flat(k), vec![0; d]),
            HierarchyKind::Corpus => (
                Hierarchy::new(k, vec![(spec.root_prior, 1)], Vec::new())?,
                vec![0; d],
            ),
            HierarchyKind::Grouped => {
                let groups = groups.ok_or_else(|| {
                    Error::config("the grouped hierarchy needs a group file")
                })?;
                if groups.len() != d {
                    return Err(Error::config(format!(
                        "{} group ids for {} documents",
                        groups.len(),
                        d
                    )));
                }
                let num_groups = groups.iter().cloned().max().map_or(1, |g| g + 1);
                (
                    Hierarchy::new(
                        k,
                        vec![(spec.group_prior, num_groups), (spec.root_prior, 1)],
                        vec![vec![0; num_groups]],
                    )?,
                    groups.to_vec(),
                )
            }
        };
        let num_contexts = contexts.iter().cloned().max().map_or(1, |c| c + 1);

        let words = match fixed_phi {
            Some(phi) => {
                if phi.dim() != (k, w) {
                    return Err(Error::SnapshotMismatch {
                        what: "topic-word matrix shape",
                        expected: k * w,
                        found: phi.len(),
                    });
                }
                WordSide::Fixed(phi)
            }
            None => match spec.word_prior {
                PriorFamily::Sparse {
                    concentration,
                    sparsity,
                } => WordSide::Sparse(SparseTopics::new(k, w, concentration, sparsity)?),
                ref family => {
                    // two u32 per topic-word cell
                    ensure_available(k.saturating_mul(w).saturating_mul(8), "topic-word restaurants")?;
                    let leaf = family
                        .leaf(w)
                        .ok_or_else(|| Error::config("word prior has no restaurant form"))?;
                    let h = if family.needs_parent() {
                        Hierarchy::new(
                            w,
                            vec![(leaf, k), (spec.word_root_prior, 1)],
                            vec![vec![0; k]],
                        )?
                    } else {
                        Hierarchy::new(w, vec![(leaf, k)], Vec::new())?
                    };
                    WordSide::Hierarchical(h)
                }
            },
        };

        let bursty = spec.burst.is_some();
        let docs = corpus
            .documents
            .iter()
            .zip(contexts.into_iter())
            .map(|(doc, ctx)| DocState::new(doc.words.clone(), k, ctx, bursty))
            .collect();

        let mut shared = Shared {
            num_topics: k,
            doc_leaf: doc_leaf,
            doc_stirling: Arc::new(StirlingTable::new(doc_leaf.a(), STIRLING_MAX_N)),
            doc_upper: doc_upper,
            words: words,
            burst: None,
            burst_stirling: None,
            raw: TopicWordCounts::new(k, w)?,
        };
        if let Some(burst) = spec.burst {
            shared.set_burst(burst);
        }

        Ok(Model {
            spec: spec.clone(),
            shared: shared,
            docs: docs,
            num_words: w,
            num_contexts: num_contexts,
        })
    }

    pub fn num_topics(&self) -> usize {
        self.shared.num_topics
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn num_documents(&self) -> usize {
        self.docs.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.docs.iter().map(|d| d.len()).sum()
    }

    /// Seat every token, either at a uniformly drawn topic or at the topic
    /// given in `assignments`.
    pub fn initialize<R: Rng>(&mut self, assignments: Option<&[Vec<usize>]>, rng: &mut R) -> Result<()> {
        let k = self.num_topics();
        if let Some(z) = assignments {
            if z.len() != self.docs.len() {
                return Err(Error::SnapshotMismatch {
                    what: "document count",
                    expected: self.docs.len(),
                    found: z.len(),
                });
            }
            for (doc, topics) in self.docs.iter().zip(z.iter()) {
                if topics.len() != doc.len() {
                    return Err(Error::SnapshotMismatch {
                        what: "document length",
                        expected: doc.len(),
                        found: topics.len(),
                    });
                }
                if let Some(&bad) = topics.iter().find(|&&t| t >= k) {
                    return Err(Error::SnapshotMismatch {
                        what: "topic count",
                        expected: k,
                        found: bad + 1,
                    });
                }
            }
        }
        let shared = &mut self.shared;
        for (d, doc) in self.docs.iter_mut().enumerate() {
            for i in 0..doc.len() {
                let topic = match assignments {
                    Some(z) => z[d][i],
                    None => rng.gen_range(0, k),
                };
                shared.add_token(doc, i, topic, rng);
            }
        }
        Ok(())
    }

    pub fn assignments(&self) -> Vec<Vec<usize>> {
        self.docs.iter().map(|d| d.topics.clone()).collect()
    }

    /// Level-0 customers of the document hierarchy: the documents' tables
    /// summed per context.
    pub fn doc_tables_by_context(&self) -> Vec<Vec<u32>> {
        let k = self.num_topics();
        let mut sums = vec![vec![0u32; k]; self.num_contexts];
        for doc in &self.docs {
            for (t, &c) in doc.restaurant.table_counts().iter().enumerate() {
                sums[doc.context][t] += c;
            }
        }
        sums
    }

    /// Bring every upper level back in line with the level below it.
    pub fn reconcile(&mut self) {
        if self.shared.doc_upper.depth() > 0 {
            let external = self.doc_tables_by_context();
            self.shared.doc_upper.reconcile(Some(&external));
        }
        self.shared.words.reconcile();
    }

    /// Document-topic counts as a D x K matrix.
    pub fn doc_topic_counts(&self) -> Array2<u32> {
        let k = self.num_topics();
        let mut m = Array2::zeros((self.docs.len(), k));
        for (d, doc) in self.docs.iter().enumerate() {
            for (t, &c) in doc.topic_counts().iter().enumerate() {
                m[[d, t]] = c;
            }
        }
        m
    }

    /// Posterior mean of every document's topic distribution.
    pub fn theta(&self) -> Array2<f64> {
        let k = self.num_topics();
        let mut theta = Array2::zeros((self.docs.len(), k));
        for (d, doc) in self.docs.iter().enumerate() {
            for t in 0..k {
                theta[[d, t]] = self.shared.doc_affinity(doc, t);
            }
        }
        theta
    }

    /// Posterior mean of every topic's word distribution.
    pub fn phi(&self) -> Array2<f64> {
        let k = self.num_topics();
        let mut phi = Array2::zeros((k, self.num_words));
        for t in 0..k {
            for w in 0..self.num_words {
                phi[[t, w]] = self.shared.words.predictive(t, w);
            }
        }
        phi
    }

    /// Mean topic proportions a new document is drawn around, and the
    /// concentration it is drawn with.
    pub fn doc_prior_mean(&self) -> (Vec<f64>, f64) {
        let k = self.num_topics();
        let h = &self.shared.doc_upper;
        let mean = (0..k)
            .map(|t| {
                if h.depth() == 0 {
                    h.base()
                } else {
                    h.predictive(h.depth() - 1, 0, t)
                }
            })
            .collect();
        (mean, self.shared.doc_leaf.b())
    }

    /// Priors with every hyperparameter at its current value.
    pub fn current_spec(&self) -> ModelSpec {
        let mut spec = self.spec.clone();
        let k = self.num_topics();
        spec.doc_prior = family_with_values(&spec.doc_prior, &self.shared.doc_leaf, k);
        let h = &self.shared.doc_upper;
        match h.depth() {
            1 => spec.root_prior = *h.prior(0),
            2 => {
                spec.group_prior = *h.prior(0);
                spec.root_prior = *h.prior(1);
            }
            _ => {}
        }
        match &self.shared.words {
            WordSide::Hierarchical(h) => {
                spec.word_prior = family_with_values(&spec.word_prior, h.prior(0), self.num_words);
                if h.depth() > 1 {
                    spec.word_root_prior = *h.prior(1);
                }
            }
            WordSide::Sparse(s) => {
                spec.word_prior = PriorFamily::Sparse {
                    concentration: s.concentration,
                    sparsity: s.sparsity,
                };
            }
            WordSide::Fixed(_) => {}
        }
        spec.burst = self.shared.burst;
        spec
    }

    /// Every count identity the sampler maintains.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut raw_total = 0u64;
        for (d, doc) in self.docs.iter().enumerate() {
            doc.check().map_err(|e| format!("document {}: {}", d, e))?;
            raw_total += doc.len() as u64;
        }
        self.shared.raw.check()?;
        if self.shared.raw.total() != raw_total {
            return Err(format!(
                "topic-word counts hold {} tokens, corpus has {}",
                self.shared.raw.total(),
                raw_total
            ));
        }
        let mut per_topic = vec![0u64; self.num_topics()];
        for doc in &self.docs {
            for &t in &doc.topics {
                per_topic[t] += 1;
            }
        }
        for (t, &n) in per_topic.iter().enumerate() {
            if self.shared.raw.topic_total(t) != n {
                return Err(format!("topic {} has {} tokens but {} raw counts", t, n, self.shared.raw.topic_total(t)));
            }
        }
        if self.shared.doc_upper.depth() > 0 {
            let external = self.doc_tables_by_context();
            self.shared.doc_upper.check(Some(&external))?;
        }
        match &self.shared.words {
            WordSide::Hierarchical(h) => {
                let external = self.word_leaf_feed();
                h.check(None)?;
                for (t, row) in external.iter().enumerate() {
                    if h.restaurant(0, t).customer_counts() != &row[..] {
                        return Err(format!("topic {} leaf disagrees with its input", t));
                    }
                }
            }
            WordSide::Sparse(s) => {
                s.check()?;
                let external = self.word_leaf_feed();
                for (t, row) in external.iter().enumerate() {
                    for (w, &c) in row.iter().enumerate() {
                        if s.count(t, w) != c {
                            return Err(format!("sparse count ({}, {}) disagrees with its input", t, w));
                        }
                    }
                }
            }
            WordSide::Fixed(_) => {}
        }
        Ok(())
    }

    // What the topic-word level should hold: raw counts, or burst tables.
    fn word_leaf_feed(&self) -> Vec<Vec<u32>> {
        let k = self.num_topics();
        let mut feed = vec![vec![0u32; self.num_words]; k];
        for doc in &self.docs {
            match &doc.bursts {
                Some(b) => {
                    for (t, w, tables) in b.tables_by_dish() {
                        feed[t][w as usize] += tables;
                    }
                }
                None => {
                    for (i, &w) in doc.words.iter().enumerate() {
                        feed[doc.topics[i]][w as usize] += 1;
                    }
                }
            }
        }
        feed
    }
}
