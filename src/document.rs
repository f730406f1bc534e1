use std::collections::HashMap;

use rand::Rng;

use crate::prior::NodePrior;
use crate::pyp::Restaurant;
use crate::stirling::{sample_new_table, sample_table_closes, StirlingTable};

/// Per-document, per-topic restaurants over words. A repeated word in the
/// same document mostly sits at an existing table, so only the tables reach
/// the topic-word level. Stored sparsely: documents touch few words.
#[derive(Clone, Debug, PartialEq)]
pub struct BurstRestaurants {
    // (topic, word) -> (customers, tables)
    dishes: HashMap<(usize, u32), (u32, u32)>,
    customers: Vec<u32>,
    tables: Vec<u32>,
}

impl BurstRestaurants {
    pub fn new(topics: usize) -> Self {
        Self {
            dishes: HashMap::new(),
            customers: vec![0; topics],
            tables: vec![0; topics],
        }
    }

    pub fn counts(&self, topic: usize, word: u32) -> (u32, u32) {
        self.dishes.get(&(topic, word)).cloned().unwrap_or((0, 0))
    }

    pub fn predictive(&self, topic: usize, word: u32, prior: &NodePrior, parent_p: f64) -> f64 {
        let (n, t) = self.counts(topic, word);
        let a = prior.a();
        let b = prior.b();
        let new_table = b + a * self.tables[topic] as f64;
        (n as f64 - a * t as f64 + new_table * parent_p) / (b + self.customers[topic] as f64)
    }

    /// Returns whether the customer opened a table, i.e. whether the word
    /// has to be added to the topic-word level.
    pub fn seat<R: Rng>(
        &mut self,
        topic: usize,
        word: u32,
        prior: &NodePrior,
        parent_p: f64,
        stirling: Option<&StirlingTable>,
        rng: &mut R,
    ) -> bool {
        let new_table_weight = prior.b() + prior.a() * self.tables[topic] as f64;
        let entry = self.dishes.entry((topic, word)).or_insert((0, 0));
        let opened = sample_new_table(
            entry.0,
            entry.1,
            prior.a(),
            new_table_weight,
            parent_p,
            stirling,
            rng,
        );
        entry.0 += 1;
        self.customers[topic] += 1;
        if opened {
            entry.1 += 1;
            self.tables[topic] += 1;
        }
        opened
    }

    pub fn unseat<R: Rng>(&mut self, topic: usize, word: u32, rng: &mut R) -> bool {
        let key = (topic, word);
        let (n, t) = self.counts(topic, word);
        if n == 0 {
            return false;
        }
        let closes = sample_table_closes(n, t, rng);
        self.customers[topic] -= 1;
        if closes {
            self.tables[topic] -= 1;
        }
        if n == 1 {
            self.dishes.remove(&key);
        } else if let Some(entry) = self.dishes.get_mut(&key) {
            entry.0 -= 1;
            if closes {
                entry.1 -= 1;
            }
        }
        closes
    }

    pub fn topic_customers(&self, topic: usize) -> u32 {
        self.customers[topic]
    }

    pub fn topic_tables(&self, topic: usize) -> u32 {
        self.tables[topic]
    }

    /// (customers, tables) of every occupied dish.
    pub fn dish_counts(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.dishes.values().cloned()
    }

    /// Tables per (topic, word), the counts this document feeds upwards.
    pub fn tables_by_dish(&self) -> impl Iterator<Item = (usize, u32, u32)> + '_ {
        self.dishes.iter().map(|(&(k, w), &(_, t))| (k, w, t))
    }

    pub fn check(&self) -> Result<(), String> {
        let mut customers = vec![0u32; self.customers.len()];
        let mut tables = vec![0u32; self.tables.len()];
        for (&(k, w), &(n, t)) in &self.dishes {
            if n == 0 || t == 0 || t > n {
                return Err(format!("burst dish ({}, {}) has {} customers at {} tables", k, w, n, t));
            }
            customers[k] += n;
            tables[k] += t;
        }
        if customers != self.customers || tables != self.tables {
            return Err("burst totals are out of date".to_owned());
        }
        Ok(())
    }
}

/// Everything the sampler keeps for one document.
#[derive(Clone, Debug)]
pub struct DocState {
    pub words: Vec<u32>,
    pub topics: Vec<usize>,
    /// Customers are the document's topic counts.
    pub restaurant: Restaurant,
    /// Context of this document's parent in the document-side hierarchy.
    pub context: usize,
    pub bursts: Option<BurstRestaurants>,
}

impl DocState {
    pub fn new(words: Vec<u32>, topics: usize, context: usize, bursty: bool) -> Self {
        let len = words.len();
        Self {
            words: words,
            topics: vec![0; len],
            restaurant: Restaurant::new(topics),
            context: context,
            bursts: if bursty {
                Some(BurstRestaurants::new(topics))
            } else {
                None
            },
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn topic_counts(&self) -> &[u32] {
        self.restaurant.customer_counts()
    }

    /// Topic counts against assignments, plus restaurant invariants.
    pub fn check(&self) -> Result<(), String> {
        let mut counts = vec![0u32; self.restaurant.dim()];
        for &k in &self.topics {
            counts[k] += 1;
        }
        if &counts[..] != self.topic_counts() {
            return Err("topic counts disagree with assignments".to_owned());
        }
        self.restaurant.check()?;
        if let Some(b) = &self.bursts {
            b.check()?;
            for k in 0..counts.len() {
                if b.topic_customers(k) != counts[k] {
                    return Err(format!("burst customers for topic {} disagree", k));
                }
            }
        }
        Ok(())
    }
}
