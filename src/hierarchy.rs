use std::sync::Arc;

use rand::Rng;

use crate::def::STIRLING_MAX_N;
use crate::error::{Error, Result};
use crate::prior::NodePrior;
use crate::pyp::Restaurant;
use crate::stirling::StirlingTable;

/// One level of a hierarchy: a restaurant per context, all sharing a prior.
#[derive(Clone, Debug)]
pub struct Level {
    pub prior: NodePrior,
    pub restaurants: Vec<Restaurant>,
    stirling: Arc<StirlingTable>,
}

impl Level {
    pub fn new(prior: NodePrior, contexts: usize, dim: usize) -> Self {
        Self {
            prior: prior,
            restaurants: vec![Restaurant::new(dim); contexts],
            stirling: Arc::new(StirlingTable::new(prior.a(), STIRLING_MAX_N)),
        }
    }

    pub fn stirling(&self) -> &StirlingTable {
        &self.stirling
    }
}

/// A stack of restaurant levels over `dim` dishes. Level 0 is the lowest;
/// each context of level `l` has exactly one parent context at `l + 1`, and
/// the top level draws from the uniform base 1/dim.
///
/// The lowest level may itself have children living outside the hierarchy
/// (document restaurants), in which case its customers are their tables.
#[derive(Clone, Debug)]
pub struct Hierarchy {
    dim: usize,
    levels: Vec<Level>,
    // parents[l][c]: context at level l + 1 of context c at level l
    parents: Vec<Vec<usize>>,
}

impl Hierarchy {
    /// No levels: every predictive is the uniform base.
    pub fn flat(dim: usize) -> Self {
        Self {
            dim: dim,
            levels: Vec::new(),
            parents: Vec::new(),
        }
    }

    /// `levels` lists (prior, number of contexts) bottom-up; `parents[l]`
    /// maps the contexts of level `l` onto those of level `l + 1`.
    pub fn new(dim: usize, levels: Vec<(NodePrior, usize)>, parents: Vec<Vec<usize>>) -> Result<Self> {
        if dim == 0 {
            return Err(Error::config("a hierarchy needs at least one dish"));
        }
        if !levels.is_empty() && parents.len() + 1 != levels.len() {
            return Err(Error::config("every level but the top needs a parent map"));
        }
        for (l, map) in parents.iter().enumerate() {
            if map.len() != levels[l].1 {
                return Err(Error::config(format!(
                    "level {} has {} contexts but {} parent entries",
                    l,
                    levels[l].1,
                    map.len()
                )));
            }
            if let Some(&bad) = map.iter().find(|&&p| p >= levels[l + 1].1) {
                return Err(Error::config(format!(
                    "level {} points at missing parent context {}",
                    l, bad
                )));
            }
        }
        let levels = levels
            .into_iter()
            .map(|(prior, contexts)| Level::new(prior, contexts, dim))
            .collect();
        Ok(Self {
            dim: dim,
            levels: levels,
            parents: parents,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, l: usize) -> &Level {
        &self.levels[l]
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn restaurant(&self, l: usize, ctx: usize) -> &Restaurant {
        &self.levels[l].restaurants[ctx]
    }

    pub fn prior(&self, l: usize) -> &NodePrior {
        &self.levels[l].prior
    }

    /// Replace a level's prior, rebuilding its Stirling table if the
    /// discount moved.
    pub fn set_prior(&mut self, l: usize, prior: NodePrior) {
        let level = &mut self.levels[l];
        if level.prior.a() != prior.a() {
            level.stirling = Arc::new(StirlingTable::new(prior.a(), STIRLING_MAX_N));
        }
        level.prior = prior;
    }

    pub fn parent_context(&self, l: usize, ctx: usize) -> Option<usize> {
        self.parents.get(l).map(|map| map[ctx])
    }

    pub fn base(&self) -> f64 {
        1.0 / self.dim as f64
    }

    /// Predictive probability of `dish` at context `ctx` of level `l`. With
    /// `l == depth()` this is the base.
    pub fn predictive(&self, l: usize, ctx: usize, dish: usize) -> f64 {
        if l >= self.levels.len() {
            return self.base();
        }
        let parent_p = match self.parent_context(l, ctx) {
            Some(parent) => self.predictive(l + 1, parent, dish),
            None => self.base(),
        };
        let level = &self.levels[l];
        level.restaurants[ctx].predictive(dish, &level.prior, parent_p)
    }

    /// Add a customer at (l, ctx), sending one to the parent for every table
    /// that gets opened on the way up.
    pub fn add<R: Rng>(&mut self, l: usize, ctx: usize, dish: usize, rng: &mut R) {
        let mut l = l;
        let mut ctx = ctx;
        while l < self.levels.len() {
            let parent = self.parent_context(l, ctx);
            let parent_p = match parent {
                Some(p) => self.predictive(l + 1, p, dish),
                None => self.base(),
            };
            let level = &mut self.levels[l];
            let prior = level.prior;
            let opened = level.restaurants[ctx].seat(
                dish,
                &prior,
                parent_p,
                Some(&*level.stirling),
                rng,
            );
            match (opened, parent) {
                (true, Some(p)) => {
                    ctx = p;
                    l += 1;
                }
                _ => return,
            }
        }
    }

    /// Remove a customer at (l, ctx), propagating closed tables upwards.
    pub fn remove<R: Rng>(&mut self, l: usize, ctx: usize, dish: usize, rng: &mut R) {
        let mut l = l;
        let mut ctx = ctx;
        while l < self.levels.len() {
            let closed = self.levels[l].restaurants[ctx].unseat(dish, rng);
            match (closed, self.parent_context(l, ctx)) {
                (true, Some(p)) => {
                    ctx = p;
                    l += 1;
                }
                _ => return,
            }
        }
    }

    /// Fold one worker's changes (relative to `base`) into this hierarchy.
    pub fn apply_delta(&mut self, base: &Hierarchy, worker: &Hierarchy) {
        for (l, level) in self.levels.iter_mut().enumerate() {
            for (c, r) in level.restaurants.iter_mut().enumerate() {
                r.apply_delta(&base.levels[l].restaurants[c], &worker.levels[l].restaurants[c]);
            }
        }
    }

    /// Sum of the table counts of level `l`, per parent context.
    fn child_tables(&self, l: usize) -> Vec<Vec<u32>> {
        let contexts = self.levels[l + 1].restaurants.len();
        let mut sums = vec![vec![0u32; self.dim]; contexts];
        for (c, r) in self.levels[l].restaurants.iter().enumerate() {
            let p = self.parents[l][c];
            for (m, &t) in r.table_counts().iter().enumerate() {
                sums[p][m] += t;
            }
        }
        sums
    }

    /// Make every level agree with the one below: customers become the
    /// children's tables and tables are clamped into [min(1, n), n].
    /// `external` gives the level-0 customers when they come from outside.
    pub fn reconcile(&mut self, external: Option<&[Vec<u32>]>) {
        if self.levels.is_empty() {
            return;
        }
        match external {
            Some(counts) => {
                for (c, r) in self.levels[0].restaurants.iter_mut().enumerate() {
                    r.set_customers(&counts[c]);
                }
            }
            None => {
                for r in self.levels[0].restaurants.iter_mut() {
                    r.clamp_tables();
                }
            }
        }
        for l in 1..self.levels.len() {
            let sums = self.child_tables(l - 1);
            for (c, r) in self.levels[l].restaurants.iter_mut().enumerate() {
                r.set_customers(&sums[c]);
            }
        }
    }

    /// Check every table invariant and every parent/child count identity.
    pub fn check(&self, external: Option<&[Vec<u32>]>) -> std::result::Result<(), String> {
        for (l, level) in self.levels.iter().enumerate() {
            for (c, r) in level.restaurants.iter().enumerate() {
                r.check().map_err(|e| format!("level {} context {}: {}", l, c, e))?;
            }
        }
        if let (Some(counts), Some(level)) = (external, self.levels.first()) {
            for (c, r) in level.restaurants.iter().enumerate() {
                if r.customer_counts() != &counts[c][..] {
                    return Err(format!("level 0 context {} disagrees with its children", c));
                }
            }
        }
        for l in 1..self.levels.len() {
            let sums = self.child_tables(l - 1);
            for (c, r) in self.levels[l].restaurants.iter().enumerate() {
                if r.customer_counts() != &sums[c][..] {
                    return Err(format!("level {} context {} disagrees with its children", l, c));
                }
            }
        }
        Ok(())
    }
}
