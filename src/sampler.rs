use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
#[cfg(feature = "parallel")]
use tracing::debug;

use crate::document::DocState;
use crate::error::{Error, Result};
use crate::model::{Model, Shared};

/// Seed for stream `(a, b)` of a run with master seed `master` (splitmix64
/// finalizer over the combined words).
pub fn derive_seed(master: u64, a: u64, b: u64) -> u64 {
    let mut z = master
        .wrapping_add(a.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(b.wrapping_mul(0xD1B5_4A32_D192_ED03));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Draw an index with probability proportional to `weights`.
pub fn sample_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0 && total.is_finite()) {
        // nothing to go on; every topic is equally likely
        return rng.gen_range(0, weights.len());
    }
    let randnum = rng.gen::<f64>() * total;
    let mut stack = 0.0;
    let mut last = 0;
    for (i, &w) in weights.iter().enumerate() {
        if w > 0.0 {
            last = i;
        }
        stack += w;
        if randnum < stack {
            return i;
        }
    }
    last
}

/// One Gibbs pass over the tokens of a document.
pub fn sweep_document<R: Rng>(shared: &mut Shared, doc: &mut DocState, weights: &mut Vec<f64>, rng: &mut R) {
    for i in 0..doc.len() {
        let word = doc.words[i];
        shared.remove_token(doc, i, rng);
        shared.topic_weights(doc, word, weights);
        let topic = sample_index(weights, rng);
        shared.add_token(doc, i, topic, rng);
    }
}

pub struct Sampler {
    threads: usize,
    seed: u64,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl Sampler {
    pub fn new(threads: usize, seed: u64) -> Result<Self> {
        let threads = threads.max(1);
        #[cfg(feature = "parallel")]
        {
            let pool = if threads > 1 {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| Error::config(format!("cannot start {} worker threads: {}", threads, e)))?;
                Some(pool)
            } else {
                None
            };
            Ok(Sampler {
                threads: threads,
                seed: seed,
                pool: pool,
            })
        }
        #[cfg(not(feature = "parallel"))]
        {
            if threads > 1 {
                return Err(Error::config(
                    "multi-threaded sampling needs the `parallel` feature",
                ));
            }
            Ok(Sampler {
                threads: threads,
                seed: seed,
            })
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// One full sweep over the corpus. `sweep` numbers the sweep so that
    /// worker streams differ from sweep to sweep.
    pub fn sweep(&self, model: &mut Model, sweep: u64, rng: &mut StdRng) {
        if self.threads > 1 && model.docs.len() > 1 {
            #[cfg(feature = "parallel")]
            {
                self.parallel_sweep(model, sweep);
                return;
            }
        }
        let mut weights = Vec::with_capacity(model.num_topics());
        let shared = &mut model.shared;
        for doc in model.docs.iter_mut() {
            sweep_document(shared, doc, &mut weights, rng);
        }
    }

    // Each worker takes a contiguous block of documents and a private copy of
    // the shared state. At the barrier the copies are folded back in worker
    // order and the upper levels rebuilt from their children.
    #[cfg(feature = "parallel")]
    fn parallel_sweep(&self, model: &mut Model, sweep: u64) {
        let num_docs = model.docs.len();
        let chunk = (num_docs + self.threads - 1) / self.threads;
        let num_chunks = (num_docs + chunk - 1) / chunk;
        let base = model.shared.clone();
        let mut workers: Vec<Shared> = (0..num_chunks).map(|_| base.clone()).collect();
        let seed = self.seed;
        let k = model.num_topics();

        let run = |docs: &mut Vec<DocState>, workers: &mut Vec<Shared>| {
            docs.par_chunks_mut(chunk)
                .zip_eq(workers.par_iter_mut())
                .enumerate()
                .for_each(|(w, (block, shared))| {
                    let mut rng = StdRng::seed_from_u64(derive_seed(seed, sweep, w as u64));
                    let mut weights = Vec::with_capacity(k);
                    for doc in block.iter_mut() {
                        sweep_document(shared, doc, &mut weights, &mut rng);
                    }
                });
        };
        match &self.pool {
            Some(pool) => pool.install(|| run(&mut model.docs, &mut workers)),
            None => run(&mut model.docs, &mut workers),
        }

        for worker in &workers {
            model.shared.apply_delta(&base, worker);
        }
        model.reconcile();
        debug!(sweep = sweep, workers = num_chunks, "merged worker deltas");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{spec, toy_corpus};
    use crate::prior::HierarchyKind;

    fn model_for(doc: &str, word: &str, kind: HierarchyKind, burst: bool) -> Model {
        let s = spec(doc, word, kind, burst);
        let groups = [0, 1, 0, 1, 1];
        let mut model = Model::new(&s, &toy_corpus(), 6, Some(&groups), None).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        model.initialize(None, &mut rng).unwrap();
        model
    }

    #[test]
    fn seeds_differ_per_stream() {
        assert_ne!(derive_seed(1, 0, 0), derive_seed(1, 0, 1));
        assert_ne!(derive_seed(1, 1, 0), derive_seed(1, 0, 1));
        assert_eq!(derive_seed(5, 2, 3), derive_seed(5, 2, 3));
    }

    #[test]
    fn sample_index_skips_zero_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let i = sample_index(&[0.0, 2.0, 0.0, 1.0, 0.0], &mut rng);
            assert!(i == 1 || i == 3);
        }
        let i = sample_index(&[0.0, 0.0], &mut rng);
        assert!(i < 2);
    }

    #[test]
    fn serial_sweeps_keep_every_invariant() {
        let sampler = Sampler::new(1, 9).unwrap();
        let configs = vec![
            ("dir", "dir", HierarchyKind::Flat, false),
            ("pyp", "adir", HierarchyKind::Grouped, true),
            ("adir", "sparse", HierarchyKind::Corpus, false),
        ];
        for (doc, word, kind, burst) in configs {
            let mut model = model_for(doc, word, kind, burst);
            let mut rng = StdRng::seed_from_u64(2);
            for s in 0..10 {
                sampler.sweep(&mut model, s, &mut rng);
                model.check_invariants().unwrap();
            }
        }
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_sweeps_keep_every_invariant() {
        let sampler = Sampler::new(2, 9).unwrap();
        let configs = vec![
            ("dir", "dir", HierarchyKind::Flat, false),
            ("pyp", "pyp", HierarchyKind::Grouped, true),
            ("dir", "sparse", HierarchyKind::Corpus, true),
        ];
        for (doc, word, kind, burst) in configs {
            let mut model = model_for(doc, word, kind, burst);
            let mut rng = StdRng::seed_from_u64(2);
            for s in 0..10 {
                sampler.sweep(&mut model, s, &mut rng);
                model.check_invariants().unwrap();
            }
        }
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn parallel_sweeps_are_reproducible() {
        let run = || {
            let sampler = Sampler::new(3, 4).unwrap();
            let mut model = model_for("pyp", "pyp", HierarchyKind::Corpus, false);
            let mut rng = StdRng::seed_from_u64(2);
            for s in 0..5 {
                sampler.sweep(&mut model, s, &mut rng);
            }
            model.assignments()
        };
        assert_eq!(run(), run());
    }
}
