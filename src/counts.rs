use crate::error::{Error, Result};

/// Zero-filled buffer that reports allocation failure instead of aborting.
pub fn zeroed<T: Clone + Default>(len: usize, what: &'static str) -> Result<Vec<T>> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::Resource {
        what: what,
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    v.resize(len, T::default());
    Ok(v)
}

/// Probe that `bytes` can be allocated before building structures that
/// allocate through infallible constructors.
pub fn ensure_available(bytes: usize, what: &'static str) -> Result<()> {
    let mut probe: Vec<u8> = Vec::new();
    probe
        .try_reserve_exact(bytes)
        .map_err(|_| Error::Resource {
            what: what,
            bytes: bytes,
        })
}

/// Raw topic-by-word occurrence counts. Always one count per token, whatever
/// the prior hierarchy sees.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicWordCounts {
    topics: usize,
    words: usize,
    counts: Vec<u32>,
    totals: Vec<u64>,
}

impl TopicWordCounts {
    pub fn new(topics: usize, words: usize) -> Result<Self> {
        let len = topics
            .checked_mul(words)
            .ok_or(Error::Resource {
                what: "topic-word counts",
                bytes: std::usize::MAX,
            })?;
        Ok(Self {
            topics: topics,
            words: words,
            counts: zeroed(len, "topic-word counts")?,
            totals: vec![0; topics],
        })
    }

    pub fn num_topics(&self) -> usize {
        self.topics
    }

    pub fn num_words(&self) -> usize {
        self.words
    }

    pub fn get(&self, topic: usize, word: usize) -> u32 {
        self.counts[topic * self.words + word]
    }

    pub fn topic_total(&self, topic: usize) -> u64 {
        self.totals[topic]
    }

    pub fn row(&self, topic: usize) -> &[u32] {
        &self.counts[topic * self.words..(topic + 1) * self.words]
    }

    pub fn total(&self) -> u64 {
        self.totals.iter().sum()
    }

    pub fn add(&mut self, topic: usize, word: usize) {
        self.counts[topic * self.words + word] += 1;
        self.totals[topic] += 1;
    }

    pub fn remove(&mut self, topic: usize, word: usize) {
        let cell = &mut self.counts[topic * self.words + word];
        debug_assert!(*cell > 0);
        if *cell > 0 {
            *cell -= 1;
            self.totals[topic] -= 1;
        }
    }

    pub fn apply_delta(&mut self, base: &TopicWordCounts, worker: &TopicWordCounts) {
        for i in 0..self.counts.len() {
            let d = worker.counts[i] as i64 - base.counts[i] as i64;
            if d != 0 {
                self.counts[i] = (self.counts[i] as i64 + d).max(0) as u32;
            }
        }
        for k in 0..self.topics {
            self.totals[k] = self.row(k).iter().map(|&c| c as u64).sum();
        }
    }

    /// Nonzero cells as (topic, word, count), topic-major.
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, usize, u32)> + '_ {
        let words = self.words;
        self.counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(move |(i, &c)| (i / words, i % words, c))
    }

    pub fn check(&self) -> std::result::Result<(), String> {
        for k in 0..self.topics {
            let sum: u64 = self.row(k).iter().map(|&c| c as u64).sum();
            if sum != self.totals[k] {
                return Err(format!("topic {} total {} but row sums to {}", k, self.totals[k], sum));
            }
        }
        Ok(())
    }
}
