//! Trained state on disk.
//!
//! A snapshot at stem `OUT` is four files: `OUT.par` (JSON metadata),
//! `OUT.theta` and `OUT.phi` (dense matrices, a `rows cols` line followed by
//! one row per line) and `OUT.z` (one line of topics per document). Floats
//! are written in their shortest round-trip form, so a reload gives
//! bit-identical matrices.
//!
//! The derived count files `OUT.ndt` and `OUT.nwt` are coordinate lists
//! after three header lines, and `OUT.top` lists the top words per topic.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::corpus::Vocabulary;
use crate::counts::TopicWordCounts;
use crate::def::*;
use crate::error::{Error, Result};
use crate::model::ModelSpec;

/// `stem.suffix`, keeping any dots already in the stem.
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut s = stem.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u32,
    pub num_topics: usize,
    pub num_words: usize,
    pub num_documents: usize,
    /// Priors with the values reached at the end of training.
    pub spec: ModelSpec,
    pub cycles: usize,
    pub seed: u64,
    pub hyperparameters: BTreeMap<String, f64>,
    /// Topic proportions a new document is drawn around, and their
    /// concentration. Saved because the upper document tables are not.
    pub doc_prior_mean: Vec<f64>,
    pub doc_concentration: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub theta: Array2<f64>,
    pub phi: Array2<f64>,
    pub assignments: Vec<Vec<usize>>,
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let f = File::create(path).map_err(|e| Error::io(path, e))?;
    Ok(BufWriter::new(f))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let f = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(BufReader::new(f))
}

impl Snapshot {
    pub fn save(&self, stem: &Path) -> Result<()> {
        let par = with_suffix(stem, PARAMETERS_SUFFIX);
        let mut w = create(&par)?;
        serde_json::to_writer_pretty(&mut w, &self.meta).map_err(|e| Error::Json {
            path: par.clone(),
            source: e,
        })?;
        writeln!(w).and_then(|_| w.flush()).map_err(|e| Error::io(&par, e))?;

        write_matrix(&with_suffix(stem, THETA_SUFFIX), &self.theta)?;
        write_matrix(&with_suffix(stem, PHI_SUFFIX), &self.phi)?;
        write_assignments(&with_suffix(stem, ASSIGNMENTS_SUFFIX), &self.assignments)?;
        info!(stem = %stem.display(), "saved snapshot");
        Ok(())
    }

    pub fn load(stem: &Path) -> Result<Self> {
        let par = with_suffix(stem, PARAMETERS_SUFFIX);
        let meta: SnapshotMeta = serde_json::from_reader(open(&par)?).map_err(|e| Error::Json {
            path: par.clone(),
            source: e,
        })?;
        if meta.version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotMismatch {
                what: "snapshot version",
                expected: SNAPSHOT_VERSION as usize,
                found: meta.version as usize,
            });
        }
        let theta = read_matrix(&with_suffix(stem, THETA_SUFFIX))?;
        let phi = read_matrix(&with_suffix(stem, PHI_SUFFIX))?;
        let assignments = read_assignments(&with_suffix(stem, ASSIGNMENTS_SUFFIX))?;
        let snapshot = Snapshot {
            meta: meta,
            theta: theta,
            phi: phi,
            assignments: assignments,
        };
        snapshot.check_shapes()?;
        Ok(snapshot)
    }

    fn check_shapes(&self) -> Result<()> {
        let m = &self.meta;
        let checks = [
            ("topic-word rows", m.num_topics, self.phi.rows()),
            ("topic-word columns", m.num_words, self.phi.cols()),
            ("document-topic rows", m.num_documents, self.theta.rows()),
            ("document-topic columns", m.num_topics, self.theta.cols()),
            ("assignment documents", m.num_documents, self.assignments.len()),
            ("document prior mean", m.num_topics, m.doc_prior_mean.len()),
        ];
        for &(what, expected, found) in checks.iter() {
            if expected != found {
                return Err(Error::SnapshotMismatch {
                    what: what,
                    expected: expected,
                    found: found,
                });
            }
        }
        Ok(())
    }

    /// A restart must agree on the topic count and the vocabulary size.
    pub fn check_compatible(&self, num_topics: usize, num_words: usize) -> Result<()> {
        if self.meta.num_topics != num_topics {
            return Err(Error::SnapshotMismatch {
                what: "topic count",
                expected: num_topics,
                found: self.meta.num_topics,
            });
        }
        if self.meta.num_words != num_words {
            return Err(Error::SnapshotMismatch {
                what: "vocabulary size",
                expected: num_words,
                found: self.meta.num_words,
            });
        }
        Ok(())
    }
}

pub fn write_matrix(path: &Path, m: &Array2<f64>) -> Result<()> {
    let mut w = create(path)?;
    let io = |e| Error::io(path, e);
    writeln!(w, "{} {}", m.rows(), m.cols()).map_err(io)?;
    for row in m.genrows() {
        let line: Vec<String> = row.iter().map(|x| x.to_string()).collect();
        writeln!(w, "{}", line.join(" ")).map_err(io)?;
    }
    w.flush().map_err(io)
}

pub fn read_matrix(path: &Path) -> Result<Array2<f64>> {
    let mut lines = open(path)?.lines();
    let header = match lines.next() {
        Some(l) => l.map_err(|e| Error::io(path, e))?,
        None => return Err(Error::parse(path, 1, "missing `rows cols` header")),
    };
    let dims: Vec<usize> = header
        .split_whitespace()
        .map(|f| f.parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::parse(path, 1, format!("bad header {:?}", header)))?;
    if dims.len() != 2 {
        return Err(Error::parse(path, 1, "expected `rows cols`"));
    }
    let (rows, cols) = (dims[0], dims[1]);
    let mut m = Array2::zeros((rows, cols));
    let mut r = 0;
    for (i, line) in lines.enumerate() {
        let l = line.map_err(|e| Error::io(path, e))?;
        if l.trim().is_empty() && cols > 0 {
            continue;
        }
        if r >= rows {
            return Err(Error::parse(path, i + 2, "more rows than the header declares"));
        }
        let mut c = 0;
        for field in l.split_whitespace() {
            if c >= cols {
                return Err(Error::parse(path, i + 2, "more columns than the header declares"));
            }
            m[[r, c]] = field
                .parse::<f64>()
                .map_err(|_| Error::parse(path, i + 2, format!("bad number {:?}", field)))?;
            c += 1;
        }
        if c != cols {
            return Err(Error::parse(path, i + 2, format!("{} columns, expected {}", c, cols)));
        }
        r += 1;
    }
    if r != rows {
        return Err(Error::parse(path, r + 1, format!("{} rows, expected {}", r, rows)));
    }
    Ok(m)
}

fn write_assignments(path: &Path, z: &[Vec<usize>]) -> Result<()> {
    let mut w = create(path)?;
    let io = |e| Error::io(path, e);
    for topics in z {
        let line: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        writeln!(w, "{}", line.join(" ")).map_err(io)?;
    }
    w.flush().map_err(io)
}

fn read_assignments(path: &Path) -> Result<Vec<Vec<usize>>> {
    let reader = open(path)?;
    let mut z = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let l = line.map_err(|e| Error::io(path, e))?;
        let topics = l
            .split_whitespace()
            .map(|f| f.parse::<usize>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::parse(path, i + 1, "bad topic id"))?;
        z.push(topics);
    }
    Ok(z)
}

fn coordinate_header<W: Write>(w: &mut W, what: &str, rows: usize, cols: usize, entries: usize) -> std::io::Result<()> {
    writeln!(w, "%%MatrixMarket matrix coordinate integer general")?;
    writeln!(w, "% {}", what)?;
    writeln!(w, "{} {} {}", rows, cols, entries)
}

/// `d k n` for every nonzero document-topic count.
pub fn write_doc_topic(path: &Path, counts: &Array2<u32>) -> Result<()> {
    let mut w = create(path)?;
    let io = |e| Error::io(path, e);
    let entries = counts.iter().filter(|&&c| c > 0).count();
    coordinate_header(&mut w, "document topic count", counts.rows(), counts.cols(), entries).map_err(io)?;
    for ((d, k), &c) in counts.indexed_iter() {
        if c > 0 {
            writeln!(w, "{} {} {}", d, k, c).map_err(io)?;
        }
    }
    w.flush().map_err(io)
}

/// `w k n` for every nonzero topic-word count.
pub fn write_topic_word(path: &Path, counts: &TopicWordCounts) -> Result<()> {
    let mut w = create(path)?;
    let io = |e| Error::io(path, e);
    let mut cells: Vec<(usize, usize, u32)> = counts.nonzero().collect();
    cells.sort_by_key(|&(k, word, _)| (word, k));
    coordinate_header(&mut w, "word topic count", counts.num_words(), counts.num_topics(), cells.len())
        .map_err(io)?;
    for (k, word, c) in cells {
        writeln!(w, "{} {} {}", word, k, c).map_err(io)?;
    }
    w.flush().map_err(io)
}

/// The `n` most probable words of every topic.
pub fn write_top_words(path: &Path, phi: &Array2<f64>, vocabulary: &Vocabulary, n: usize) -> Result<()> {
    let mut w = create(path)?;
    let io = |e| Error::io(path, e);
    for (k, row) in phi.genrows().into_iter().enumerate() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|&a, &b| {
            row[b]
                .partial_cmp(&row[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let words: Vec<String> = order
            .iter()
            .take(n)
            .map(|&x| format!("{}:{:.4}", vocabulary.term(x as u32), row[x]))
            .collect();
        writeln!(w, "topic {}: {}", k, words.join(" ")).map_err(io)?;
    }
    w.flush().map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::{HierarchyKind, Hyper, NodePrior, PriorFamily, Side};
    use ndarray::arr2;
    use tempfile::tempdir;

    fn snapshot() -> Snapshot {
        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("document.concentration".to_owned(), 1.0 / 3.0);
        Snapshot {
            meta: SnapshotMeta {
                version: SNAPSHOT_VERSION,
                num_topics: 2,
                num_words: 3,
                num_documents: 3,
                spec: ModelSpec {
                    num_topics: 2,
                    doc_prior: PriorFamily::parse("pyp", Side::Document).unwrap(),
                    word_prior: PriorFamily::parse("dir:0.1", Side::Word).unwrap(),
                    hierarchy: HierarchyKind::Corpus,
                    group_prior: NodePrior::dirichlet(Hyper::learned(10.0)),
                    root_prior: NodePrior::dirichlet(Hyper::learned(0.1 + 0.2)),
                    word_root_prior: NodePrior::dirichlet(Hyper::learned(10.0)),
                    burst: None,
                },
                cycles: 12,
                seed: 99,
                hyperparameters: hyperparameters,
                doc_prior_mean: vec![0.3, 0.7],
                doc_concentration: 1.0 / 7.0,
            },
            theta: arr2(&[[0.1, 0.9], [1.0 / 3.0, 2.0 / 3.0], [0.5, 0.5]]),
            phi: arr2(&[[0.7, 0.2, 0.1], [1e-17, 0.3, 0.7 - 1e-17]]),
            assignments: vec![vec![0, 1, 1], vec![], vec![1]],
        }
    }

    #[test]
    fn save_then_load_is_exact() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("run.out");
        let s = snapshot();
        s.save(&stem).unwrap();
        assert!(dir.path().join("run.out.par").exists());
        let loaded = Snapshot::load(&stem).unwrap();
        assert_eq!(loaded, s);
    }

    #[test]
    fn prior_mean_must_cover_every_topic() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("short");
        let mut s = snapshot();
        s.meta.doc_prior_mean.pop();
        s.save(&stem).unwrap();
        match Snapshot::load(&stem) {
            Err(Error::SnapshotMismatch { what, .. }) => assert_eq!(what, "document prior mean"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn incompatible_restarts_are_rejected() {
        let s = snapshot();
        s.check_compatible(2, 3).unwrap();
        match s.check_compatible(4, 3) {
            Err(Error::SnapshotMismatch { what, .. }) => assert_eq!(what, "topic count"),
            other => panic!("unexpected {:?}", other),
        }
        let err = s.check_compatible(2, 5).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn truncated_matrices_are_parse_errors() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("bad");
        snapshot().save(&stem).unwrap();
        std::fs::write(with_suffix(&stem, PHI_SUFFIX), "2 3\n0.5 0.5 0\n").unwrap();
        let err = Snapshot::load(&stem).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn coordinate_files_have_three_header_lines() {
        let dir = tempdir().unwrap();
        let ndt = dir.path().join("x.ndt");
        write_doc_topic(&ndt, &arr2(&[[2u32, 0], [1, 3]])).unwrap();
        let text = std::fs::read_to_string(&ndt).unwrap();
        let body: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(body, vec!["0 0 2", "1 0 1", "1 1 3"]);

        let mut counts = TopicWordCounts::new(2, 4).unwrap();
        counts.add(1, 3);
        counts.add(0, 3);
        counts.add(0, 1);
        let nwt = dir.path().join("x.nwt");
        write_topic_word(&nwt, &counts).unwrap();
        let text = std::fs::read_to_string(&nwt).unwrap();
        let body: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(body, vec!["1 0 1", "3 0 1", "3 1 1"]);
    }

    #[test]
    fn top_words_are_ordered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.top");
        let mut v = Vocabulary::new();
        for t in &["a", "b", "c"] {
            v.add_term(t.to_string());
        }
        write_top_words(&path, &arr2(&[[0.2, 0.5, 0.3]]), &v, 2).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim(), "topic 0: b:0.5000 c:0.3000");
    }

    #[test]
    fn suffix_keeps_dots_in_the_stem() {
        assert_eq!(
            with_suffix(Path::new("/tmp/a.b"), "par"),
            PathBuf::from("/tmp/a.b.par")
        );
    }
}
