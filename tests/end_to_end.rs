extern crate either;
extern crate rand;
extern crate rust_hptm;
extern crate tempfile;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use either::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use rust_hptm::{Config, RunSummary, Trainer};

// Three planted topics over 30 words; topic t owns words 10t..10t+9.
fn synthetic(docs: usize, len: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = String::new();
    for d in 0..docs {
        let topic = (d % 3) as u32;
        let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
        for _ in 0..len {
            let w = if rng.gen::<f64>() < 0.8 {
                topic * 10 + rng.gen_range(0, 10)
            } else {
                rng.gen_range(0, 30)
            };
            *counts.entry(w).or_insert(0) += 1;
        }
        let pairs: Vec<String> = counts.iter().map(|(w, c)| format!("{}:{}", w, c)).collect();
        out.push_str(&format!("{} {}\n", counts.len(), pairs.join(" ")));
    }
    out
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Workspace {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn stem(&self, name: &str) -> String {
        self.path(name).to_str().unwrap().to_owned()
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.path(name), content).unwrap();
    }
}

fn trainer(args: &[&str]) -> rust_hptm::Result<Trainer> {
    let args: Vec<String> = std::iter::once("hptm")
        .chain(args.iter().cloned())
        .map(|s| s.to_owned())
        .collect();
    match Config::from_args(&args)? {
        Left(config) => Trainer::new(config),
        Right(_) => panic!("unexpected usage text"),
    }
}

fn run(args: &[&str]) -> (Trainer, RunSummary) {
    let mut t = trainer(args).unwrap();
    let summary = t.run().unwrap();
    (t, summary)
}

// (document, topic, count) rows after the three header lines
fn read_coordinates(path: &Path) -> Vec<(usize, usize, u32)> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(3)
        .map(|l| {
            let f: Vec<&str> = l.split_whitespace().collect();
            (f[0].parse().unwrap(), f[1].parse().unwrap(), f[2].parse().unwrap())
        })
        .collect()
}

#[test]
fn scenario_a_default_priors_twenty_topics() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(24, 25, 1));
    let stem = ws.stem("c");
    let (t, summary) = run(&["-K", "20", "-C", "100", "-q", &stem]);
    assert_eq!(summary.cycles, 100);
    assert_eq!(summary.trace.len(), 20);

    let counts = t.model().doc_topic_counts();
    assert_eq!(counts.dim(), (24, 20));
    for d in 0..24 {
        let total: u32 = counts.row(d).iter().sum();
        assert_eq!(total, 25);
    }
    t.model().check_invariants().unwrap();

    let mut per_doc = vec![0u32; 24];
    for (d, k, n) in read_coordinates(&ws.path("c.ndt")) {
        assert!(k < 20);
        per_doc[d] += n;
    }
    assert!(per_doc.iter().all(|&n| n == 25));

    let mut per_word_total = 0;
    for (_, k, n) in read_coordinates(&ws.path("c.nwt")) {
        assert!(k < 20);
        per_word_total += n;
    }
    assert_eq!(per_word_total, 24 * 25);

    let train = summary.train.unwrap();
    assert!(train.perplexity().is_finite() && train.perplexity() > 0.0);
    // planted structure beats the uniform 30-word baseline
    assert!(train.log2_perplexity() < (30f64).log2());
}

#[test]
fn scenario_b_restart_and_test_on_a_disjoint_corpus() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(30, 30, 2));
    ws.write("new.ldac", &synthetic(9, 20, 99));
    ws.write("held.ldac", &synthetic(12, 10, 7));
    let stem = ws.stem("c");
    let out = ws.stem("out");
    run(&["-K", "3", "-C", "40", "-q", &stem, &out]);
    assert!(ws.path("out.par").exists());
    assert!(ws.path("out.phi").exists());

    let query = ws.stem("new.ldac");
    let (_, summary) = run(&["-K", "3", "-r", "resume", "-C", "0", "--test-mode", "query", "--test-corpus", &query, "-q", &stem, &out]);
    let test = summary.test.unwrap();
    assert_eq!(test.tokens, 9 * 10);
    assert!(test.perplexity().is_finite() && test.perplexity() > 0.0);

    let held = ws.stem("held.ldac");
    let (_, summary) = run(&["-K", "3", "-r", "resume", "-C", "0", "--test-mode", "heldout", "--test-corpus", &held, "-q", &stem, &out]);
    let test = summary.test.unwrap();
    assert_eq!(test.tokens, 12 * 10);
    assert!(test.perplexity().is_finite() && test.perplexity() > 0.0);

    let (_, summary) = run(&[
        "-K", "3", "-r", "topics", "-C", "10", "--test-mode", "query", "-E", "l2r", "--particles", "4",
        "--test-corpus", &query, "-q", &stem, &out,
    ]);
    assert!(summary.test.unwrap().perplexity().is_finite());
}

fn relative_spread(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    var.sqrt() / mean
}

#[test]
fn scenario_c_hyperparameters_settle() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(30, 40, 3));
    let groups: String = (0..30).map(|d| format!("{}\n", d % 2)).collect();
    ws.write("c.grp", &groups);
    let stem = ws.stem("c");
    let configs: Vec<Vec<&str>> = vec![
        vec!["-A", "pyp", "-H", "corpus", "-W", "pyp"],
        vec!["-A", "adir", "-H", "grouped", "-W", "sparse", "--burst", "dir"],
    ];
    for extra in configs {
        let mut args = vec!["-K", "4", "-C", "80", "-S", "2", "-q"];
        args.extend(extra.iter().cloned());
        args.push(&stem);
        let (t, summary) = run(&args);
        t.model().check_invariants().unwrap();
        assert!(summary.hyper.draws > 0);
        assert!(summary.hyper.failures * 10 <= summary.hyper.draws);

        let names: Vec<String> = summary.hyperparameters.iter().map(|(n, _)| n.clone()).collect();
        let late = &summary.hyper_history[summary.hyper_history.len() / 2..];
        for name in &names {
            let values: Vec<f64> = late
                .iter()
                .filter_map(|(_, vs)| vs.iter().find(|(n, _)| n == name).map(|&(_, v)| v))
                .collect();
            assert!(values.iter().all(|v| v.is_finite() && *v > 0.0), "{}: {:?}", name, values);
            assert!(relative_spread(&values) < 1.0, "{} keeps wandering: {:?}", name, values);
        }
    }
}

#[test]
fn same_seed_same_output() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(20, 20, 4));
    let stem = ws.stem("c");
    for threads in &["1", "2"] {
        let a = ws.stem("a");
        let b = ws.stem("b");
        run(&["-K", "5", "-C", "15", "-t", threads, "-s", "11", "-A", "pyp", "-H", "corpus", "-q", &stem, &a]);
        run(&["-K", "5", "-C", "15", "-t", threads, "-s", "11", "-A", "pyp", "-H", "corpus", "-q", &stem, &b]);
        for suffix in &["phi", "theta", "z", "par"] {
            let x = fs::read(ws.path(&format!("a.{}", suffix))).unwrap();
            let y = fs::read(ws.path(&format!("b.{}", suffix))).unwrap();
            assert!(x == y, "{} differs with {} threads", suffix, threads);
        }
    }
}

#[test]
fn evaluation_from_a_snapshot_is_exact_and_repeatable() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(15, 20, 5));
    ws.write("c.test.ldac", &synthetic(15, 6, 6));
    let stem = ws.stem("c");
    let out = ws.stem("out");
    let (_, trained) = run(&["-K", "4", "-C", "20", "--test-mode", "heldout", "-q", &stem, &out]);
    let (_, first) = run(&["-K", "4", "-r", "resume", "-C", "0", "--test-mode", "heldout", "-q", &stem, &out]);
    let (_, second) = run(&["-K", "4", "-r", "resume", "-C", "0", "--test-mode", "heldout", "-q", &stem, &out]);
    assert_eq!(trained.test, first.test);
    assert_eq!(first.test, second.test);

    // evaluation-only runs rewrite the snapshot unchanged
    let before = fs::read(ws.path("out.theta")).unwrap();
    fs::remove_file(ws.path("out.ndt")).unwrap();
    run(&["-K", "4", "-r", "resume", "-C", "0", "--test-mode", "query", "-q", &stem, &out]);
    assert_eq!(fs::read(ws.path("out.theta")).unwrap(), before);
    assert!(ws.path("out.ndt").exists());
    let meta = fs::read_to_string(ws.path("out.par")).unwrap();
    assert!(meta.contains("\"cycles\": 20"));

    let (_, q1) = run(&["-K", "4", "-r", "resume", "-C", "0", "--test-mode", "query", "-q", &stem, &out]);
    let (_, q2) = run(&["-K", "4", "-r", "resume", "-C", "0", "--test-mode", "query", "-q", &stem, &out]);
    assert_eq!(q1.test, q2.test);
}

#[test]
fn query_perplexity_survives_a_reload() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(18, 20, 12));
    ws.write("new.ldac", &synthetic(6, 15, 13));
    let stem = ws.stem("c");
    let out = ws.stem("out");
    let query = ws.stem("new.ldac");
    let (_, trained) = run(&[
        "-K", "4", "-C", "20", "-A", "pyp", "-H", "corpus", "--test-mode", "query", "--test-corpus", &query, "-q",
        &stem, &out,
    ]);
    let reload = [
        "-K", "4", "-r", "resume", "-C", "0", "-A", "pyp", "-H", "corpus", "--test-mode", "query", "--test-corpus",
        &query, "-q", &stem, &out,
    ];
    let (_, first) = run(&reload);
    assert!(trained.test.is_some());
    assert_eq!(trained.test, first.test);
    let (_, second) = run(&reload);
    assert_eq!(first.test, second.test);
}

#[test]
fn estimate_flag_uses_the_test_corpus_when_present() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(9, 12, 14));
    let stem = ws.stem("c");
    let (_, summary) = run(&["-e", "-C", "6", "-K", "3", "-N100,20", "-q", &stem]);
    assert!(summary.test.is_none());

    ws.write("c.test.ldac", &synthetic(9, 4, 15));
    let (_, summary) = run(&["-e", "-C", "6", "-K", "3", "-N100,20", "-q", &stem]);
    assert_eq!(summary.test.unwrap().tokens, 9 * 4);
}

#[test]
fn resume_continues_the_cycle_count() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(12, 15, 8));
    let stem = ws.stem("c");
    let out = ws.stem("out");
    run(&["-K", "3", "-C", "10", "-q", &stem, &out]);
    let (t, summary) = run(&["-K", "3", "-r", "resume", "-C", "5", "-q", &stem, &out]);
    assert_eq!(summary.cycles, 5);
    t.model().check_invariants().unwrap();
    let meta = fs::read_to_string(ws.path("out.par")).unwrap();
    assert!(meta.contains("\"cycles\": 15"));

    let err = trainer(&["-K", "7", "-r", "resume", "-C", "5", "-q", &stem, &out]).err().unwrap();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn single_topic_is_degenerate_but_valid() {
    let ws = Workspace::new();
    ws.write("c.ldac", &synthetic(6, 10, 9));
    let stem = ws.stem("c");
    let (t, summary) = run(&["-K", "1", "-C", "10", "-q", &stem]);
    assert!(t.model().assignments().iter().all(|z| z.iter().all(|&k| k == 0)));
    let dist = t.distributions();
    assert!(dist.theta.iter().all(|&x| (x - 1.0).abs() < 1e-12));
    assert!(summary.train.unwrap().perplexity().is_finite());
}

#[test]
fn empty_documents_pass_through() {
    let ws = Workspace::new();
    ws.write("c.ldac", "2 0:3 1:1\n0\n\n1 2:2\n");
    let stem = ws.stem("c");
    let (t, _) = run(&["-K", "2", "-C", "6", "-q", &stem]);
    assert_eq!(t.model().num_documents(), 4);
    assert_eq!(t.model().num_tokens(), 6);
    t.model().check_invariants().unwrap();
    let docs: Vec<usize> = read_coordinates(&ws.path("c.ndt")).iter().map(|r| r.0).collect();
    assert!(!docs.contains(&1) && !docs.contains(&2));
}

#[test]
fn binary_exit_codes() {
    let ws = Workspace::new();
    ws.write("bad.ldac", "2 0:1\n");
    let bin = env!("CARGO_BIN_EXE_hptm");
    let status = Command::new(bin).args(&["-q", &ws.stem("bad")]).status().unwrap();
    assert_eq!(status.code(), Some(3));

    let status = Command::new(bin).args(&["-q", &ws.stem("missing")]).status().unwrap();
    assert_eq!(status.code(), Some(2));

    let status = Command::new(bin).args(&["-A", "adir", &ws.stem("bad")]).status().unwrap();
    assert_eq!(status.code(), Some(1));

    ws.write("good.ldac", &synthetic(6, 8, 10));
    let output = Command::new(bin)
        .args(&["-K", "2", "-C", "5", "-q", &ws.stem("good")])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.lines().any(|l| l.starts_with("log_2(perp)=")));
}
