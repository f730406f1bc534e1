//! Command line. Options follow the getopts layout of the training binary;
//! everything is checked here so the trainer only sees sane combinations.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use either::*;
use getopts::{Matches, Options};

use crate::def::*;
use crate::error::{Error, Result};
use crate::eval::{EvalMode, Estimator};
use crate::model::ModelSpec;
use crate::prior::{HierarchyKind, NodePrior, PriorFamily, Side};
use crate::snapshot::with_suffix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartMode {
    /// Reload the assignments and keep training both sides.
    Resume,
    /// Reload the topic-word distributions and hold them fixed.
    Topics,
}

impl FromStr for RestartMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "resume" => Ok(RestartMode::Resume),
            "topics" => Ok(RestartMode::Topics),
            _ => Err(Error::config(format!("unknown restart mode {:?}, expected resume or topics", s))),
        }
    }
}

/// Derived files written next to the snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outputs {
    pub doc_topic: bool,
    pub topic_word: bool,
    pub top_words: bool,
    pub log: bool,
}

impl FromStr for Outputs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut outputs = Outputs::default();
        for item in s.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match item {
                "ndt" => outputs.doc_topic = true,
                "nwt" => outputs.topic_word = true,
                "top" => outputs.top_words = true,
                "log" => outputs.log = true,
                "none" => {}
                _ => return Err(Error::config(format!("unknown output {:?}", item))),
            }
        }
        Ok(outputs)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub stem: PathBuf,
    pub out_stem: PathBuf,
    pub spec: ModelSpec,
    pub cycles: usize,
    pub burn_in: usize,
    pub test_cycles: usize,
    pub groups: Option<PathBuf>,
    pub hyper_every: usize,
    pub restart: Option<RestartMode>,
    /// Evaluate on the test corpus when one is found (`-e`).
    pub estimate: bool,
    pub eval_mode: Option<EvalMode>,
    pub estimator: Estimator,
    pub test_corpus: PathBuf,
    pub seed: u64,
    pub threads: usize,
    pub mapping: Option<PathBuf>,
    pub outputs: Outputs,
    pub top_words: usize,
    /// Largest customer and table counts a discount is scored on.
    pub stirling_limits: (usize, usize),
    pub report_every: usize,
    pub verbosity: usize,
    // set when -W was given explicitly
    word_prior_given: bool,
    priors_given: bool,
}

const PRIOR_OPTIONS: [&str; 7] = ["A", "W", "H", "burst", "group-prior", "root-prior", "word-root-prior"];

fn stirling_limits(m: &Matches) -> Result<(usize, usize)> {
    let text = match m.opt_str("N") {
        Some(s) => s,
        None => return Ok((STIRLING_HYPER_MAX_N, STIRLING_HYPER_MAX_T)),
    };
    let bad = || Error::config(format!("-N: expected maxN[,maxM], got {:?}", text));
    let mut parts = text.splitn(2, ',');
    let max_n = parts.next().unwrap_or("").trim().parse::<usize>().map_err(|_| bad())?;
    let max_t = match parts.next() {
        Some(t) => t.trim().parse::<usize>().map_err(|_| bad())?,
        None => STIRLING_HYPER_MAX_T,
    };
    if max_n == 0 || max_t == 0 {
        return Err(bad());
    }
    Ok((max_n, max_t))
}

fn options() -> Options {
    let mut opts = Options::new();
    opts.optflag("h", "help", "Print this help menu");
    opts.optopt("K", "topics", "Number of topics", "10");
    opts.optopt("C", "cycles", "Training cycles", "100");
    opts.optopt("b", "burn-in", "Burn-in sweeps before averaging (default cycles/2)", "N");
    opts.optopt("T", "test-cycles", "Sweeps per query document", "50");
    opts.optopt("A", "doc-prior", "Document-topic prior: dir[:alpha] | adir[:b] | pyp[:b,a]", "dir");
    opts.optopt(
        "W",
        "word-prior",
        "Topic-word prior: dir[:beta] | adir[:b] | pyp[:b,a] | sparse[:beta,pi]",
        "dir",
    );
    opts.optopt("H", "hierarchy", "Document-side hierarchy: flat | corpus | grouped", "flat");
    opts.optopt("", "groups", "Group id per document (default STEM.grp)", "PATH");
    opts.optopt("", "group-prior", "Prior of the group level: dir[:b] | pyp[:b,a]", "dir");
    opts.optopt("", "root-prior", "Prior of the document corpus node", "dir");
    opts.optopt("", "word-root-prior", "Prior of the word corpus node", "dir");
    opts.optopt("", "burst", "Enable burstiness with prior dir[:b] | pyp[:b,a]", "SPEC");
    opts.optopt("S", "hyper-every", "Resample hyperparameters every N cycles, 0 never", "5");
    opts.optflag("", "fix-hyper", "Hold every hyperparameter fixed");
    opts.optopt("r", "restart", "Restart from OUTSTEM: resume | topics", "MODE");
    opts.optflag("e", "estimate", "Report test perplexity when the test corpus exists");
    opts.optopt("", "test-mode", "Evaluate after training: heldout | query", "MODE");
    opts.optopt("E", "estimator", "Query estimator: dc | l2r", "dc");
    opts.optopt("", "particles", "Particles of the left-to-right estimator", "20");
    opts.optopt("", "test-corpus", "Test corpus (default STEM.test.ldac)", "PATH");
    opts.optopt("s", "seed", "Seed for the training", "1");
    opts.optopt("t", "threads", "Worker threads", "1");
    opts.optopt("M", "mapping", "Stopword and synonym mapping file", "PATH");
    opts.optopt("o", "output", "Comma list of ndt,nwt,top,log", "ndt,nwt");
    opts.optopt("n", "top-words", "Words per topic in OUTSTEM.top", "20");
    opts.optopt(
        "N",
        "stirling",
        "Largest customer and table counts used when scoring discounts",
        "maxN[,maxM]",
    );
    opts.optopt("", "report-every", "Cycles between perplexity reports, 0 never", "5");
    opts.optflagmulti("v", "verbose", "More logging, repeatable");
    opts.optflag("q", "quiet", "Warnings only");
    opts
}

pub fn usage(program: &str) -> String {
    let brief = format!("Usage: {} [options] STEM [OUTSTEM]", program);
    options().usage(&brief)
}

fn number<T: FromStr>(m: &Matches, name: &str, default: T) -> Result<T> {
    match m.opt_str(name) {
        None => Ok(default),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| Error::config(format!("--{}: bad value {:?}", name, s))),
    }
}

fn inner_prior(m: &Matches, name: &str, default_concentration: f64) -> Result<NodePrior> {
    match m.opt_str(name) {
        Some(s) => NodePrior::parse(&s, default_concentration),
        None => NodePrior::parse("dir", default_concentration),
    }
}

impl Config {
    /// `Right` carries the usage text when help was asked for.
    pub fn from_args(args: &[String]) -> Result<Either<Config, String>> {
        let program = args.get(0).map(|s| s.as_str()).unwrap_or("hptm");
        let matches = options()
            .parse(args.iter().skip(1))
            .map_err(|e| Error::config(e.to_string()))?;
        if matches.opt_present("h") {
            return Ok(Right(usage(program)));
        }
        let stem = match matches.free.get(0) {
            Some(s) => PathBuf::from(s),
            None => return Err(Error::config("missing STEM; see --help")),
        };
        if matches.free.len() > 2 {
            return Err(Error::config("expected at most STEM and OUTSTEM"));
        }
        let out_stem = matches.free.get(1).map(PathBuf::from).unwrap_or_else(|| stem.clone());

        let hierarchy = match matches.opt_str("H") {
            Some(s) => s.parse::<HierarchyKind>()?,
            None => HierarchyKind::Flat,
        };
        let doc_prior = PriorFamily::parse(&matches.opt_str("A").unwrap_or_else(|| "dir".to_owned()), Side::Document)?;
        let word_prior_given = matches.opt_present("W");
        let word_prior = PriorFamily::parse(&matches.opt_str("W").unwrap_or_else(|| "dir".to_owned()), Side::Word)?;
        let burst = match matches.opt_str("burst") {
            Some(s) => Some(NodePrior::parse(&s, DEFAULT_BURST_CONCENTRATION)?),
            None => None,
        };
        let mut spec = ModelSpec {
            num_topics: number(&matches, "K", DEFAULT_NUM_TOPICS)?,
            doc_prior: doc_prior,
            word_prior: word_prior,
            hierarchy: hierarchy,
            group_prior: inner_prior(&matches, "group-prior", DEFAULT_ROOT_CONCENTRATION)?,
            root_prior: inner_prior(&matches, "root-prior", DEFAULT_ROOT_CONCENTRATION)?,
            word_root_prior: inner_prior(&matches, "word-root-prior", DEFAULT_ROOT_CONCENTRATION)?,
            burst: burst,
        };
        let mut hyper_every = number(&matches, "S", DEFAULT_HYPER_EVERY)?;
        if matches.opt_present("fix-hyper") {
            spec = spec.frozen();
            hyper_every = 0;
        }

        let cycles = number(&matches, "C", DEFAULT_CYCLES)?;
        let restart = match matches.opt_str("r") {
            Some(s) => Some(s.parse::<RestartMode>()?),
            None => None,
        };
        let eval_mode = match matches.opt_str("test-mode") {
            Some(s) => Some(s.parse::<EvalMode>()?),
            // a test corpus on its own means new documents
            None if matches.opt_present("test-corpus") => Some(EvalMode::Query),
            None => None,
        };
        let particles = number(&matches, "particles", DEFAULT_PARTICLES)?;
        let estimator = Estimator::parse(&matches.opt_str("E").unwrap_or_else(|| "dc".to_owned()), particles)?;
        let verbosity = if matches.opt_present("q") {
            0
        } else {
            1 + matches.opt_count("v")
        };

        let config = Config {
            groups: matches
                .opt_str("groups")
                .map(PathBuf::from)
                .or_else(|| Some(with_suffix(&stem, GROUPS_SUFFIX)))
                .filter(|_| hierarchy == HierarchyKind::Grouped),
            test_corpus: matches
                .opt_str("test-corpus")
                .map(PathBuf::from)
                .unwrap_or_else(|| with_suffix(&stem, TEST_CORPUS_SUFFIX)),
            stem: stem,
            out_stem: out_stem,
            spec: spec,
            cycles: cycles,
            burn_in: number(&matches, "b", cycles / 2)?,
            test_cycles: number(&matches, "T", DEFAULT_TEST_CYCLES)?,
            hyper_every: hyper_every,
            restart: restart,
            estimate: matches.opt_present("e"),
            eval_mode: eval_mode,
            estimator: estimator,
            seed: number(&matches, "s", DEFAULT_SEED)?,
            threads: number(&matches, "t", 1)?,
            mapping: matches.opt_str("M").map(PathBuf::from),
            outputs: matches
                .opt_str("o")
                .unwrap_or_else(|| "ndt,nwt".to_owned())
                .parse::<Outputs>()?,
            top_words: number(&matches, "n", DEFAULT_TOP_WORDS)?,
            stirling_limits: stirling_limits(&matches)?,
            report_every: number(&matches, "report-every", DEFAULT_REPORT_EVERY)?,
            verbosity: verbosity,
            word_prior_given: word_prior_given,
            priors_given: PRIOR_OPTIONS.iter().any(|o| matches.opt_present(o)),
        };
        config.validate()?;
        Ok(Left(config))
    }

    pub fn validate(&self) -> Result<()> {
        self.spec.validate()?;
        if self.burn_in > self.cycles {
            return Err(Error::config(format!(
                "burn-in of {} sweeps is longer than the {} training cycles",
                self.burn_in, self.cycles
            )));
        }
        if self.threads == 0 {
            return Err(Error::config("need at least one thread"));
        }
        if self.threads > 1 && !cfg!(feature = "parallel") {
            return Err(Error::config("multi-threaded sampling needs the `parallel` feature"));
        }
        if self.restart == Some(RestartMode::Topics) && self.word_prior_given {
            return Err(Error::config(
                "restarting from topics keeps the saved topic-word distributions; drop --word-prior",
            ));
        }
        if self.restart.is_none() && self.cycles == 0 {
            return Err(Error::config("nothing to do: no training cycles and no restart"));
        }
        Ok(())
    }

    /// Whether any prior or hierarchy option was given on the command line.
    pub fn priors_given(&self) -> bool {
        self.priors_given
    }

    pub fn corpus_path(&self) -> PathBuf {
        with_suffix(&self.stem, CORPUS_SUFFIX)
    }

    pub fn vocabulary_path(&self) -> PathBuf {
        with_suffix(&self.stem, VOCABULARY_SUFFIX)
    }

    pub fn output(&self, suffix: &str) -> PathBuf {
        with_suffix(&self.out_stem, suffix)
    }

    pub fn groups_path(&self) -> Option<&Path> {
        self.groups.as_ref().map(|p| p.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::Hyper;

    fn parse(line: &str) -> Result<Either<Config, String>> {
        let args: Vec<String> = std::iter::once("hptm")
            .chain(line.split_whitespace())
            .map(|s| s.to_owned())
            .collect();
        Config::from_args(&args)
    }

    fn config(line: &str) -> Config {
        match parse(line).unwrap() {
            Left(c) => c,
            Right(_) => panic!("unexpected help"),
        }
    }

    #[test]
    fn defaults() {
        let c = config("data/c");
        assert_eq!(c.spec.num_topics, DEFAULT_NUM_TOPICS);
        assert_eq!(c.cycles, 100);
        assert_eq!(c.burn_in, 50);
        assert_eq!(c.out_stem, PathBuf::from("data/c"));
        assert_eq!(c.corpus_path(), PathBuf::from("data/c.ldac"));
        assert_eq!(c.test_corpus, PathBuf::from("data/c.test.ldac"));
        assert!(c.outputs.doc_topic && c.outputs.topic_word && !c.outputs.top_words);
        assert_eq!(c.eval_mode, None);
        assert_eq!(c.groups, None);
        assert_eq!(c.verbosity, 1);
    }

    #[test]
    fn full_option_set() {
        let c = config(
            "-K 4 -C 20 -b 5 -A pyp:1,0.2 -W sparse -H grouped --burst dir:30 -s 9 -t 1 \
             --test-mode query -E l2r --particles 7 -o ndt,top,log -n 5 -vv in out",
        );
        assert_eq!(c.spec.num_topics, 4);
        assert_eq!(c.burn_in, 5);
        assert_eq!(
            c.spec.doc_prior,
            PriorFamily::PitmanYor {
                concentration: Hyper::fixed(1.0),
                discount: Hyper::fixed(0.2),
            }
        );
        assert_eq!(c.spec.burst.map(|b| b.b()), Some(30.0));
        assert_eq!(c.groups, Some(PathBuf::from("in.grp")));
        assert_eq!(c.estimator, Estimator::LeftToRight { particles: 7 });
        assert_eq!(c.output(PHI_SUFFIX), PathBuf::from("out.phi"));
        assert!(c.outputs.log && !c.outputs.topic_word);
        assert_eq!(c.verbosity, 3);
        assert_eq!(c.seed, 9);
        assert_eq!(c.top_words, 5);
        assert_eq!(c.eval_mode, Some(EvalMode::Query));
        assert!(!c.estimate);
        assert!(c.priors_given());
    }

    #[test]
    fn parses_the_orchestration_invocation() {
        let args: Vec<String> = ["hca", "-e", "-C", "300", "-K", "10", "-N200000,20000", "in", "out"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let c = match Config::from_args(&args).unwrap() {
            Left(c) => c,
            Right(_) => panic!("unexpected help"),
        };
        assert!(c.estimate);
        assert_eq!(c.cycles, 300);
        assert_eq!(c.spec.num_topics, 10);
        assert_eq!(c.stirling_limits, (200000, 20000));
        assert_eq!(c.stem, PathBuf::from("in"));
        assert_eq!(c.out_stem, PathBuf::from("out"));
        assert_eq!(c.eval_mode, None);
        assert_eq!(c.top_words, DEFAULT_TOP_WORDS);
        assert!(!c.priors_given());
    }

    #[test]
    fn stirling_limits_default_the_table_count() {
        assert_eq!(config("-N 500 c").stirling_limits, (500, STIRLING_HYPER_MAX_T));
        assert_eq!(config("c").stirling_limits, (STIRLING_HYPER_MAX_N, STIRLING_HYPER_MAX_T));
        assert!(parse("-N 0,10 c").is_err());
        assert!(parse("-N 10,x c").is_err());
    }

    #[test]
    fn fix_hyper_freezes_everything() {
        let c = config("--fix-hyper c");
        assert_eq!(c.hyper_every, 0);
        assert_eq!(c.spec, c.spec.frozen());
    }

    #[test]
    fn rejects_bad_combinations() {
        assert!(parse("-A adir c").is_err());
        assert!(parse("-A sparse c").is_err());
        assert!(parse("-K 0 c").is_err());
        assert!(parse("-C 10 -b 11 c").is_err());
        assert!(parse("-C 0 c").is_err());
        assert!(parse("-r topics -W dir c").is_err());
        assert!(parse("-o ndt,xyz c").is_err());
        assert!(parse("-K many c").is_err());
        assert!(parse("").is_err());
        assert_eq!(parse("-K 0 c").unwrap_err().exit_code(), 1);
    }

    #[test]
    fn restart_without_cycles_is_evaluation_only() {
        let c = config("-r resume -C 0 --test-mode heldout c out");
        assert_eq!(c.restart, Some(RestartMode::Resume));
        assert_eq!(c.cycles, 0);
        assert_eq!(c.burn_in, 0);
    }

    #[test]
    fn help_returns_usage() {
        match parse("-h").unwrap() {
            Right(text) => assert!(text.contains("--word-prior")),
            Left(_) => panic!("expected usage"),
        }
    }
}
