// Defaults and numeric limits shared across the engine.

pub const DEFAULT_NUM_TOPICS: usize = 10;
pub const DEFAULT_CYCLES: usize = 100;
pub const DEFAULT_TEST_CYCLES: usize = 50;
pub const DEFAULT_HYPER_EVERY: usize = 5;
// The orchestration scripts assume one perplexity line per five cycles.
pub const DEFAULT_REPORT_EVERY: usize = 5;
pub const DEFAULT_TOP_WORDS: usize = 20;
pub const DEFAULT_PARTICLES: usize = 20;
pub const DEFAULT_SEED: u64 = 1;

// Per-component Dirichlet parameters, i.e. alpha for theta and beta for phi.
pub const DEFAULT_ALPHA: f64 = 0.5;
pub const DEFAULT_BETA: f64 = 0.01;
// Total concentrations for hierarchical nodes.
pub const DEFAULT_ASYM_CONCENTRATION: f64 = 10.0;
pub const DEFAULT_PYP_CONCENTRATION: f64 = 10.0;
pub const DEFAULT_PYP_DISCOUNT: f64 = 0.5;
pub const DEFAULT_ROOT_CONCENTRATION: f64 = 10.0;
pub const DEFAULT_BURST_CONCENTRATION: f64 = 10.0;
pub const DEFAULT_SPARSITY: f64 = 0.5;

pub const CONCENTRATION_MIN: f64 = 1e-4;
pub const CONCENTRATION_MAX: f64 = 1e6;
pub const DISCOUNT_MIN: f64 = 1e-3;
pub const DISCOUNT_MAX: f64 = 0.99;
pub const SPARSITY_MIN: f64 = 1e-6;
pub const SPARSITY_MAX: f64 = 1.0 - 1e-6;

// Gamma(shape, rate) prior on every concentration.
pub const CONCENTRATION_PRIOR_SHAPE: f64 = 1.0;
pub const CONCENTRATION_PRIOR_RATE: f64 = 1e-3;
// Beta prior on discounts and on the sparsity weight.
pub const DISCOUNT_PRIOR_A: f64 = 1.0;
pub const DISCOUNT_PRIOR_B: f64 = 1.0;
pub const SPARSITY_PRIOR_A: f64 = 1.0;
pub const SPARSITY_PRIOR_B: f64 = 1.0;

// Prior mass kept by words switched off in a sparse topic, relative to an active word.
pub const SPARSE_LEAK: f64 = 1e-3;

// Largest customer count covered by the precomputed Stirling tables.
pub const STIRLING_MAX_N: usize = 256;
// Largest customer count used when scoring a discount.
pub const STIRLING_HYPER_MAX_N: usize = 4096;
// Largest table count used when scoring a discount.
pub const STIRLING_HYPER_MAX_T: usize = STIRLING_HYPER_MAX_N;

pub const HYPER_MAX_ATTEMPTS: usize = 50;
pub const HYPER_INITIAL_POINTS: usize = 3;

// Sums shorter than this are done term by term instead of through ln_gamma/digamma.
pub const DIRECT_SUM_LIMIT: u32 = 64;

pub const CORPUS_SUFFIX: &str = "ldac";
pub const VOCABULARY_SUFFIX: &str = "tokens";
pub const GROUPS_SUFFIX: &str = "grp";
pub const TEST_CORPUS_SUFFIX: &str = "test.ldac";
pub const PARAMETERS_SUFFIX: &str = "par";
pub const THETA_SUFFIX: &str = "theta";
pub const PHI_SUFFIX: &str = "phi";
pub const ASSIGNMENTS_SUFFIX: &str = "z";
pub const DOC_TOPIC_SUFFIX: &str = "ndt";
pub const TOPIC_WORD_SUFFIX: &str = "nwt";
pub const TOP_WORDS_SUFFIX: &str = "top";
pub const LOG_SUFFIX: &str = "log";

pub const SNAPSHOT_VERSION: u32 = 2;
