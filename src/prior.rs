//! Prior families and their command-line syntax.
//!
//! A prior is written `family[:x[,y]]`. Numbers given explicitly are held
//! fixed; omitted ones start from the defaults in `def` and are learned.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::def::*;
use crate::error::{Error, Result};

/// A hyperparameter value and whether the sampler may move it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hyper {
    pub value: f64,
    pub learn: bool,
}

impl Hyper {
    pub fn fixed(value: f64) -> Self {
        Hyper {
            value: value,
            learn: false,
        }
    }

    pub fn learned(value: f64) -> Self {
        Hyper {
            value: value,
            learn: true,
        }
    }

    fn from_option(value: Option<f64>, default: f64) -> Self {
        match value {
            Some(v) => Hyper::fixed(v),
            None => Hyper::learned(default),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Document,
    Word,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum PriorFamily {
    /// Per-component weight, so the total concentration is `value * dim`.
    DirichletSymmetric { per_component: Hyper },
    /// Total concentration around a learned mean.
    DirichletAsymmetric { concentration: Hyper },
    PitmanYor { concentration: Hyper, discount: Hyper },
    /// Topic-word only: per-word on/off indicators with weight `sparsity`.
    Sparse { concentration: Hyper, sparsity: Hyper },
}

/// Concentration and discount of one level of a hierarchy. Dirichlet nodes
/// carry a fixed zero discount.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePrior {
    pub concentration: Hyper,
    pub discount: Hyper,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyKind {
    Flat,
    Corpus,
    Grouped,
}

static PRIOR_PATTERN: OnceLock<Regex> = OnceLock::new();

fn prior_pattern() -> &'static Regex {
    PRIOR_PATTERN.get_or_init(|| {
        Regex::new(r"^(dir|adir|pyp|sparse)(?::([^,]+)(?:,([^,]+))?)?$").expect("prior regex must compile")
    })
}

fn parse_number(spec: &str, text: Option<&str>) -> Result<Option<f64>> {
    match text {
        None => Ok(None),
        Some(t) => t
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| Error::config(format!("bad number {:?} in prior {:?}", t, spec))),
    }
}

fn check_concentration(spec: &str, v: Option<f64>) -> Result<()> {
    match v {
        Some(x) if !(x > 0.0 && x.is_finite()) => Err(Error::config(format!(
            "prior {:?}: concentration must be positive",
            spec
        ))),
        _ => Ok(()),
    }
}

fn check_unit(spec: &str, v: Option<f64>, what: &str) -> Result<()> {
    match v {
        Some(x) if !(x > 0.0 && x < 1.0) => Err(Error::config(format!(
            "prior {:?}: {} must lie in (0, 1)",
            spec, what
        ))),
        _ => Ok(()),
    }
}

impl PriorFamily {
    pub fn parse(spec: &str, side: Side) -> Result<Self> {
        let caps = prior_pattern()
            .captures(spec.trim())
            .ok_or_else(|| Error::config(format!("unrecognised prior {:?}", spec)))?;
        let first = parse_number(spec, caps.get(2).map(|m| m.as_str()))?;
        let second = parse_number(spec, caps.get(3).map(|m| m.as_str()))?;
        let family = &caps[1];

        if second.is_some() && (family == "dir" || family == "adir") {
            return Err(Error::config(format!(
                "prior {:?} takes at most one number",
                spec
            )));
        }
        check_concentration(spec, first)?;

        let prior = match family {
            "dir" => {
                let default = match side {
                    Side::Document => DEFAULT_ALPHA,
                    Side::Word => DEFAULT_BETA,
                };
                PriorFamily::DirichletSymmetric {
                    per_component: Hyper::from_option(first, default),
                }
            }
            "adir" => PriorFamily::DirichletAsymmetric {
                concentration: Hyper::from_option(first, DEFAULT_ASYM_CONCENTRATION),
            },
            "pyp" => {
                check_unit(spec, second, "discount")?;
                PriorFamily::PitmanYor {
                    concentration: Hyper::from_option(first, DEFAULT_PYP_CONCENTRATION),
                    discount: Hyper::from_option(second, DEFAULT_PYP_DISCOUNT),
                }
            }
            _ => {
                if side == Side::Document {
                    return Err(Error::config(
                        "the sparse prior is only available for topic-word distributions",
                    ));
                }
                check_unit(spec, second, "sparsity")?;
                PriorFamily::Sparse {
                    concentration: Hyper::from_option(first, DEFAULT_BETA),
                    sparsity: Hyper::from_option(second, DEFAULT_SPARSITY),
                }
            }
        };
        Ok(prior)
    }

    /// Whether the leaf sits under a learned mean rather than the uniform base.
    pub fn needs_parent(&self) -> bool {
        match self {
            PriorFamily::DirichletAsymmetric { .. } | PriorFamily::PitmanYor { .. } => true,
            _ => false,
        }
    }

    /// Leaf node prior for restaurants over `dim` dishes. `None` for the
    /// sparse family, which has no restaurant.
    pub fn leaf(&self, dim: usize) -> Option<NodePrior> {
        match *self {
            PriorFamily::DirichletSymmetric { per_component } => Some(NodePrior::dirichlet(Hyper {
                value: per_component.value * dim as f64,
                learn: per_component.learn,
            })),
            PriorFamily::DirichletAsymmetric { concentration } => {
                Some(NodePrior::dirichlet(concentration))
            }
            PriorFamily::PitmanYor {
                concentration,
                discount,
            } => Some(NodePrior {
                concentration: concentration,
                discount: discount,
            }),
            PriorFamily::Sparse { .. } => None,
        }
    }

    pub fn learns(&self) -> bool {
        match self {
            PriorFamily::DirichletSymmetric { per_component } => per_component.learn,
            PriorFamily::DirichletAsymmetric { concentration } => concentration.learn,
            PriorFamily::PitmanYor {
                concentration,
                discount,
            } => concentration.learn || discount.learn,
            PriorFamily::Sparse {
                concentration,
                sparsity,
            } => concentration.learn || sparsity.learn,
        }
    }

    /// Same family with every value fixed.
    pub fn frozen(&self) -> Self {
        let fix = |h: Hyper| Hyper::fixed(h.value);
        match *self {
            PriorFamily::DirichletSymmetric { per_component } => {
                PriorFamily::DirichletSymmetric {
                    per_component: fix(per_component),
                }
            }
            PriorFamily::DirichletAsymmetric { concentration } => {
                PriorFamily::DirichletAsymmetric {
                    concentration: fix(concentration),
                }
            }
            PriorFamily::PitmanYor {
                concentration,
                discount,
            } => PriorFamily::PitmanYor {
                concentration: fix(concentration),
                discount: fix(discount),
            },
            PriorFamily::Sparse {
                concentration,
                sparsity,
            } => PriorFamily::Sparse {
                concentration: fix(concentration),
                sparsity: fix(sparsity),
            },
        }
    }
}

impl fmt::Display for PriorFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PriorFamily::DirichletSymmetric { per_component } => {
                write!(f, "dir:{}", per_component.value)
            }
            PriorFamily::DirichletAsymmetric { concentration } => {
                write!(f, "adir:{}", concentration.value)
            }
            PriorFamily::PitmanYor {
                concentration,
                discount,
            } => write!(f, "pyp:{},{}", concentration.value, discount.value),
            PriorFamily::Sparse {
                concentration,
                sparsity,
            } => write!(f, "sparse:{},{}", concentration.value, sparsity.value),
        }
    }
}

impl NodePrior {
    pub fn dirichlet(concentration: Hyper) -> Self {
        NodePrior {
            concentration: concentration,
            discount: Hyper::fixed(0.0),
        }
    }

    /// Parse an inner-node prior, `dir[:b]` or `pyp[:b[,a]]`. Here `dir:b`
    /// is a total concentration.
    pub fn parse(spec: &str, default_concentration: f64) -> Result<Self> {
        let caps = prior_pattern()
            .captures(spec.trim())
            .ok_or_else(|| Error::config(format!("unrecognised prior {:?}", spec)))?;
        let first = parse_number(spec, caps.get(2).map(|m| m.as_str()))?;
        let second = parse_number(spec, caps.get(3).map(|m| m.as_str()))?;
        check_concentration(spec, first)?;
        match &caps[1] {
            "dir" if second.is_none() => Ok(NodePrior::dirichlet(Hyper::from_option(
                first,
                default_concentration,
            ))),
            "pyp" => {
                check_unit(spec, second, "discount")?;
                Ok(NodePrior {
                    concentration: Hyper::from_option(first, default_concentration),
                    discount: Hyper::from_option(second, DEFAULT_PYP_DISCOUNT),
                })
            }
            _ => Err(Error::config(format!(
                "prior {:?}: inner nodes take dir[:b] or pyp[:b,a]",
                spec
            ))),
        }
    }

    pub fn learns(&self) -> bool {
        self.concentration.learn || self.discount.learn
    }

    pub fn frozen(&self) -> Self {
        NodePrior {
            concentration: Hyper::fixed(self.concentration.value),
            discount: Hyper::fixed(self.discount.value),
        }
    }

    pub fn b(&self) -> f64 {
        self.concentration.value
    }

    pub fn a(&self) -> f64 {
        self.discount.value
    }
}

impl FromStr for HierarchyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(HierarchyKind::Flat),
            "corpus" => Ok(HierarchyKind::Corpus),
            "grouped" => Ok(HierarchyKind::Grouped),
            _ => Err(Error::config(format!(
                "unknown hierarchy {:?} (flat, corpus or grouped)",
                s
            ))),
        }
    }
}

impl HierarchyKind {
    /// Levels above the document restaurants.
    pub fn upper_levels(&self) -> usize {
        match self {
            HierarchyKind::Flat => 0,
            HierarchyKind::Corpus => 1,
            HierarchyKind::Grouped => 2,
        }
    }
}
