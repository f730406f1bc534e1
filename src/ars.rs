//! Univariate samplers for hyperparameter conditionals.
//!
//! A target is anything implementing [`LogDensity`] on a bounded interval.
//! [`adaptive_rejection`] builds a piecewise-exponential envelope from
//! tangents at a growing set of abscissae (Gilks & Wild 1992); it only works
//! for log-concave targets and reports [`SampleError::NotLogConcave`] as soon
//! as the tangent slopes stop decreasing. [`slice`] is the stepping-out /
//! shrinkage slice sampler (Neal 2003) and makes no concavity assumption.
//! [`sample`] tries the first and falls back to the second. Every loop is
//! bounded by `Settings::max_attempts`.

use rand::distributions::{Distribution, Exp1};
use rand::Rng;
use thiserror::Error;

use crate::def::{HYPER_INITIAL_POINTS, HYPER_MAX_ATTEMPTS};
use crate::special::log_sum_exp;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleError {
    #[error("sampler gave up after {attempts} attempts")]
    Exhausted { attempts: usize },
    #[error("target is not log-concave near {at}")]
    NotLogConcave { at: f64 },
    #[error("log density is not finite at {at}")]
    NonFinite { at: f64 },
    #[error("empty support [{lower}, {upper}]")]
    EmptySupport { lower: f64, upper: f64 },
}

pub trait LogDensity {
    fn ln_density(&self, x: f64) -> f64;

    /// Bounds of the support. Both must be finite.
    fn support(&self) -> (f64, f64);

    /// d/dx of `ln_density`. Central difference unless overridden.
    fn derivative(&self, x: f64) -> f64 {
        let (lower, upper) = self.support();
        let h = (x.abs() * 1e-6).max(1e-9);
        let lo = (x - h).max(lower);
        let hi = (x + h).min(upper);
        (self.ln_density(hi) - self.ln_density(lo)) / (hi - lo)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub max_attempts: usize,
    pub initial_points: usize,
    /// Initial slice width as a fraction of the current value.
    pub slice_width: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_attempts: HYPER_MAX_ATTEMPTS,
            initial_points: HYPER_INITIAL_POINTS,
            slice_width: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Draw {
    pub value: f64,
    /// The target was not log-concave and the slice sampler took over.
    pub fell_back: bool,
}

/// Draw with adaptive rejection, falling back to slice sampling when the
/// target turns out not to be log-concave.
pub fn sample<D: LogDensity, R: Rng>(
    target: &D,
    current: f64,
    settings: &Settings,
    rng: &mut R,
) -> Result<Draw, SampleError> {
    match adaptive_rejection(target, current, settings, rng) {
        Ok(x) => Ok(Draw {
            value: x,
            fell_back: false,
        }),
        Err(SampleError::NotLogConcave { .. }) => {
            slice(target, current, settings, rng).map(|x| Draw {
                value: x,
                fell_back: true,
            })
        }
        Err(e) => Err(e),
    }
}

struct Tangent {
    x: f64,
    h: f64,
    dh: f64,
}

impl Tangent {
    fn at(&self, x: f64) -> f64 {
        self.h + self.dh * (x - self.x)
    }
}

pub fn adaptive_rejection<D: LogDensity, R: Rng>(
    target: &D,
    current: f64,
    settings: &Settings,
    rng: &mut R,
) -> Result<f64, SampleError> {
    let (lower, upper) = checked_support(target)?;
    let current = current.max(lower).min(upper);

    let mut xs: Vec<f64> = Vec::new();
    let n_init = settings.initial_points.max(1);
    let spread = (settings.slice_width * current.abs()).max(0.1 * (upper - lower).min(1.0));
    for i in 0..n_init {
        // points spread evenly around the current value
        let offset = i as f64 - (n_init as f64 - 1.0) / 2.0;
        let x = (current + spread * offset).max(lower).min(upper);
        if !xs.iter().any(|&y| (y - x).abs() <= 1e-12 * x.abs().max(1.0)) {
            xs.push(x);
        }
    }
    xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut tangents: Vec<Tangent> = Vec::with_capacity(xs.len() + settings.max_attempts);
    for &x in &xs {
        tangents.push(tangent(target, x)?);
    }
    check_concave(&tangents)?;

    for _ in 0..settings.max_attempts {
        let z = intersections(&tangents, lower, upper);
        // ln of the envelope mass over each segment
        let masses: Vec<f64> = tangents
            .iter()
            .enumerate()
            .map(|(i, tan)| segment_ln_mass(tan, z[i], z[i + 1]))
            .collect();
        let total = log_sum_exp(&masses);
        if !total.is_finite() {
            return Err(SampleError::NonFinite { at: current });
        }

        let u: f64 = rng.gen();
        let mut acc = 0.0;
        let mut seg = masses.len() - 1;
        for (i, m) in masses.iter().enumerate() {
            acc += (m - total).exp();
            if u < acc {
                seg = i;
                break;
            }
        }
        let x = sample_segment(&tangents[seg], z[seg], z[seg + 1], rng.gen());
        let hx = target.ln_density(x);
        if hx.is_nan() {
            return Err(SampleError::NonFinite { at: x });
        }
        let envelope = tangents[seg].at(x);
        let ln_u: f64 = rng.gen::<f64>().ln();
        if ln_u <= hx - envelope {
            return Ok(x);
        }

        // refine the envelope at the rejected point
        let t = tangent(target, x)?;
        let pos = tangents
            .iter()
            .position(|tan| tan.x > x)
            .unwrap_or(tangents.len());
        if pos > 0 && (tangents[pos - 1].x - x).abs() < 1e-14 {
            continue;
        }
        tangents.insert(pos, t);
        check_concave(&tangents)?;
    }
    Err(SampleError::Exhausted {
        attempts: settings.max_attempts,
    })
}

pub fn slice<D: LogDensity, R: Rng>(
    target: &D,
    current: f64,
    settings: &Settings,
    rng: &mut R,
) -> Result<f64, SampleError> {
    let (lower, upper) = checked_support(target)?;
    let x0 = current.max(lower).min(upper);
    let h0 = target.ln_density(x0);
    if !h0.is_finite() {
        return Err(SampleError::NonFinite { at: x0 });
    }
    let e: f64 = Exp1.sample(rng);
    let level = h0 - e;

    let width = (settings.slice_width * x0.abs()).max(1e-3 * (upper - lower).min(1.0));
    let mut left = (x0 - width * rng.gen::<f64>()).max(lower);
    let mut right = (left + width).min(upper);

    let mut steps = settings.max_attempts;
    while steps > 0 && left > lower && target.ln_density(left) > level {
        left = (left - width).max(lower);
        steps -= 1;
    }
    steps = settings.max_attempts;
    while steps > 0 && right < upper && target.ln_density(right) > level {
        right = (right + width).min(upper);
        steps -= 1;
    }

    for _ in 0..settings.max_attempts {
        let x = left + rng.gen::<f64>() * (right - left);
        let hx = target.ln_density(x);
        if hx > level {
            return Ok(x);
        }
        if x < x0 {
            left = x;
        } else {
            right = x;
        }
    }
    Err(SampleError::Exhausted {
        attempts: settings.max_attempts,
    })
}

fn checked_support<D: LogDensity>(target: &D) -> Result<(f64, f64), SampleError> {
    let (lower, upper) = target.support();
    if !(lower.is_finite() && upper.is_finite()) || lower >= upper {
        return Err(SampleError::EmptySupport {
            lower: lower,
            upper: upper,
        });
    }
    Ok((lower, upper))
}

fn tangent<D: LogDensity>(target: &D, x: f64) -> Result<Tangent, SampleError> {
    let h = target.ln_density(x);
    let dh = target.derivative(x);
    if !h.is_finite() || !dh.is_finite() {
        return Err(SampleError::NonFinite { at: x });
    }
    Ok(Tangent { x: x, h: h, dh: dh })
}

fn check_concave(tangents: &[Tangent]) -> Result<(), SampleError> {
    for w in tangents.windows(2) {
        let tol = 1e-8 * w[0].dh.abs().max(w[1].dh.abs()).max(1.0);
        if w[1].dh > w[0].dh + tol {
            return Err(SampleError::NotLogConcave { at: w[1].x });
        }
    }
    Ok(())
}

// z[0] = lower, z[n] = upper, z[i] = meeting point of tangents i-1 and i.
fn intersections(tangents: &[Tangent], lower: f64, upper: f64) -> Vec<f64> {
    let mut z = Vec::with_capacity(tangents.len() + 1);
    z.push(lower);
    for w in tangents.windows(2) {
        let (a, b) = (&w[0], &w[1]);
        let denom = a.dh - b.dh;
        let zi = if denom.abs() < 1e-12 {
            0.5 * (a.x + b.x)
        } else {
            (b.h - a.h - b.x * b.dh + a.x * a.dh) / denom
        };
        z.push(zi.max(a.x).min(b.x));
    }
    z.push(upper);
    z
}

fn segment_ln_mass(tan: &Tangent, left: f64, right: f64) -> f64 {
    let w = right - left;
    if w <= 0.0 {
        return std::f64::NEG_INFINITY;
    }
    let s = tan.dh;
    if s.abs() * w < 1e-10 {
        return tan.at(left) + w.ln();
    }
    if s > 0.0 {
        tan.at(right) + (-(-s * w).exp_m1()).ln() - s.ln()
    } else {
        tan.at(left) + (-(s * w).exp_m1()).ln() - (-s).ln()
    }
}

// Inverse CDF of exp(tangent) restricted to [left, right].
fn sample_segment(tan: &Tangent, left: f64, right: f64, u: f64) -> f64 {
    let w = right - left;
    let s = tan.dh;
    let x = if s.abs() * w < 1e-10 {
        left + u * w
    } else if s > 0.0 {
        right + (u + (1.0 - u) * (-s * w).exp()).ln() / s
    } else {
        left + (1.0 - u + u * (s * w).exp()).ln() / s
    };
    x.max(left).min(right)
}
