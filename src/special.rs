//! Special functions used by the posterior computations.
//!
//! `ln_gamma` and `digamma` come from statrs. The rising-factorial helpers
//! sum term by term for short runs, which keeps full relative precision when
//! the concentration is tiny and `ln_gamma(x + n) - ln_gamma(x)` would cancel.

use crate::def::DIRECT_SUM_LIMIT;
use statrs::function::gamma;

pub fn ln_gamma(x: f64) -> f64 {
    gamma::ln_gamma(x)
}

pub fn digamma(x: f64) -> f64 {
    gamma::digamma(x)
}

/// ln of the rising factorial (x)_n = x (x+1) ... (x+n-1).
pub fn ln_rising(x: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if n <= DIRECT_SUM_LIMIT {
        let mut sum = 0.0;
        for i in 0..n {
            sum += (x + i as f64).ln();
        }
        return sum;
    }
    ln_gamma(x + n as f64) - ln_gamma(x)
}

/// ln of the generalized rising factorial (b|a)_n = b (b+a) ... (b+(n-1)a).
pub fn ln_rising_discounted(b: f64, a: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if a == 0.0 {
        return n as f64 * b.ln();
    }
    if n > DIRECT_SUM_LIMIT {
        // (b|a)_n = a^n (b/a)_n
        return n as f64 * a.ln() + ln_rising(b / a, n);
    }
    let mut sum = 0.0;
    for i in 0..n {
        sum += (b + i as f64 * a).ln();
    }
    sum
}

/// psi(x + n) - psi(x), the derivative of `ln_rising` in x.
pub fn digamma_rising(x: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if n <= DIRECT_SUM_LIMIT {
        let mut sum = 0.0;
        for i in 0..n {
            sum += 1.0 / (x + i as f64);
        }
        return sum;
    }
    digamma(x + n as f64) - digamma(x)
}

/// Sum of 1 / (b + i a) for i < n, the derivative of `ln_rising_discounted` in b.
pub fn discounted_harmonic(b: f64, a: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    if a == 0.0 {
        return n as f64 / b;
    }
    if n > DIRECT_SUM_LIMIT {
        return digamma_rising(b / a, n) / a;
    }
    let mut sum = 0.0;
    for i in 0..n {
        sum += 1.0 / (b + i as f64 * a);
    }
    sum
}

pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(std::f64::NEG_INFINITY, f64::max);
    if max == std::f64::NEG_INFINITY {
        return max;
    }
    if max == std::f64::INFINITY {
        return max;
    }
    let sum: f64 = xs.iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// ln(exp(x) + exp(y)) without overflow.
pub fn log_add_exp(x: f64, y: f64) -> f64 {
    if x == std::f64::NEG_INFINITY {
        return y;
    }
    if y == std::f64::NEG_INFINITY {
        return x;
    }
    if x > y {
        x + (y - x).exp().ln_1p()
    } else {
        y + (x - y).exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

    #[test]
    fn ln_gamma_known_values() {
        assert_relative_eq!(ln_gamma(1.0), 0.0, epsilon = 1e-14);
        assert_relative_eq!(ln_gamma(2.0), 0.0, epsilon = 1e-14);
        assert_relative_eq!(
            ln_gamma(0.5),
            std::f64::consts::PI.sqrt().ln(),
            max_relative = 1e-12
        );
        assert_relative_eq!(ln_gamma(10.0), 362_880f64.ln(), max_relative = 1e-12);
    }

    #[test]
    fn digamma_known_values_and_recurrence() {
        assert_relative_eq!(digamma(1.0), -EULER_GAMMA, max_relative = 1e-10);
        for &x in &[0.01, 0.3, 1.7, 12.5, 250.0] {
            assert_relative_eq!(digamma(x + 1.0), digamma(x) + 1.0 / x, max_relative = 1e-10);
        }
    }

    #[test]
    fn digamma_tiny_argument() {
        let x = 1e-8;
        assert_relative_eq!(digamma(x), -1.0 / x - EULER_GAMMA, max_relative = 1e-10);
    }

    #[test]
    fn rising_matches_gamma_ratio() {
        for &x in &[0.2, 3.0, 40.0] {
            for &n in &[1u32, 5, 63, 64, 65, 300] {
                let expected = ln_gamma(x + n as f64) - ln_gamma(x);
                assert_relative_eq!(ln_rising(x, n), expected, max_relative = 1e-10);
            }
        }
        assert_eq!(ln_rising(0.7, 0), 0.0);
    }

    #[test]
    fn rising_keeps_precision_for_tiny_concentration() {
        // (x)_2 = x (x + 1); ln_gamma differences lose digits here.
        let x = 1e-12;
        assert_relative_eq!(ln_rising(x, 2), x.ln() + (1.0 + x).ln(), max_relative = 1e-14);
    }

    #[test]
    fn discounted_rising_reduces_to_powers_and_rising() {
        assert_relative_eq!(ln_rising_discounted(2.0, 0.0, 4), 4.0 * 2.0f64.ln());
        assert_relative_eq!(ln_rising_discounted(2.0, 1.0, 5), ln_rising(2.0, 5), max_relative = 1e-12);
        // the long path goes through ln_rising(b/a, n)
        let direct: f64 = (0..100).map(|i| (1.5 + i as f64 * 0.3).ln()).sum();
        assert_relative_eq!(ln_rising_discounted(1.5, 0.3, 100), direct, max_relative = 1e-10);
    }

    #[test]
    fn harmonic_is_derivative_of_discounted_rising() {
        let (b, a, n) = (3.0, 0.4, 80u32);
        let h = 1e-6;
        let numeric =
            (ln_rising_discounted(b + h, a, n) - ln_rising_discounted(b - h, a, n)) / (2.0 * h);
        assert_relative_eq!(discounted_harmonic(b, a, n), numeric, max_relative = 1e-6);
        let numeric = (ln_rising(b + h, 20) - ln_rising(b - h, 20)) / (2.0 * h);
        assert_relative_eq!(digamma_rising(b, 20), numeric, max_relative = 1e-6);
    }

    #[test]
    fn log_sum_exp_is_stable() {
        let xs = [-1000.0, -1000.0];
        assert_relative_eq!(log_sum_exp(&xs), -1000.0 + 2f64.ln(), max_relative = 1e-12);
        assert_eq!(log_sum_exp(&[]), std::f64::NEG_INFINITY);
        assert_relative_eq!(log_add_exp(0.0, 0.0), 2f64.ln());
        assert_eq!(log_add_exp(std::f64::NEG_INFINITY, 3.0), 3.0);
    }
}
