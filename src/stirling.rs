//! Table-count auxiliary variates for Pitman-Yor and Dirichlet nodes.
//!
//! Restaurants only keep customer and table counts per dish, not the seating
//! itself. Whether a new customer opens a table is drawn from the
//! table-indicator posterior, which needs ratios of generalized Stirling
//! numbers S^n_{t,a}. Those are kept in log space:
//!
//!   S^{n+1}_{t,a} = S^n_{t-1,a} + (n - t a) S^n_{t,a},   S^0_{0,a} = 1
//!
//! With a = 0 these are the unsigned Stirling numbers of the first kind.

use rand::Rng;

use crate::special::log_add_exp;

const NEG_INF: f64 = std::f64::NEG_INFINITY;

#[derive(Clone, Debug)]
pub struct StirlingTable {
    discount: f64,
    // rows[n][t] = ln S^n_{t,a}, t in 0..=n
    rows: Vec<Vec<f64>>,
}

impl StirlingTable {
    pub fn new(discount: f64, max_n: usize) -> Self {
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(max_n + 1);
        rows.push(vec![0.0]);
        for n in 0..max_n {
            let row = {
                let prev = &rows[n];
                next_row(prev, n, n + 1, discount)
            };
            rows.push(row);
        }
        Self {
            discount: discount,
            rows: rows,
        }
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    /// Largest n the table covers.
    pub fn max_n(&self) -> usize {
        self.rows.len() - 1
    }

    pub fn ln_s(&self, n: u32, t: u32) -> Option<f64> {
        let n = n as usize;
        let t = t as usize;
        if n >= self.rows.len() {
            return None;
        }
        if t > n {
            return Some(NEG_INF);
        }
        Some(self.rows[n][t])
    }
}

// Row n+1 from row n, truncated to t <= max_t.
fn next_row(prev: &[f64], n: usize, max_t: usize, discount: f64) -> Vec<f64> {
    let width = (n + 1).min(max_t) + 1;
    let mut row = vec![NEG_INF; width];
    for t in 1..width {
        let from_new = if t - 1 < prev.len() { prev[t - 1] } else { NEG_INF };
        let from_old = if t <= n && t < prev.len() {
            (n as f64 - t as f64 * discount).ln() + prev[t]
        } else {
            NEG_INF
        };
        row[t] = log_add_exp(from_new, from_old);
    }
    row
}

/// Probability that a customer added to a dish with `n` customers at `t`
/// tables opens a new one. `new_table_weight` is b + a T for the
/// restaurant and `parent_p` the parent's predictive probability for the dish.
pub fn new_table_probability(
    n: u32,
    t: u32,
    discount: f64,
    new_table_weight: f64,
    parent_p: f64,
    table: Option<&StirlingTable>,
) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let w_parent = new_table_weight * parent_p;
    if w_parent <= 0.0 {
        return 0.0;
    }
    if let Some(table) = table {
        if let (Some(s_n_t), Some(s_up_new), Some(s_up_old)) = (
            table.ln_s(n, t),
            table.ln_s(n + 1, t + 1),
            table.ln_s(n + 1, t),
        ) {
            let n1 = (n + 1) as f64;
            let ln_new = w_parent.ln() + ((t + 1) as f64 / n1).ln() + s_up_new - s_n_t;
            let ln_old = ((n - t + 1) as f64 / n1).ln() + s_up_old - s_n_t;
            return 1.0 / (1.0 + (ln_old - ln_new).exp());
        }
    }
    // Beyond the table: plain Chinese restaurant ratio.
    let w_old = n as f64 - discount * t as f64;
    if w_old <= 0.0 {
        return 1.0;
    }
    w_parent / (w_parent + w_old)
}

pub fn sample_new_table<R: Rng>(
    n: u32,
    t: u32,
    discount: f64,
    new_table_weight: f64,
    parent_p: f64,
    table: Option<&StirlingTable>,
    rng: &mut R,
) -> bool {
    let p = new_table_probability(n, t, discount, new_table_weight, parent_p, table);
    if p >= 1.0 {
        return true;
    }
    rng.gen::<f64>() < p
}

/// Whether removing one of `n` customers (seated at `t` tables) closes a table.
/// The last customer always closes it; the last table of a dish that still has
/// other customers never closes.
pub fn sample_table_closes<R: Rng>(n: u32, t: u32, rng: &mut R) -> bool {
    if n <= 1 {
        return true;
    }
    if t <= 1 {
        return false;
    }
    rng.gen::<f64>() * (n as f64) < t as f64
}

/// Sum of ln S^n_{t,a} over `pairs`. Pairs with more than `max_n` customers
/// or `max_t` tables are left out; the number left out is returned alongside
/// the sum.
pub fn ln_stirling_sum(discount: f64, pairs: &[(u32, u32)], max_n: usize, max_t: usize) -> (f64, usize) {
    let within = |n: u32, t: u32| (n as usize) <= max_n && (t as usize) <= max_t;
    let mut kept: Vec<(u32, u32)> = pairs
        .iter()
        .cloned()
        .filter(|&(n, t)| n > 0 && within(n, t))
        .collect();
    let skipped = pairs.iter().filter(|&&(n, t)| !within(n, t)).count();
    if kept.is_empty() {
        return (0.0, skipped);
    }
    kept.sort();
    let top_n = kept[kept.len() - 1].0 as usize;
    let top_t = kept.iter().map(|&(_, t)| t as usize).max().unwrap_or(0);

    let mut sum = 0.0;
    let mut next = 0;
    let mut row = vec![0.0];
    for n in 0..top_n {
        row = next_row(&row, n, top_t, discount);
        let cur_n = (n + 1) as u32;
        while next < kept.len() && kept[next].0 == cur_n {
            let t = kept[next].1 as usize;
            sum += if t < row.len() { row[t] } else { NEG_INF };
            next += 1;
        }
    }
    (sum, skipped)
}
