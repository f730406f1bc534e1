use rand::Rng;

use crate::prior::NodePrior;
use crate::stirling::{sample_new_table, sample_table_closes, StirlingTable};

/// Customer and table counts of one Pitman-Yor (or Dirichlet, discount 0)
/// restaurant over a fixed set of dishes. Individual tables are not kept,
/// only how many of them serve each dish.
#[derive(Clone, Debug, PartialEq)]
pub struct Restaurant {
    customers: Vec<u32>,
    tables: Vec<u32>,
    total_customers: u64,
    total_tables: u64,
}

impl Restaurant {
    pub fn new(dim: usize) -> Self {
        Self {
            customers: vec![0; dim],
            tables: vec![0; dim],
            total_customers: 0,
            total_tables: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.customers.len()
    }

    pub fn customers(&self, dish: usize) -> u32 {
        self.customers[dish]
    }

    pub fn tables(&self, dish: usize) -> u32 {
        self.tables[dish]
    }

    pub fn total_customers(&self) -> u64 {
        self.total_customers
    }

    pub fn total_tables(&self) -> u64 {
        self.total_tables
    }

    pub fn customer_counts(&self) -> &[u32] {
        &self.customers
    }

    pub fn table_counts(&self) -> &[u32] {
        &self.tables
    }

    pub fn is_empty(&self) -> bool {
        self.total_customers == 0
    }

    /// Posterior predictive of `dish` given the parent's predictive `parent_p`.
    pub fn predictive(&self, dish: usize, prior: &NodePrior, parent_p: f64) -> f64 {
        let a = prior.a();
        let b = prior.b();
        let n = self.customers[dish] as f64;
        let t = self.tables[dish] as f64;
        let new_table = b + a * self.total_tables as f64;
        return (n - a * t + new_table * parent_p) / (b + self.total_customers as f64);
    }

    /// Adds a customer; returns whether it opened a new table, in which case
    /// the caller sends a customer to the parent.
    pub fn seat<R: Rng>(
        &mut self,
        dish: usize,
        prior: &NodePrior,
        parent_p: f64,
        stirling: Option<&StirlingTable>,
        rng: &mut R,
    ) -> bool {
        let n = self.customers[dish];
        let t = self.tables[dish];
        let new_table_weight = prior.b() + prior.a() * self.total_tables as f64;
        let opened = sample_new_table(n, t, prior.a(), new_table_weight, parent_p, stirling, rng);
        self.customers[dish] += 1;
        self.total_customers += 1;
        if opened {
            self.tables[dish] += 1;
            self.total_tables += 1;
        }
        opened
    }

    /// Removes a customer; returns whether a table closed with it.
    pub fn unseat<R: Rng>(&mut self, dish: usize, rng: &mut R) -> bool {
        let n = self.customers[dish];
        let t = self.tables[dish];
        debug_assert!(n > 0, "unseating from an empty dish");
        if n == 0 {
            return false;
        }
        let closes = sample_table_closes(n, t, rng);
        self.customers[dish] -= 1;
        self.total_customers -= 1;
        if closes && t > 0 {
            self.tables[dish] -= 1;
            self.total_tables -= 1;
        }
        closes
    }

    /// Seat a customer that is known to open a table, e.g. when replaying
    /// a parent from its children's tables.
    pub fn seat_with_table(&mut self, dish: usize) {
        self.customers[dish] += 1;
        self.tables[dish] += 1;
        self.total_customers += 1;
        self.total_tables += 1;
    }

    /// Adds `worker - base` to every count. Used to fold a worker's sweep
    /// into the global state; counts that would go negative stop at zero.
    pub fn apply_delta(&mut self, base: &Restaurant, worker: &Restaurant) {
        for m in 0..self.customers.len() {
            let dn = worker.customers[m] as i64 - base.customers[m] as i64;
            let dt = worker.tables[m] as i64 - base.tables[m] as i64;
            if dn != 0 {
                self.customers[m] = (self.customers[m] as i64 + dn).max(0) as u32;
            }
            if dt != 0 {
                self.tables[m] = (self.tables[m] as i64 + dt).max(0) as u32;
            }
        }
        self.recount();
    }

    /// Replace the customer counts, keeping tables within [min(1, n), n].
    pub fn set_customers(&mut self, counts: &[u32]) {
        self.customers.copy_from_slice(counts);
        self.clamp_tables();
    }

    pub fn clamp_tables(&mut self) {
        for m in 0..self.customers.len() {
            let n = self.customers[m];
            let t = self.tables[m];
            self.tables[m] = if n == 0 { 0 } else { t.max(1).min(n) };
        }
        self.recount();
    }

    fn recount(&mut self) {
        self.total_customers = self.customers.iter().map(|&n| n as u64).sum();
        self.total_tables = self.tables.iter().map(|&t| t as u64).sum();
    }

    /// Table invariants for every dish: t <= n, and t >= 1 when n >= 1.
    pub fn check(&self) -> Result<(), String> {
        for m in 0..self.customers.len() {
            let (n, t) = (self.customers[m], self.tables[m]);
            if t > n || (n > 0 && t == 0) {
                return Err(format!("dish {} has {} customers at {} tables", m, n, t));
            }
        }
        let n: u64 = self.customers.iter().map(|&n| n as u64).sum();
        let t: u64 = self.tables.iter().map(|&t| t as u64).sum();
        if n != self.total_customers || t != self.total_tables {
            return Err("restaurant totals are out of date".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::Hyper;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pyp(b: f64, a: f64) -> NodePrior {
        NodePrior {
            concentration: Hyper::fixed(b),
            discount: Hyper::fixed(a),
        }
    }

    #[test]
    fn predictive_sums_to_one() {
        let prior = pyp(2.0, 0.4);
        let table = StirlingTable::new(0.4, 64);
        let mut rng = StdRng::seed_from_u64(1);
        let mut r = Restaurant::new(5);
        for &dish in &[0, 0, 1, 3, 3, 3, 0, 4] {
            r.seat(dish, &prior, 0.2, Some(&table), &mut rng);
        }
        let total: f64 = (0..5).map(|m| r.predictive(m, &prior, 0.2)).sum();
        assert_relative_eq!(total, 1.0, max_relative = 1e-12);
        r.check().unwrap();
    }

    #[test]
    fn empty_restaurant_returns_parent() {
        let r = Restaurant::new(3);
        assert_relative_eq!(r.predictive(1, &pyp(1.5, 0.3), 0.25), 0.25);
    }

    #[test]
    fn seat_and_unseat_keep_invariants() {
        let prior = pyp(1.0, 0.5);
        let table = StirlingTable::new(0.5, 32);
        let mut rng = StdRng::seed_from_u64(42);
        let mut r = Restaurant::new(4);
        let mut dishes = Vec::new();
        for i in 0..200 {
            let dish = (i * 7) % 4;
            r.seat(dish, &prior, 0.25, Some(&table), &mut rng);
            dishes.push(dish);
            r.check().unwrap();
        }
        while let Some(dish) = dishes.pop() {
            r.unseat(dish, &mut rng);
            r.check().unwrap();
        }
        assert!(r.is_empty());
        assert_eq!(r.total_tables(), 0);
    }

    #[test]
    fn deltas_fold_into_the_base() {
        let prior = pyp(1.0, 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let mut base = Restaurant::new(3);
        base.seat(0, &prior, 0.3, None, &mut rng);
        let mut w1 = base.clone();
        let mut w2 = base.clone();
        w1.seat(1, &prior, 0.3, None, &mut rng);
        w2.seat(2, &prior, 0.3, None, &mut rng);
        w2.seat(2, &prior, 0.3, None, &mut rng);

        let mut merged = base.clone();
        merged.apply_delta(&base, &w1);
        merged.apply_delta(&base, &w2);
        merged.clamp_tables();
        assert_eq!(merged.customer_counts(), &[1, 1, 2]);
        assert_eq!(merged.total_customers(), 4);
        merged.check().unwrap();
    }

    #[test]
    fn set_customers_clamps_tables() {
        let mut r = Restaurant::new(2);
        r.seat_with_table(0);
        r.seat_with_table(0);
        r.seat_with_table(1);
        r.set_customers(&[1, 3]);
        assert_eq!(r.table_counts(), &[1, 1]);
        r.check().unwrap();
    }
}
