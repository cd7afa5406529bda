//! The sparse tableau: matrix rows, bounds, variable marks, SOS2 groups,
//! the objective, and the coefficient/cash registers the builder's
//! opcodes accumulate into.
//!
//! Columns are 1-based. Rows are committed from the coefficient register
//! by `add_constraint`; everything else is plain bookkeeping.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RowType {
    Le,
    Ge,
    Eq,
}

impl fmt::Display for RowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RowType::Le => "<=",
            RowType::Ge => ">=",
            RowType::Eq => "=",
        })
    }
}

#[derive(Default)]
pub struct Tableau {
    pub column_count: u32,
    pub objective: FxHashMap<u32, f64>,
    pub rows: Vec<FxHashMap<u32, f64>>,
    pub rhs: Vec<f64>,
    pub row_types: Vec<RowType>,
    /// Explicit lower bounds; absent means 0.
    pub lower: FxHashMap<u32, f64>,
    /// Explicit upper bounds; absent means +infinity.
    pub upper: FxHashMap<u32, f64>,
    pub integers: FxHashSet<u32>,
    pub binaries: FxHashSet<u32>,
    pub semi_continuous: FxHashSet<u32>,
    pub sos2: Vec<Vec<u32>>,
    /// Row indices of actor cash rows, rescaled after the build.
    pub cash_rows: Vec<usize>,
    /// Columns holding a cash variable (exempt from cash-row rescaling).
    pub cash_columns: FxHashSet<u32>,
    pub objective_scalar: f64,
    pub cash_scalar: f64,

    // registers
    coefficients: FxHashMap<u32, f64>,
    rhs_register: f64,
    pub(crate) cash_in_register: FxHashMap<u32, f64>,
    pub(crate) cash_out_register: FxHashMap<u32, f64>,
}

impl Tableau {
    pub fn new(column_count: u32) -> Self {
        Tableau {
            column_count,
            objective_scalar: 1.0,
            cash_scalar: 1.0,
            ..Default::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /* ─────────────────── register opcodes ─────────────────── */

    pub fn clear_coefficients(&mut self) {
        self.coefficients.clear();
        self.rhs_register = 0.0;
    }

    pub fn add_coefficient(&mut self, column: u32, value: f64) {
        if value != 0.0 {
            *self.coefficients.entry(column).or_insert(0.0) += value;
        }
    }

    pub fn add_rhs(&mut self, value: f64) {
        self.rhs_register += value;
    }

    /// Commit the register as a constraint row.
    pub fn add_constraint(&mut self, kind: RowType) -> usize {
        let row: FxHashMap<u32, f64> = self
            .coefficients
            .drain()
            .filter(|(_, v)| *v != 0.0)
            .collect();
        self.rows.push(row);
        self.rhs.push(self.rhs_register);
        self.row_types.push(kind);
        self.rhs_register = 0.0;
        self.rows.len() - 1
    }

    /// Commit the register as an actor cash row and record it for the
    /// post-build rescaling pass.
    pub fn add_cash_constraint(&mut self, kind: RowType, cash_column: u32) -> usize {
        let row = self.add_constraint(kind);
        self.cash_rows.push(row);
        self.cash_columns.insert(cash_column);
        row
    }

    /* ─────────────────── bounds and marks ─────────────────── */

    pub fn set_bounds(&mut self, column: u32, lb: f64, ub: f64) {
        self.lower.insert(column, lb);
        self.upper.insert(column, ub);
    }

    pub fn set_unbounded(&mut self, column: u32) {
        self.lower.insert(column, f64::NEG_INFINITY);
        self.upper.insert(column, f64::INFINITY);
    }

    pub fn mark_integer(&mut self, column: u32) {
        self.integers.insert(column);
    }

    pub fn mark_binary(&mut self, column: u32) {
        self.binaries.insert(column);
        self.set_bounds(column, 0.0, 1.0);
    }

    pub fn mark_semi_continuous(&mut self, column: u32) {
        self.semi_continuous.insert(column);
    }

    pub fn add_sos2(&mut self, columns: Vec<u32>) {
        self.sos2.push(columns);
    }

    pub fn add_objective(&mut self, column: u32, value: f64) {
        if value != 0.0 {
            *self.objective.entry(column).or_insert(0.0) += value;
        }
    }

    /* ─────────────────── scaling passes ─────────────────── */

    /// Scale the objective so its largest coefficient is 2; returns the
    /// applied scalar.
    pub fn scale_objective(&mut self) -> f64 {
        let m = self
            .objective
            .values()
            .map(|v| v.abs())
            .fold(0.0f64, f64::max);
        if m > 2.0 && m.is_finite() {
            let s = m / 2.0;
            for v in self.objective.values_mut() {
                *v /= s;
            }
            self.objective_scalar = s;
        }
        self.objective_scalar
    }

    /// Rescale the recorded cash rows so cash variables cannot dominate
    /// slack penalties; the cash variable's own ±1 coefficient is kept.
    pub fn scale_cash_rows(&mut self, scalar: f64) {
        if scalar <= 1.0 {
            return;
        }
        self.cash_scalar = scalar;
        for &r in &self.cash_rows {
            for (col, v) in self.rows[r].iter_mut() {
                if !self.cash_columns.contains(col) {
                    *v /= scalar;
                }
            }
            self.rhs[r] /= scalar;
        }
    }

    /// Largest absolute coefficient anywhere in the tableau; used by the
    /// serializer's numeric-envelope scan.
    pub fn max_abs_coefficient(&self) -> f64 {
        let mut m: f64 = 0.0;
        for row in &self.rows {
            for v in row.values() {
                m = m.max(v.abs());
            }
        }
        for v in self.objective.values() {
            m = m.max(v.abs());
        }
        for v in &self.rhs {
            m = m.max(v.abs());
        }
        m
    }

    /// Drop all accumulated state, keeping the allocation.
    pub fn reset(&mut self) {
        let cols = self.column_count;
        *self = Tableau::new(cols);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_commit_cycle() {
        let mut tab = Tableau::new(4);
        tab.clear_coefficients();
        tab.add_coefficient(1, 2.0);
        tab.add_coefficient(2, -1.0);
        tab.add_coefficient(2, 1.0); // cancels to zero, dropped on commit
        tab.add_rhs(5.0);
        let r = tab.add_constraint(RowType::Le);
        assert_eq!(r, 0);
        assert_eq!(tab.rows[0].get(&1), Some(&2.0));
        assert_eq!(tab.rows[0].get(&2), None);
        assert_eq!(tab.rhs[0], 5.0);
        assert_eq!(tab.row_types[0], RowType::Le);
        // register is clean afterwards
        let r = tab.add_constraint(RowType::Eq);
        assert!(tab.rows[r].is_empty());
        assert_eq!(tab.rhs[r], 0.0);
    }

    #[test]
    fn objective_scaling_rule() {
        let mut tab = Tableau::new(2);
        tab.add_objective(1, 10.0);
        tab.add_objective(2, -4.0);
        let s = tab.scale_objective();
        assert_eq!(s, 5.0);
        assert_eq!(tab.objective[&1], 2.0);
        assert_eq!(tab.objective[&2], -0.8);

        // small objectives stay untouched
        let mut tab = Tableau::new(1);
        tab.add_objective(1, 1.5);
        assert_eq!(tab.scale_objective(), 1.0);
        assert_eq!(tab.objective[&1], 1.5);
    }

    #[test]
    fn cash_row_scaling_spares_the_cash_column() {
        let mut tab = Tableau::new(3);
        tab.clear_coefficients();
        tab.add_coefficient(3, 1.0); // cash variable
        tab.add_coefficient(1, -1000.0);
        tab.add_cash_constraint(RowType::Eq, 3);
        tab.scale_cash_rows(1000.0);
        assert_eq!(tab.rows[0][&3], 1.0);
        assert_eq!(tab.rows[0][&1], -1.0);
        assert_eq!(tab.cash_scalar, 1000.0);
    }

    #[test]
    fn binary_marks_set_bounds() {
        let mut tab = Tableau::new(1);
        tab.mark_binary(1);
        assert_eq!(tab.lower[&1], 0.0);
        assert_eq!(tab.upper[&1], 1.0);
        assert!(tab.binaries.contains(&1));
    }
}
