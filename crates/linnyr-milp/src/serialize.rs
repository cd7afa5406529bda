//! Tableau serialization: LP_solve-style LP, CPLEX-style LP, and
//! fixed-field MPS.
//!
//! Before any text is produced every coefficient, RHS entry, and finite
//! bound is scanned against the solver's numeric envelope; a violation
//! aborts the block with a descriptive `numeric_issue`.

use crate::solver::SolverCaps;
use crate::tableau::{RowType, Tableau};
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LpDialect {
    /// Column-based LP with `max:`, `;`-terminated constraints, and
    /// `int`/`sec`/`sos2` sections.
    LpSolve,
    /// `Maximize / Subject To / Bounds / Binary / General /
    /// Semi-continuous / SOS / End`.
    Cplex,
    /// Fixed-field MPS with an `OBJSENSE MAX` header and an `S2` SOS
    /// section.
    Mps,
}

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("numeric issue: {0}")]
    Numeric(String),
}

fn col_name(col: u32, width: usize) -> String {
    format!("X{col:0width$}")
}

fn name_width(tab: &Tableau) -> usize {
    tab.column_count.max(1).to_string().len().max(6)
}

/// Scan the tableau against the solver's numeric envelope. `cols` is the
/// per-step column count, used to report the step a column belongs to.
fn numeric_scan(tab: &Tableau, caps: SolverCaps, cols: u32) -> Result<(), SerializeError> {
    let width = name_width(tab);
    let bt = |col: u32| {
        if cols == 0 {
            0
        } else {
            (col - 1) / cols
        }
    };
    let check = |v: f64, what: &str, col: u32, kind: &str| -> Result<(), SerializeError> {
        if v.is_nan() || (v.is_finite() && v.abs() > caps.infinity) {
            return Err(SerializeError::Numeric(format!(
                "{what} {v:e} for {} ({kind}, bt={})",
                col_name(col, width),
                bt(col)
            )));
        }
        Ok(())
    };
    for (row, coeffs) in tab.rows.iter().enumerate() {
        for (col, v) in coeffs {
            check(*v, "coefficient", *col, &tab.row_types[row].to_string())?;
        }
        if !tab.rhs[row].is_finite() || tab.rhs[row].abs() > caps.infinity {
            return Err(SerializeError::Numeric(format!(
                "RHS {:e} for row {} ({})",
                tab.rhs[row],
                row + 1,
                tab.row_types[row]
            )));
        }
    }
    for (col, v) in &tab.objective {
        check(*v, "objective coefficient", *col, "obj")?;
    }
    for (col, v) in tab.lower.iter().chain(tab.upper.iter()) {
        if v.is_finite() {
            check(*v, "bound", *col, "bound")?;
        }
    }
    Ok(())
}

fn effective_bounds(tab: &Tableau, col: u32) -> (f64, f64) {
    let lb = tab.lower.get(&col).copied().unwrap_or(0.0);
    let ub = tab.upper.get(&col).copied().unwrap_or(f64::INFINITY);
    (lb, ub)
}

fn sorted(coeffs: &rustc_hash::FxHashMap<u32, f64>) -> Vec<(u32, f64)> {
    let mut v: Vec<(u32, f64)> = coeffs.iter().map(|(c, x)| (*c, *x)).collect();
    v.sort_unstable_by_key(|(c, _)| *c);
    v
}

/// Serialize `tab` in the dialect the solver expects.
pub fn serialize(
    tab: &Tableau,
    caps: SolverCaps,
    cols: u32,
    block: u32,
    round: char,
) -> Result<String, SerializeError> {
    numeric_scan(tab, caps, cols)?;
    Ok(match caps.dialect {
        LpDialect::LpSolve => write_lp_solve(tab, caps, block, round),
        LpDialect::Cplex => write_cplex(tab, caps, block, round),
        LpDialect::Mps => write_mps(tab, caps, block, round),
    })
}

/* ───────────────────────── LP_solve ───────────────────────── */

fn write_lp_solve(tab: &Tableau, caps: SolverCaps, block: u32, round: char) -> String {
    let w = name_width(tab);
    let inf = caps.infinity;
    let mut out = String::new();
    let _ = writeln!(out, "/* Block {block}, round {round} */");
    out.push_str("max: ");
    for (col, v) in sorted(&tab.objective) {
        let _ = write!(out, "{v:+} {} ", col_name(col, w));
    }
    out.push_str(";\n\n");
    for (i, row) in tab.rows.iter().enumerate() {
        let _ = write!(out, "R{}: ", i + 1);
        for (col, v) in sorted(row) {
            let _ = write!(out, "{v:+} {} ", col_name(col, w));
        }
        let _ = writeln!(out, "{} {};", tab.row_types[i], tab.rhs[i]);
    }
    out.push('\n');
    for col in 1..=tab.column_count {
        if tab.binaries.contains(&col) {
            continue;
        }
        let (lb, ub) = effective_bounds(tab, col);
        if lb == 0.0 && ub == f64::INFINITY {
            continue;
        }
        if lb == f64::NEG_INFINITY && ub == f64::INFINITY {
            let _ = writeln!(out, "free {};", col_name(col, w));
            continue;
        }
        let lo = if lb == f64::NEG_INFINITY { -inf } else { lb };
        let hi = if ub == f64::INFINITY { inf } else { ub };
        let _ = writeln!(out, "{lo} <= {} <= {hi};", col_name(col, w));
    }
    section_list(&mut out, "int", &tab.integers, w);
    section_list(&mut out, "bin", &tab.binaries, w);
    section_list(&mut out, "sec", &tab.semi_continuous, w);
    if !tab.sos2.is_empty() {
        out.push_str("\nsos2\n");
        for (i, group) in tab.sos2.iter().enumerate() {
            let _ = write!(out, "SOS{}: ", i + 1);
            let members: Vec<String> = group
                .iter()
                .enumerate()
                .map(|(k, col)| format!("{}:{}", col_name(*col, w), k + 1))
                .collect();
            let _ = writeln!(out, "{};", members.join(","));
        }
    }
    out
}

fn section_list(out: &mut String, keyword: &str, set: &rustc_hash::FxHashSet<u32>, w: usize) {
    if set.is_empty() {
        return;
    }
    let mut cols: Vec<u32> = set.iter().copied().collect();
    cols.sort_unstable();
    let names: Vec<String> = cols.into_iter().map(|c| col_name(c, w)).collect();
    let _ = writeln!(out, "{keyword} {};", names.join(","));
}

/* ───────────────────────── CPLEX LP ───────────────────────── */

fn write_cplex(tab: &Tableau, caps: SolverCaps, block: u32, round: char) -> String {
    let w = name_width(tab);
    let inf = caps.infinity;
    let mut out = String::new();
    let _ = writeln!(out, "\\ Block {block}, round {round}");
    out.push_str("Maximize\n obj:");
    for (col, v) in sorted(&tab.objective) {
        let _ = write!(out, " {v:+} {}", col_name(col, w));
    }
    out.push_str("\nSubject To\n");
    for (i, row) in tab.rows.iter().enumerate() {
        let _ = write!(out, " R{}:", i + 1);
        for (col, v) in sorted(row) {
            let _ = write!(out, " {v:+} {}", col_name(col, w));
        }
        let _ = writeln!(out, " {} {}", tab.row_types[i], tab.rhs[i]);
    }
    out.push_str("Bounds\n");
    for col in 1..=tab.column_count {
        if tab.binaries.contains(&col) {
            continue;
        }
        let (lb, ub) = effective_bounds(tab, col);
        if lb == 0.0 && ub == f64::INFINITY {
            continue;
        }
        if lb == f64::NEG_INFINITY && ub == f64::INFINITY {
            let _ = writeln!(out, " {} free", col_name(col, w));
            continue;
        }
        let lo = if lb == f64::NEG_INFINITY { -inf } else { lb };
        let hi = if ub == f64::INFINITY { inf } else { ub };
        let _ = writeln!(out, " {lo} <= {} <= {hi}", col_name(col, w));
    }
    if !tab.binaries.is_empty() {
        out.push_str("Binary\n");
        let mut cols: Vec<u32> = tab.binaries.iter().copied().collect();
        cols.sort_unstable();
        for c in cols {
            let _ = writeln!(out, " {}", col_name(c, w));
        }
    }
    if !tab.integers.is_empty() {
        out.push_str("General\n");
        let mut cols: Vec<u32> = tab.integers.iter().copied().collect();
        cols.sort_unstable();
        for c in cols {
            let _ = writeln!(out, " {}", col_name(c, w));
        }
    }
    if !tab.semi_continuous.is_empty() {
        out.push_str("Semi-continuous\n");
        let mut cols: Vec<u32> = tab.semi_continuous.iter().copied().collect();
        cols.sort_unstable();
        for c in cols {
            let _ = writeln!(out, " {}", col_name(c, w));
        }
    }
    if !tab.sos2.is_empty() {
        out.push_str("SOS\n");
        for (i, group) in tab.sos2.iter().enumerate() {
            let _ = write!(out, " s{}: S2::", i + 1);
            for (k, col) in group.iter().enumerate() {
                let _ = write!(out, " {}:{}", col_name(*col, w), k + 1);
            }
            out.push('\n');
        }
    }
    out.push_str("End\n");
    out
}

/* ───────────────────────── MPS ───────────────────────── */

fn write_mps(tab: &Tableau, caps: SolverCaps, block: u32, round: char) -> String {
    let w = name_width(tab);
    let inf = caps.infinity;
    let mut out = String::new();
    let _ = writeln!(out, "NAME          block_{block}_{round}");
    out.push_str("OBJSENSE\n    MAX\nROWS\n N  OBJ\n");
    for (i, kind) in tab.row_types.iter().enumerate() {
        let marker = match kind {
            RowType::Le => 'L',
            RowType::Ge => 'G',
            RowType::Eq => 'E',
        };
        let _ = writeln!(out, " {marker}  R{}", i + 1);
    }
    out.push_str("COLUMNS\n");
    // column-major entries; integer runs are wrapped in INTORG/INTEND
    let mut by_col: Vec<Vec<(String, f64)>> = vec![Vec::new(); tab.column_count as usize + 1];
    for (col, v) in &tab.objective {
        by_col[*col as usize].push(("OBJ".into(), *v));
    }
    for (i, row) in tab.rows.iter().enumerate() {
        for (col, v) in row {
            by_col[*col as usize].push((format!("R{}", i + 1), *v));
        }
    }
    let mut in_int = false;
    let mut marker_nr = 0;
    for col in 1..=tab.column_count {
        let entries = &by_col[col as usize];
        if entries.is_empty() {
            continue;
        }
        let integral = tab.integers.contains(&col) || tab.binaries.contains(&col);
        if integral != in_int {
            marker_nr += 1;
            let kind = if integral { "'INTORG'" } else { "'INTEND'" };
            let _ = writeln!(
                out,
                "    MARKER{marker_nr:<7} 'MARKER'                 {kind}"
            );
            in_int = integral;
        }
        let name = col_name(col, w);
        for pair in entries.chunks(2) {
            let _ = write!(out, "    {name:<9}");
            for (row, v) in pair {
                let _ = write!(out, " {row:<9} {v:<12}");
            }
            out.push('\n');
        }
    }
    if in_int {
        marker_nr += 1;
        let _ = writeln!(
            out,
            "    MARKER{marker_nr:<7} 'MARKER'                 'INTEND'"
        );
    }
    out.push_str("RHS\n");
    for (i, v) in tab.rhs.iter().enumerate() {
        if *v != 0.0 {
            let _ = writeln!(out, "    RHS       R{:<8} {v}", i + 1);
        }
    }
    out.push_str("BOUNDS\n");
    for col in 1..=tab.column_count {
        let name = col_name(col, w);
        if tab.binaries.contains(&col) {
            let _ = writeln!(out, " BV BND       {name}");
            continue;
        }
        if tab.semi_continuous.contains(&col) {
            let (_, ub) = effective_bounds(tab, col);
            let hi = if ub == f64::INFINITY { inf } else { ub };
            let _ = writeln!(out, " SC BND       {name:<9} {hi}");
            continue;
        }
        let (lb, ub) = effective_bounds(tab, col);
        if lb == 0.0 && ub == f64::INFINITY {
            continue;
        }
        if lb == f64::NEG_INFINITY && ub == f64::INFINITY {
            let _ = writeln!(out, " FR BND       {name}");
            continue;
        }
        if lb == ub {
            let _ = writeln!(out, " FX BND       {name:<9} {lb}");
            continue;
        }
        if lb != 0.0 {
            let lo = if lb == f64::NEG_INFINITY { -inf } else { lb };
            let _ = writeln!(out, " LO BND       {name:<9} {lo}");
        }
        if ub != f64::INFINITY {
            let _ = writeln!(out, " UP BND       {name:<9} {ub}");
        }
    }
    if !tab.sos2.is_empty() {
        out.push_str("SOS\n");
        for (i, group) in tab.sos2.iter().enumerate() {
            let _ = writeln!(out, " S2 SOS       sos{:<6} {}", i + 1, i + 1);
            for (k, col) in group.iter().enumerate() {
                let _ = writeln!(out, "    {:<9} {}", col_name(*col, w), k + 1);
            }
        }
    }
    out.push_str("ENDATA\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tableau {
        let mut tab = Tableau::new(6);
        tab.add_objective(1, 3.0);
        tab.add_objective(2, -1.0);
        tab.clear_coefficients();
        tab.add_coefficient(1, 1.0);
        tab.add_coefficient(2, 2.0);
        tab.add_rhs(10.0);
        tab.add_constraint(RowType::Le);
        tab.clear_coefficients();
        tab.add_coefficient(3, 1.0);
        tab.add_constraint(RowType::Eq);
        tab.clear_coefficients();
        tab.add_coefficient(4, 1.0);
        tab.add_coefficient(5, 1.0);
        tab.add_coefficient(6, 1.0);
        tab.add_rhs(3.0);
        tab.add_constraint(RowType::Le);
        tab.set_bounds(1, 0.0, 10.0);
        tab.set_unbounded(3);
        tab.mark_binary(4);
        tab.mark_integer(5);
        tab.mark_semi_continuous(6);
        tab.set_bounds(6, 2.0, 8.0);
        tab.add_sos2(vec![1, 2, 3]);
        tab
    }

    fn caps(dialect: LpDialect) -> SolverCaps {
        SolverCaps {
            dialect,
            ..SolverCaps::default()
        }
    }

    #[test]
    fn lp_solve_sections() {
        let text = serialize(&sample(), caps(LpDialect::LpSolve), 6, 1, 'a').unwrap();
        assert!(text.starts_with("/* Block 1, round a */"));
        assert!(text.contains("max: +3 X000001 -1 X000002 ;"));
        assert!(text.contains("R1: +1 X000001 +2 X000002 <= 10;"));
        assert!(text.contains("free X000003;"));
        assert!(text.contains("int X000005;"));
        assert!(text.contains("bin X000004;"));
        assert!(text.contains("sec X000006;"));
        assert!(text.contains("sos2"));
        assert!(text.contains("SOS1: X000001:1,X000002:2,X000003:3;"));
    }

    #[test]
    fn cplex_sections_in_order() {
        let text = serialize(&sample(), caps(LpDialect::Cplex), 6, 2, 'b').unwrap();
        let order = [
            "Maximize",
            "Subject To",
            "Bounds",
            "Binary",
            "General",
            "Semi-continuous",
            "SOS",
            "End",
        ];
        let mut pos = 0;
        for section in order {
            let at = text[pos..].find(section).unwrap_or_else(|| {
                panic!("missing section {section}");
            });
            pos += at;
        }
        assert!(text.contains(" s1: S2:: X000001:1 X000002:2 X000003:3"));
    }

    #[test]
    fn mps_rows_and_bounds() {
        let text = serialize(&sample(), caps(LpDialect::Mps), 6, 1, 'a').unwrap();
        assert!(text.contains("OBJSENSE"));
        assert!(text.contains(" L  R1"));
        assert!(text.contains(" E  R2"));
        assert!(text.contains(" BV BND       X000004"));
        assert!(text.contains(" SC BND       X000006"));
        assert!(text.contains(" FR BND       X000003"));
        assert!(text.contains(" UP BND       X000001"));
        assert!(text.contains(" S2 SOS"));
        assert!(text.contains("'INTORG'"));
        assert!(text.trim_end().ends_with("ENDATA"));
    }

    #[test]
    fn every_binary_listed_once() {
        // round-trip check on the Binary section of the CPLEX dialect
        let mut tab = sample();
        tab.mark_binary(2);
        let text = serialize(&tab, caps(LpDialect::Cplex), 6, 1, 'a').unwrap();
        let binary = text
            .split("Binary\n")
            .nth(1)
            .unwrap()
            .split("General")
            .next()
            .unwrap();
        for col in ["X000002", "X000004"] {
            assert_eq!(binary.matches(col).count(), 1, "{col}");
        }
        // every SOS group is declared S2
        let sos = text.split("SOS\n").nth(1).unwrap();
        assert!(sos.lines().next().unwrap().contains("S2::"));
    }

    #[test]
    fn numeric_envelope_aborts() {
        let mut tab = Tableau::new(2);
        tab.clear_coefficients();
        tab.add_coefficient(1, 1e20);
        tab.add_constraint(RowType::Le);
        let err = serialize(&tab, caps(LpDialect::LpSolve), 2, 1, 'a').unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("numeric issue"), "{msg}");
        assert!(msg.contains("X000001"), "{msg}");
    }
}
