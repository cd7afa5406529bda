//! Structural tests: variable allocation and emitted rows for one step.

use linnyr_eval::EvalContext;
use linnyr_milp::builder::{allocate, Exec, VarKind};
use linnyr_milp::tableau::RowType;
use linnyr_milp::{BoundLine, LinkMultiplier, Model, NodeId, SolverCaps};
use rustc_hash::FxHashMap;

fn one_step_exec<'m>(
    model: &'m Model,
    ctx: &'m EvalContext<'m>,
    alloc: &'m linnyr_milp::builder::Allocation,
    caps: SolverCaps,
    peaks: &'m FxHashMap<NodeId, f64>,
) -> Exec<'m> {
    let mut exec = Exec::new(model, ctx, alloc, caps, 1, 1, 1, 1, 1000.0, peaks, false);
    exec.run_step(0);
    exec
}

fn simple_model() -> Model {
    let mut m = Model::new();
    m.run.end_period = 1;
    let actor = linnyr_milp::ActorId(0);
    let p = m.add_process("plant", actor);
    m.set_process_bounds(p, "0", "10");
    let q = m.add_product("power");
    m.set_product_bounds(q, "0", "10");
    m.set_product_price(q, "1");
    m.connect(p.into(), q.into(), LinkMultiplier::Level, "1")
        .unwrap();
    m
}

#[test]
fn link_endpoint_rules_are_typed_errors() {
    let mut m = Model::new();
    let a = m.add_process("a", linnyr_milp::ActorId(0));
    let b = m.add_process("b", linnyr_milp::ActorId(0));
    assert!(m
        .connect(a.into(), b.into(), LinkMultiplier::Level, "1")
        .is_err());
    let q = m.add_product("q");
    let p = m.add_process("p", linnyr_milp::ActorId(0));
    assert!(m
        .connect(p.into(), q.into(), LinkMultiplier::Throughput, "1")
        .is_err());
    assert!(m
        .connect(q.into(), p.into(), LinkMultiplier::Startup, "1")
        .is_err());
    assert!(m
        .connect(q.into(), p.into(), LinkMultiplier::Level, "1")
        .is_ok());
}

#[test]
fn allocation_layout() {
    let m = simple_model();
    let alloc = allocate(&m, SolverCaps::default(), false);
    // default actor cash pair first, then plant level, then power level
    // plus its two slack columns
    assert_eq!(alloc.kinds[0], VarKind::CashIn(linnyr_milp::ActorId(0)));
    assert_eq!(alloc.kinds[1], VarKind::CashOut(linnyr_milp::ActorId(0)));
    assert!(alloc
        .kinds
        .iter()
        .any(|k| matches!(k, VarKind::Level(NodeId::Process(_)))));
    assert!(alloc.kinds.iter().any(|k| matches!(k, VarKind::SlackLe(_))));
    assert_eq!(alloc.cols as usize, alloc.kinds.len());
    assert_eq!(alloc.total_columns(), alloc.cols);
}

#[test]
fn inert_processes_are_skipped() {
    let mut m = simple_model();
    let dead = m.add_process("dead", linnyr_milp::ActorId(0));
    let alloc = allocate(&m, SolverCaps::default(), false);
    assert!(alloc.ignored.contains(&dead.0));
    assert!(!alloc
        .kinds
        .iter()
        .any(|k| *k == VarKind::Level(NodeId::Process(dead))));
}

#[test]
fn trivial_model_rows() {
    let m = simple_model();
    let alloc = allocate(&m, SolverCaps::default(), false);
    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    let tab = &exec.tab;
    // balance EQ, two slack bound rows, two cash EQ rows
    assert!(tab.row_types.contains(&RowType::Eq));
    assert_eq!(tab.cash_rows.len(), 2);
    // the process level column is bounded [0, 10]
    let level = alloc
        .kinds
        .iter()
        .position(|k| matches!(k, VarKind::Level(NodeId::Process(_))))
        .unwrap() as u32
        + 1;
    assert_eq!(tab.lower[&level], 0.0);
    assert_eq!(tab.upper[&level], 10.0);
    // the objective carries the actor weight on cash in/out
    assert_eq!(tab.objective[&1], 1.0);
    assert_eq!(tab.objective[&2], -1.0);
}

#[test]
fn on_off_binaries_for_positive_links() {
    let mut m = simple_model();
    let p = linnyr_milp::ProcessId(0);
    let q2 = m.add_product("status");
    m.products[1].is_data = true;
    m.products[1].no_slack = true;
    m.connect(p.into(), q2.into(), LinkMultiplier::Positive, "1")
        .unwrap();
    let alloc = allocate(&m, SolverCaps::default(), false);
    let vars = alloc.node(NodeId::Process(p));
    assert!(vars.on_off.is_some());
    assert!(vars.negative.is_none(), "LB ≥ 0 keeps the simple pair");

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    let on_col = vars.on_off.unwrap();
    assert!(exec.tab.binaries.contains(&on_col));
}

#[test]
fn nzp_partition_for_negative_levels() {
    let mut m = Model::new();
    let p = m.add_process("battery", linnyr_milp::ActorId(0));
    m.set_process_bounds(p, "-5", "10");
    let q = m.add_product("charge signal");
    m.products[0].no_slack = true;
    m.connect(p.into(), q.into(), LinkMultiplier::Negative, "1")
        .unwrap();
    m.run.end_period = 1;
    let alloc = allocate(&m, SolverCaps::default(), false);
    let vars = alloc.node(NodeId::Process(p)).clone();
    for v in [
        vars.on_off,
        vars.is_zero,
        vars.negative,
        vars.pos_level,
        vars.neg_level,
        vars.pos_eps,
        vars.neg_eps,
    ] {
        assert!(v.is_some());
    }

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    let tab = &exec.tab;
    // the partition identity row: L − POSL − PEP + NEP + NEGL = 0
    let level = vars.level;
    let identity = tab.rows.iter().zip(&tab.row_types).find(|(row, kind)| {
        **kind == RowType::Eq
            && row.get(&level) == Some(&1.0)
            && row.get(&vars.pos_level.unwrap()) == Some(&-1.0)
            && row.get(&vars.neg_level.unwrap()) == Some(&1.0)
    });
    assert!(identity.is_some(), "missing NZP identity row");
    // totalizer POS + NEG + OFF = 1
    let totalizer = tab
        .rows
        .iter()
        .enumerate()
        .find(|(i, row)| {
            tab.row_types[*i] == RowType::Eq
                && row.len() == 3
                && row.get(&vars.on_off.unwrap()) == Some(&1.0)
                && row.get(&vars.negative.unwrap()) == Some(&1.0)
                && row.get(&vars.is_zero.unwrap()) == Some(&1.0)
        })
        .map(|(i, _)| i);
    assert_eq!(totalizer.map(|i| tab.rhs[i]), Some(1.0));
    // and the POS + NEG ≤ 1 companion
    assert!(tab.rows.iter().enumerate().any(|(i, row)| {
        tab.row_types[i] == RowType::Le
            && row.len() == 2
            && row.get(&vars.on_off.unwrap()) == Some(&1.0)
            && row.get(&vars.negative.unwrap()) == Some(&1.0)
            && tab.rhs[i] == 1.0
    }));
}

#[test]
fn startup_constraints_link_across_steps() {
    let mut m = simple_model();
    let p = linnyr_milp::ProcessId(0);
    let q2 = m.add_product("fuel burn");
    m.products[1].no_slack = true;
    m.connect(p.into(), q2.into(), LinkMultiplier::Startup, "2")
        .unwrap();
    m.run.end_period = 2;
    m.run.block_length = 2;
    let alloc = allocate(&m, SolverCaps::default(), false);
    let vars = alloc.node(NodeId::Process(p)).clone();
    assert!(vars.startup.is_some() && vars.shutdown.is_some());

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let mut exec = Exec::new(
        &m,
        &ctx,
        &alloc,
        SolverCaps::default(),
        1,
        2,
        2,
        1,
        1000.0,
        &peaks,
        false,
    );
    exec.run_step(0);
    exec.run_step(1);
    // step 1 references POS of step 0 inside the chunk
    let on0 = vars.on_off.unwrap();
    let on1 = alloc.cols + on0;
    assert!(exec
        .tab
        .rows
        .iter()
        .any(|row| row.contains_key(&on0) && row.contains_key(&on1)));
}

#[test]
fn bound_line_with_sos_support() {
    let mut m = simple_model();
    let p2 = m.add_process("turbine", linnyr_milp::ActorId(0));
    m.set_process_bounds(p2, "0", "100");
    m.set_process_bounds(linnyr_milp::ProcessId(0), "0", "100");
    let line = BoundLine {
        kind: RowType::Le,
        points: vec![(0.0, 0.0), (50.0, 80.0), (100.0, 100.0)],
        needs_no_sos: false,
        no_slack: false,
    };
    m.add_constraint(
        "coupling",
        NodeId::Process(linnyr_milp::ProcessId(0)),
        p2.into(),
        vec![line],
    );
    let alloc = allocate(&m, SolverCaps::default(), false);
    let lv = alloc.lines[&(0, 0)].clone();
    assert_eq!(lv.weights.len(), 3);
    assert!(lv.binaries.is_empty(), "SOS-capable solver needs no binaries");

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    assert_eq!(exec.tab.sos2.len(), 1);
    assert_eq!(exec.tab.sos2[0].len(), 3);
    // Σw = 1 row present
    assert!(exec.tab.rows.iter().enumerate().any(|(i, row)| {
        exec.tab.row_types[i] == RowType::Eq
            && exec.tab.rhs[i] == 1.0
            && lv.weights.iter().all(|w| row.get(w) == Some(&1.0))
    }));
}

#[test]
fn bound_line_binary_emulation() {
    let mut m = simple_model();
    let p2 = m.add_process("turbine", linnyr_milp::ActorId(0));
    m.set_process_bounds(p2, "0", "100");
    let line = BoundLine {
        kind: RowType::Le,
        points: vec![(0.0, 0.0), (50.0, 80.0), (100.0, 100.0)],
        needs_no_sos: false,
        no_slack: false,
    };
    m.add_constraint(
        "coupling",
        NodeId::Process(linnyr_milp::ProcessId(0)),
        p2.into(),
        vec![line],
    );
    let caps = SolverCaps {
        sos: false,
        ..SolverCaps::default()
    };
    let alloc = allocate(&m, caps, false);
    let lv = alloc.lines[&(0, 0)].clone();
    // exactly one auxiliary binary per vertex
    assert_eq!(lv.binaries.len(), 3);

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, caps, &peaks);
    assert!(exec.tab.sos2.is_empty());
    for b in &lv.binaries {
        assert!(exec.tab.binaries.contains(b));
    }
    // the Σb ≤ 2 pairing row
    assert!(exec.tab.rows.iter().enumerate().any(|(i, row)| {
        exec.tab.row_types[i] == RowType::Le
            && exec.tab.rhs[i] == 2.0
            && lv.binaries.iter().all(|b| row.get(b) == Some(&1.0))
    }));
}

#[test]
fn kirchhoff_cycle_basis() {
    let mut m = Model::new();
    m.run.end_period = 1;
    let grid = m.add_grid("hv", 0.4, 0);
    let buses: Vec<_> = (0..3)
        .map(|i| {
            let q = m.add_product(&format!("bus {i}"));
            m.products[q.index()].no_slack = true;
            q
        })
        .collect();
    for i in 0..3 {
        let p = m.add_process(&format!("line {i}"), linnyr_milp::ActorId(0));
        m.set_process_bounds(p, "-100", "100");
        m.set_grid_process(p, grid, 10.0, [0.0; 3]);
        let a = buses[i];
        let b = buses[(i + 1) % 3];
        m.connect(a.into(), p.into(), LinkMultiplier::Level, "1")
            .unwrap();
        m.connect(p.into(), b.into(), LinkMultiplier::Level, "1")
            .unwrap();
    }
    let alloc = allocate(&m, SolverCaps::default(), false);
    // a triangle has exactly one fundamental cycle with three edges
    assert_eq!(alloc.cycles.len(), 1);
    assert_eq!(alloc.cycles[0].edges.len(), 3);

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    // one EQ row with ±length·reactance on the three line levels
    let levels: Vec<u32> = (0..3)
        .map(|i| alloc.node(NodeId::Process(linnyr_milp::ProcessId(i))).level)
        .collect();
    assert!(exec.tab.rows.iter().enumerate().any(|(i, row)| {
        exec.tab.row_types[i] == RowType::Eq
            && levels.iter().all(|l| {
                row.get(l)
                    .map(|v| (v.abs() - 4.0).abs() < 1e-9)
                    .unwrap_or(false)
            })
    }));
}

#[test]
fn peak_increase_chunk_columns() {
    let mut m = simple_model();
    let p = linnyr_milp::ProcessId(0);
    let q2 = m.add_product("capacity charge");
    m.products[1].is_data = true;
    m.products[1].no_slack = true;
    m.connect(p.into(), q2.into(), LinkMultiplier::PeakInc, "1")
        .unwrap();
    m.run.end_period = 4;
    m.run.block_length = 2;
    m.run.look_ahead = 1;
    let alloc = allocate(&m, SolverCaps::default(), false);
    let vars = alloc.node(NodeId::Process(p)).clone();
    let (bpi, cpi) = (vars.block_peak.unwrap(), vars.la_peak.unwrap());
    // chunk columns sit after all per-step blocks
    assert!(bpi > alloc.cols * 3);
    assert_eq!(cpi, bpi + 1);

    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let mut exec = Exec::new(
        &m,
        &ctx,
        &alloc,
        SolverCaps::default(),
        1,
        2,
        3,
        1,
        1000.0,
        &peaks,
        false,
    );
    for t in 0..3 {
        exec.run_step(t);
    }
    // within the block: L − BPI ≤ prior; in look-ahead also −CPI
    let with_bpi = exec
        .tab
        .rows
        .iter()
        .filter(|r| r.get(&bpi) == Some(&-1.0))
        .count();
    assert_eq!(with_bpi, 3);
    let with_cpi = exec
        .tab
        .rows
        .iter()
        .filter(|r| r.get(&cpi) == Some(&-1.0))
        .count();
    assert_eq!(with_cpi, 1);
}

#[test]
fn delay_before_chunk_folds_into_rhs() {
    let mut m = simple_model();
    let link = linnyr_milp::LinkId(0);
    m.set_link_delay(link, "1");
    m.run.end_period = 4;
    m.run.block_length = 2;
    // pretend block 1 solved the process at level 7
    m.reset_results();
    m.set_node_level(NodeId::Process(linnyr_milp::ProcessId(0)), 2, linnyr_milp::Value::number(7.0));

    let alloc = allocate(&m, SolverCaps::default(), false);
    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let mut exec = Exec::new(
        &m,
        &ctx,
        &alloc,
        SolverCaps::default(),
        3,
        2,
        2,
        1,
        1000.0,
        &peaks,
        false,
    );
    exec.run_step(0);
    // the product balance at t=3 consumes L_plant(2) = 7, already solved:
    // the term lands in the RHS of the balance row
    let q_level = alloc.node(NodeId::Product(linnyr_milp::ProductId(0))).level;
    let balance = exec
        .tab
        .rows
        .iter()
        .enumerate()
        .find(|(i, row)| {
            exec.tab.row_types[*i] == RowType::Eq && row.get(&q_level) == Some(&1.0)
        })
        .map(|(i, _)| i)
        .expect("balance row");
    assert_eq!(exec.tab.rhs[balance], 7.0);
}

#[test]
fn negative_delay_beyond_chunk_drops_term() {
    let mut m = simple_model();
    let link = linnyr_milp::LinkId(0);
    m.set_link_delay(link, "-1");
    m.run.end_period = 1;
    let alloc = allocate(&m, SolverCaps::default(), false);
    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    // chunk is a single step; the inflow at t+1 cannot be represented
    let plant = alloc.node(NodeId::Process(linnyr_milp::ProcessId(0))).level;
    let q_level = alloc.node(NodeId::Product(linnyr_milp::ProductId(0))).level;
    let balance = exec
        .tab
        .rows
        .iter()
        .enumerate()
        .find(|(i, row)| {
            exec.tab.row_types[*i] == RowType::Eq && row.get(&q_level) == Some(&1.0)
        })
        .map(|(i, _)| i)
        .expect("balance row");
    assert!(!exec.tab.rows[balance].contains_key(&plant));
    assert_eq!(exec.tab.rhs[balance], 0.0);
}

#[test]
fn equal_bounds_give_single_eq_row() {
    let mut m = simple_model();
    let q = linnyr_milp::ProductId(0);
    m.set_product_bounds(q, "5", "5");
    m.products[q.index()].equal_bounds = true;
    let alloc = allocate(&m, SolverCaps::default(), false);
    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let exec = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    let q_level = alloc.node(NodeId::Product(q)).level;
    let bound_rows: Vec<usize> = exec
        .tab
        .rows
        .iter()
        .enumerate()
        .filter(|(i, row)| {
            row.get(&q_level) == Some(&1.0) && exec.tab.rhs[*i] == 5.0
        })
        .map(|(i, _)| i)
        .collect();
    assert_eq!(bound_rows.len(), 1);
    assert_eq!(exec.tab.row_types[bound_rows[0]], RowType::Eq);
}

#[test]
fn bound_line_rows_are_idempotent() {
    let mut m = simple_model();
    let p2 = m.add_process("turbine", linnyr_milp::ActorId(0));
    m.set_process_bounds(p2, "0", "100");
    let line = BoundLine {
        kind: RowType::Le,
        points: vec![(0.0, 0.0), (100.0, 100.0)],
        needs_no_sos: true,
        no_slack: true,
    };
    m.add_constraint(
        "coupling",
        NodeId::Process(linnyr_milp::ProcessId(0)),
        p2.into(),
        vec![line],
    );
    let alloc = allocate(&m, SolverCaps::default(), false);
    let ctx = EvalContext::new(&m, m.sim_span());
    let peaks = FxHashMap::default();
    let a = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    let b = one_step_exec(&m, &ctx, &alloc, SolverCaps::default(), &peaks);
    assert_eq!(a.tab.row_count(), b.tab.row_count());
    for (ra, rb) in a.tab.rows.iter().zip(&b.tab.rows) {
        let mut va: Vec<_> = ra.iter().collect();
        let mut vb: Vec<_> = rb.iter().collect();
        va.sort_by_key(|(c, _)| **c);
        vb.sort_by_key(|(c, _)| **c);
        assert_eq!(va, vb);
    }
}
