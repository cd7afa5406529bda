//! End-to-end runs through the orchestrator with a scripted adapter.

use linnyr_eval::EvalContext;
use linnyr_milp::builder::{allocate, VarKind};
use linnyr_milp::{
    ActorId, LinkMultiplier, Model, NodeId, ProcessId, ProductId, ScriptedSolver, Solve,
    SolverCaps, Value,
};

fn trivial_model(end: u32, block_length: u32, look_ahead: u32) -> Model {
    let mut m = Model::new();
    m.run.end_period = end;
    m.run.block_length = block_length;
    m.run.look_ahead = look_ahead;
    let p = m.add_process("plant", ActorId(0));
    m.set_process_bounds(p, "0", "10");
    let q = m.add_product("power");
    m.set_product_bounds(q, "0", "10");
    m.set_product_price(q, "1");
    m.connect(p.into(), q.into(), LinkMultiplier::Level, "1")
        .unwrap();
    m
}

/// A scripted primal vector with the given per-step values.
fn primal(m: &Model, steps: u32, per_step: &[(VarKind, f64)]) -> Vec<f64> {
    let alloc = allocate(m, SolverCaps::default(), false);
    let mut x = vec![0.0; alloc.total_columns() as usize];
    for t in 0..steps {
        for (kind, v) in per_step {
            let vi = alloc.kinds.iter().position(|k| k == kind).unwrap() as u32 + 1;
            x[(t * alloc.cols + vi - 1) as usize] = *v;
        }
    }
    x
}

#[test]
fn trivial_run_decodes_levels_and_cash() {
    let mut m = trivial_model(3, 3, 0);
    let plant = NodeId::Process(ProcessId(0));
    let power = NodeId::Product(ProductId(0));
    let x = primal(
        &m,
        3,
        &[
            (VarKind::CashIn(ActorId(0)), 10.0),
            (VarKind::Level(plant), 10.0),
            (VarKind::Level(power), 10.0),
        ],
    );
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x));

    let outcome = Solve::new(&mut m, &mut solver).run().unwrap();
    assert_eq!(outcome.blocks.len(), 1);
    assert_eq!(outcome.blocks[0].status, 0);
    assert!(outcome.issue_list().is_empty(), "{:?}", outcome.issue_list());

    for t in 1..=3 {
        assert_eq!(m.processes[0].level[t], Value::number(10.0));
        assert_eq!(m.actors[0].cash_in[t], Value::number(10.0));
        assert_eq!(m.actors[0].cash_flow[t], Value::number(10.0));
        assert_eq!(m.links[0].flow[t], Value::number(10.0));
    }
    // the submitted text was LP_solve-dialect
    assert!(solver.received[0].contains("max:"));
    assert!(solver.received[0].contains("R1:"));
    // the slack penalty forced an objective rescale
    assert!(outcome.blocks[0].objective_scalar > 1.0);
}

#[test]
fn cash_identity_holds_for_the_block() {
    let mut m = trivial_model(3, 3, 0);
    let plant = NodeId::Process(ProcessId(0));
    let power = NodeId::Product(ProductId(0));
    let x = primal(
        &m,
        3,
        &[
            (VarKind::CashIn(ActorId(0)), 10.0),
            (VarKind::Level(plant), 10.0),
            (VarKind::Level(power), 10.0),
        ],
    );
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x));
    let outcome = Solve::new(&mut m, &mut solver).run().unwrap();
    let scalar = outcome.blocks[0].cash_scalar;

    let mut net_cash = 0.0;
    let mut traded = 0.0;
    for t in 1..=3usize {
        let cin = m.actors[0].cash_in[t].finite().unwrap();
        let cout = m.actors[0].cash_out[t].finite().unwrap();
        net_cash += cin - cout;
        // price 1 × rate 1 × flow
        traded += m.links[0].flow[t].finite().unwrap();
    }
    assert!((net_cash - traded).abs() <= 1e-4 * scalar.max(1.0));
}

#[test]
fn failed_block_retains_look_ahead_values() {
    let mut m = trivial_model(10, 4, 2);
    let plant = NodeId::Process(ProcessId(0));
    let power = NodeId::Product(ProductId(0));
    let x = primal(
        &m,
        6,
        &[
            (VarKind::Level(plant), 5.0),
            (VarKind::Level(power), 5.0),
            (VarKind::CashIn(ActorId(0)), 5.0),
        ],
    );
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x));
    solver.push(ScriptedSolver::failed(2, "infeasible"));

    let outcome = Solve::new(&mut m, &mut solver).run().unwrap();
    assert_eq!(outcome.blocks.len(), 2);
    assert_eq!(outcome.blocks[0].status, 0);
    assert_eq!(outcome.blocks[1].status, 2);
    assert!(!outcome.issue_list().is_empty());

    // block 1 kept steps 1..4 and look-ahead 5..6; the failed second
    // block must not overwrite the look-ahead values
    for t in 1..=6 {
        assert_eq!(m.processes[0].level[t], Value::number(5.0), "t={t}");
    }
    for t in 7..=10 {
        assert_eq!(m.processes[0].level[t], Value::NOT_COMPUTED, "t={t}");
    }
}

#[test]
fn halt_flag_stops_before_next_block() {
    use std::sync::atomic::{AtomicBool, Ordering};
    let mut m = trivial_model(10, 4, 2);
    let plant = NodeId::Process(ProcessId(0));
    let x = primal(&m, 6, &[(VarKind::Level(plant), 5.0)]);
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x));
    let halt = AtomicBool::new(false);
    // halted before the run starts: no block is attempted
    halt.store(true, Ordering::Relaxed);
    let outcome = Solve::new(&mut m, &mut solver).with_halt(&halt).run().unwrap();
    assert!(outcome.halted);
    assert!(outcome.blocks.is_empty());
    assert!(solver.received.is_empty());
}

#[test]
fn dynamic_level_reference_reads_prior_step() {
    let mut m = trivial_model(5, 5, 0);
    m.add_dataset("d", 5.0);
    let e = m.add_dataset("e", 0.0);
    m.add_modifier(e, "m", "[plant|L@t-1] + [d]");
    m.reset_results();

    let ctx = EvalContext::new(&m, m.sim_span());
    let expr = &m.datasets[1].modifiers[0].expression;
    // classified dynamic, evaluated before any solve: L[4] reads as 0
    assert_eq!(expr.result_at(&ctx, 5), Value::number(5.0));
    assert!(!expr.is_static());
    drop(ctx);

    m.set_node_level(NodeId::Process(ProcessId(0)), 4, Value::number(3.0));
    m.datasets[1].modifiers[0].expression.invalidate_from(0);
    let ctx = EvalContext::new(&m, m.sim_span());
    assert_eq!(
        m.datasets[1].modifiers[0].expression.result_at(&ctx, 5),
        Value::number(8.0)
    );
}

#[test]
fn license_expiry_is_counted_separately() {
    let mut m = trivial_model(3, 3, 0);
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    let mut failed = ScriptedSolver::failed(7, "solver license expired");
    failed.solution_available = false;
    solver.push(failed);
    let outcome = Solve::new(&mut m, &mut solver).run().unwrap();
    assert_eq!(outcome.license_expired_count, 1);
    assert_eq!(outcome.blocks[0].status, 7);
}

#[test]
fn round_sequence_runs_per_block() {
    let mut m = trivial_model(3, 3, 0);
    m.run.rounds = 2;
    m.run.round_sequence = "ab".into();
    let plant = NodeId::Process(ProcessId(0));
    let x = primal(&m, 3, &[(VarKind::Level(plant), 10.0)]);
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x.clone()));
    solver.push(ScriptedSolver::solved(x));
    let outcome = Solve::new(&mut m, &mut solver).run().unwrap();
    assert_eq!(solver.received.len(), 2);
    assert_eq!(outcome.blocks.len(), 1);
    assert!(solver.received[0].contains("round a"));
    assert!(solver.received[1].contains("round b"));
}

#[test]
fn near_zero_levels_snap_to_zero() {
    let mut m = trivial_model(1, 1, 0);
    let plant = NodeId::Process(ProcessId(0));
    let x = primal(&m, 1, &[(VarKind::Level(plant), 1e-4)]);
    let mut solver = ScriptedSolver::new(SolverCaps::default());
    solver.push(ScriptedSolver::solved(x));
    Solve::new(&mut m, &mut solver).run().unwrap();
    assert_eq!(m.processes[0].level[1], Value::ZERO);
}
