//! The operand-stack interpreter.
//!
//! One `match` per instruction; exceptional values propagate through the
//! stack by severity instead of unwinding. The two pop modes differ only
//! in how `Undefined` is treated: `pop_strict` promotes it like an error,
//! `pop_lax` lets it through (used by `|`, group flattening, and the
//! reducers' skip rule).

use crate::context::EvalContext;
use crate::expression::Expression;
use linnyr_common::{ErrorKind, Region, Value, NEAR_ZERO};
use linnyr_parse::{Instr, Symbol, VarSpec};
use rand::distributions::Distribution;
use rand::Rng;
use rand_distr::{Binomial, Exp, Normal, Poisson, Triangular, Weibull};
use smallvec::SmallVec;

enum Operand {
    Scalar(Value),
    Group(Vec<Value>),
}

struct Machine<'a, 'm> {
    stack: SmallVec<[Operand; 8]>,
    ctx: &'a EvalContext<'m>,
    expr: &'a Expression,
    t: i32,
    wildcard: Option<i32>,
}

/// Execute `code` for `expr` at step `t`. Never panics; underflow and a
/// non-singleton final stack surface as `#STACK-!` / `#STACK+!`.
pub(crate) fn execute(
    expr: &Expression,
    code: &[Instr],
    ctx: &EvalContext,
    t: i32,
    wildcard: Option<i32>,
) -> Value {
    Machine {
        stack: SmallVec::new(),
        ctx,
        expr,
        t,
        wildcard,
    }
    .run(code)
}

impl<'a, 'm> Machine<'a, 'm> {
    fn run(&mut self, code: &[Instr]) -> Value {
        let mut pc = 0usize;
        while pc < code.len() {
            let instr = &code[pc];
            pc += 1;
            let outcome = match instr {
                Instr::Push(v) => {
                    self.stack.push(Operand::Scalar(*v));
                    Ok(())
                }
                Instr::Sym(s) => {
                    let v = self.symbol(*s);
                    self.stack.push(Operand::Scalar(v));
                    Ok(())
                }
                Instr::Unit(u) => {
                    let v = self.ctx.model.unit_multiplier(u);
                    self.stack.push(Operand::Scalar(v));
                    Ok(())
                }
                Instr::Ref(spec) => {
                    let v = self.reference(spec);
                    self.stack.push(Operand::Scalar(v));
                    Ok(())
                }
                Instr::JumpIfFalse(addr) => match self.pop_strict() {
                    Err(e) => return e,
                    Ok(cond) => {
                        if truthy(cond) != Some(true) {
                            pc = *addr;
                        }
                        Ok(())
                    }
                },
                Instr::Jump(addr) => {
                    pc = *addr;
                    Ok(())
                }
                Instr::Concat => self.concat(),
                Instr::At => self.at(),
                Instr::Replace => self.replace(),
                Instr::And | Instr::Or => self.logic(instr),
                Instr::Not => self.monadic(|x| if x == 0.0 { 1.0 } else { 0.0 }),
                Instr::Negate => self.monadic(|x| -x),
                Instr::Abs => self.monadic(f64::abs),
                Instr::Sin => self.monadic(f64::sin),
                Instr::Cos => self.monadic(f64::cos),
                Instr::Atan => self.monadic(f64::atan),
                Instr::Ln => self.monadic(f64::ln),
                Instr::Exp => self.monadic(f64::exp),
                Instr::Sqrt => self.monadic(f64::sqrt),
                Instr::Round => self.monadic(f64::round),
                Instr::Int => self.monadic(f64::trunc),
                Instr::Fract => self.monadic(f64::fract),
                i if i.is_reducing() => self.reduce(i),
                dyadic => self.dyadic(dyadic),
            };
            if let Err(e) = outcome {
                self.stack.push(Operand::Scalar(e));
            }
        }
        match self.stack.len() {
            1 => match self.stack.pop().unwrap() {
                Operand::Scalar(v) => v,
                Operand::Group(_) => Value::error(ErrorKind::Invalid),
            },
            0 => Value::error(ErrorKind::Underflow),
            _ => Value::error(ErrorKind::Overflow),
        }
    }

    /* ───────────────────── pops ───────────────────── */

    fn pop_any(&mut self) -> Result<Operand, Value> {
        self.stack.pop().ok_or(Value::error(ErrorKind::Underflow))
    }

    fn pop_scalar(&mut self) -> Result<Value, Value> {
        match self.pop_any()? {
            Operand::Scalar(v) => Ok(v),
            Operand::Group(_) => Err(Value::error(ErrorKind::Params)),
        }
    }

    /// Strict mode: `Undefined` is promoted like an error.
    fn pop_strict(&mut self) -> Result<Value, Value> {
        let v = self.pop_scalar()?;
        if v.is_exceptional() { Err(v) } else { Ok(v) }
    }

    /// Lax mode: `Undefined` passes; real errors still propagate.
    fn pop_lax(&mut self) -> Result<Value, Value> {
        let v = self.pop_scalar()?;
        match v.region() {
            Region::Error(_) | Region::Computing | Region::NotComputed => Err(v),
            _ => Ok(v),
        }
    }

    /// Pop two operands for a dyadic operator, promoting the most severe
    /// exceptional operand.
    fn pop2_strict(&mut self) -> Result<(Value, Value), Value> {
        let b = self.pop_scalar()?;
        let a = self.pop_scalar()?;
        match (a.is_exceptional(), b.is_exceptional()) {
            (false, false) => Ok((a, b)),
            (true, false) => Err(a),
            (false, true) => Err(b),
            (true, true) => Err(Value::severest(a, b)),
        }
    }

    /// Flatten the top operand into a list. Errors inside the group
    /// short-circuit; `Undefined` entries are kept for the reducer to
    /// skip or reject.
    fn pop_group(&mut self) -> Result<Vec<Value>, Value> {
        match self.pop_any()? {
            Operand::Scalar(v) => match v.region() {
                Region::Error(_) | Region::Computing | Region::NotComputed => Err(v),
                _ => Ok(vec![v]),
            },
            Operand::Group(vs) => {
                let mut worst: Option<Value> = None;
                for v in &vs {
                    if let Region::Error(_) | Region::Computing | Region::NotComputed = v.region()
                    {
                        worst = Some(match worst {
                            Some(w) => Value::severest(w, *v),
                            None => *v,
                        });
                    }
                }
                match worst {
                    Some(w) => Err(w),
                    None => Ok(vs),
                }
            }
        }
    }

    /* ───────────────────── structure ops ───────────────────── */

    fn concat(&mut self) -> Result<(), Value> {
        let b = self.pop_any()?;
        let a = self.pop_any()?;
        let mut group = match a {
            Operand::Group(g) => g,
            Operand::Scalar(v) => vec![v],
        };
        match b {
            Operand::Group(g) => group.extend(g),
            Operand::Scalar(v) => group.push(v),
        }
        self.stack.push(Operand::Group(group));
        Ok(())
    }

    fn at(&mut self) -> Result<(), Value> {
        let index = match self.pop_strict() {
            Ok(v) => v,
            Err(e) => {
                // the target below the index must be consumed too
                let _ = self.pop_any();
                return Err(e);
            }
        };
        let target = self.pop_any()?;
        let i = match index.finite() {
            Some(x) => x.round() as i64,
            None => return Err(Value::error(ErrorKind::Params)),
        };
        let list = match target {
            Operand::Group(g) => g,
            Operand::Scalar(v) => vec![v],
        };
        if i < 1 || i as usize > list.len() {
            return Err(Value::error(ErrorKind::ArrayIndex));
        }
        self.stack.push(Operand::Scalar(list[i as usize - 1]));
        Ok(())
    }

    fn replace(&mut self) -> Result<(), Value> {
        let b = self.pop_lax()?;
        let a = self.pop_lax()?;
        let v = if a.region() == Region::Undefined { b } else { a };
        self.stack.push(Operand::Scalar(v));
        Ok(())
    }

    fn logic(&mut self, instr: &Instr) -> Result<(), Value> {
        let (a, b) = self.pop2_strict()?;
        let (ta, tb) = match (truthy(a), truthy(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(Value::error(ErrorKind::BadCalc)),
        };
        let r = match instr {
            Instr::And => ta && tb,
            _ => ta || tb,
        };
        self.stack
            .push(Operand::Scalar(if r { Value::ONE } else { Value::ZERO }));
        Ok(())
    }

    /* ───────────────────── arithmetic ───────────────────── */

    fn monadic(&mut self, f: impl Fn(f64) -> f64) -> Result<(), Value> {
        let v = self.pop_strict()?;
        let x = widen(v);
        self.stack.push(Operand::Scalar(Value::number(f(x))));
        Ok(())
    }

    fn dyadic(&mut self, instr: &Instr) -> Result<(), Value> {
        let (a, b) = self.pop2_strict()?;
        let v = apply_dyadic(instr, a, b);
        self.stack.push(Operand::Scalar(v));
        Ok(())
    }

    /* ───────────────────── reducers ───────────────────── */

    fn reduce(&mut self, instr: &Instr) -> Result<(), Value> {
        let vs = self.pop_group()?;
        let v = match instr {
            Instr::Min | Instr::Max => {
                let xs: Vec<f64> = vs
                    .iter()
                    .filter(|v| v.region() != Region::Undefined)
                    .map(|v| widen(*v))
                    .collect();
                if xs.is_empty() {
                    Value::UNDEFINED
                } else if matches!(instr, Instr::Min) {
                    Value::number(xs.into_iter().fold(f64::INFINITY, f64::min))
                } else {
                    Value::number(xs.into_iter().fold(f64::NEG_INFINITY, f64::max))
                }
            }
            Instr::Npv => self.npv(&vs),
            Instr::Mpp => series(&vs).map_or_else(|e| e, |xs| mpp(&xs)),
            Instr::Npu => series(&vs)
                .map_or_else(|e| e, |xs| Value::number(xs.iter().filter(|x| **x > 0.0).count() as f64)),
            Instr::Hccd => series(&vs).map_or_else(|e| e, |xs| hccd(&xs)),
            Instr::Correl => series(&vs).map_or_else(|e| e, |xs| correl_slope(&xs, true)),
            Instr::Slope => series(&vs).map_or_else(|e| e, |xs| correl_slope(&xs, false)),
            _ => self.sample(instr, &vs),
        };
        self.stack.push(Operand::Scalar(v));
        Ok(())
    }

    fn npv(&self, vs: &[Value]) -> Value {
        let xs = match series(vs) {
            Ok(xs) => xs,
            Err(e) => return e,
        };
        if xs.is_empty() {
            return Value::error(ErrorKind::Params);
        }
        let rate = xs[0];
        if rate <= -1.0 {
            return Value::error(ErrorKind::Params);
        }
        let mut acc = 0.0;
        for (i, v) in xs[1..].iter().enumerate() {
            acc += v / (1.0 + rate).powi(i as i32);
        }
        Value::number(acc)
    }

    fn sample(&mut self, instr: &Instr, vs: &[Value]) -> Value {
        let xs = match series(vs) {
            Ok(xs) => xs,
            Err(e) => return e,
        };
        let bad = Value::error(ErrorKind::Params);
        let mut rng = self.ctx.rng.borrow_mut();
        let drawn: Result<f64, ()> = match (instr, xs.as_slice()) {
            (Instr::Binomial, [n, p]) => {
                if *n < 0.0 || !(0.0..=1.0).contains(p) {
                    return bad;
                }
                Binomial::new(n.round() as u64, *p)
                    .map(|d| d.sample(&mut *rng) as f64)
                    .map_err(drop)
            }
            (Instr::Exponential, [lambda]) => {
                Exp::new(*lambda).map(|d| d.sample(&mut *rng)).map_err(drop)
            }
            (Instr::Normal, [mu, sigma]) => Normal::new(*mu, *sigma)
                .map(|d| d.sample(&mut *rng))
                .map_err(drop),
            (Instr::Poisson, [lambda]) => Poisson::new(*lambda)
                .map(|d| d.sample(&mut *rng))
                .map_err(drop),
            (Instr::Triangular, [lo, hi]) => Triangular::new(*lo, *hi, (lo + hi) / 2.0)
                .map(|d| d.sample(&mut *rng))
                .map_err(drop),
            (Instr::Triangular, [lo, hi, mode]) => Triangular::new(*lo, *hi, *mode)
                .map(|d| d.sample(&mut *rng))
                .map_err(drop),
            (Instr::Weibull, [scale, shape]) => Weibull::new(*scale, *shape)
                .map(|d| d.sample(&mut *rng))
                .map_err(drop),
            _ => return bad,
        };
        match drawn {
            Ok(x) => Value::number(x),
            Err(()) => bad,
        }
    }

    /* ───────────────────── leaves ───────────────────── */

    fn symbol(&mut self, s: Symbol) -> Value {
        let span = self.ctx.span;
        let bl = span.block_length.max(1) as i32;
        let t = self.t;
        let num = |x: f64| Value::number(x);
        match s {
            Symbol::T => num(t as f64),
            Symbol::Rt => num(t as f64 * span.dt_hours),
            Symbol::Bt => {
                if t < 1 {
                    Value::ZERO
                } else {
                    num(((t - 1).rem_euclid(bl) + 1) as f64)
                }
            }
            Symbol::Ct => num(((t - 1).div_euclid(bl) * bl + 1) as f64),
            Symbol::B => num(((t - 1).div_euclid(bl) + 1) as f64),
            Symbol::BigN | Symbol::L => num(span.n as f64),
            Symbol::N => num(span.block_count as f64),
            Symbol::R => num(self.ctx.round.get() as f64),
            Symbol::Lr => num(self.ctx.last_round as f64),
            Symbol::Nr => num(self.ctx.round_count as f64),
            Symbol::X => num(self.ctx.run_number as f64),
            Symbol::Nx => num(self.ctx.run_count as f64),
            Symbol::Random => num(self.ctx.rng.borrow_mut().gen_range(0.0..1.0)),
            Symbol::Dt => num(span.dt_hours),
            Symbol::ContextNumber => num(
                self.wildcard
                    .unwrap_or_else(|| self.ctx.context_number.get()) as f64,
            ),
            Symbol::Iterator(i) => num(self.ctx.iterators[i.min(2) as usize] as f64),
            Symbol::StepsPer(u) => num(u.hours() / span.dt_hours),
        }
    }

    fn reference(&mut self, spec: &VarSpec) -> Value {
        let actx = self.ctx.anchor_context(self.t, self.wildcard);
        let rt = actx.resolve_pair(spec.anchor1, spec.offset1, spec.anchor2, spec.offset2);
        let own_attr = &self.expr.attribute;
        let self_ref = spec.is_self()
            || (spec.pattern.eq_ignore_ascii_case(&self.expr.owner.name)
                && spec
                    .attribute
                    .as_deref()
                    .unwrap_or("")
                    .eq_ignore_ascii_case(own_attr));
        if self_ref {
            if rt <= 0 {
                return self.expr.initial_value();
            }
            return self.expr.result(self.ctx, rt, self.wildcard);
        }
        let attr = spec.attribute.as_deref().unwrap_or("");
        self.ctx
            .model
            .variable(self.ctx, spec, &self.expr.owner, attr, rt, self.wildcard)
    }
}

/* ───────────────────── free helpers ───────────────────── */

fn truthy(v: Value) -> Option<bool> {
    match v.region() {
        Region::Normal(x) => Some(x != 0.0),
        Region::PlusInfinity | Region::MinusInfinity => Some(true),
        Region::NoCost => Some(false),
        _ => None,
    }
}

/// Sentinel infinities widen to IEEE infinities so `f64` arithmetic can
/// absorb them; `Value::number` narrows the result back.
fn widen(v: Value) -> f64 {
    match v.region() {
        Region::Normal(x) => x,
        Region::PlusInfinity => f64::INFINITY,
        Region::MinusInfinity => f64::NEG_INFINITY,
        Region::NoCost => 0.0,
        Region::Undefined => 0.0,
        _ => f64::NAN,
    }
}

fn series(vs: &[Value]) -> Result<Vec<f64>, Value> {
    let mut xs = Vec::with_capacity(vs.len());
    for v in vs {
        match v.region() {
            Region::Normal(x) => xs.push(x),
            Region::NoCost => xs.push(0.0),
            Region::Undefined => {} // skipped
            Region::PlusInfinity | Region::MinusInfinity => {
                return Err(Value::error(ErrorKind::Params));
            }
            _ => return Err(*v),
        }
    }
    Ok(xs)
}

/// Maximum of the running prefix sums.
fn mpp(xs: &[f64]) -> Value {
    if xs.is_empty() {
        return Value::UNDEFINED;
    }
    let mut acc = 0.0;
    let mut best = f64::NEG_INFINITY;
    for x in xs {
        acc += x;
        best = best.max(acc);
    }
    Value::number(best)
}

/// Highest cumulative consecutive decline from a running peak.
fn hccd(xs: &[f64]) -> Value {
    if xs.is_empty() {
        return Value::UNDEFINED;
    }
    let mut peak = xs[0];
    let mut worst = 0.0f64;
    for x in &xs[1..] {
        peak = peak.max(*x);
        worst = worst.max(peak - x);
    }
    Value::number(worst)
}

/// Pearson r (or OLS slope) over interleaved (x; y; x; y; …) pairs.
fn correl_slope(xs: &[f64], correlation: bool) -> Value {
    if xs.len() < 4 || xs.len() % 2 != 0 {
        return Value::error(ErrorKind::Params);
    }
    let n = (xs.len() / 2) as f64;
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for pair in xs.chunks_exact(2) {
        let (x, y) = (pair[0], pair[1]);
        sx += x;
        sy += y;
        sxx += x * x;
        syy += y * y;
        sxy += x * y;
    }
    let cov = sxy - sx * sy / n;
    let var_x = sxx - sx * sx / n;
    let var_y = syy - sy * sy / n;
    if var_x.abs() < NEAR_ZERO || (correlation && var_y.abs() < NEAR_ZERO) {
        return Value::error(ErrorKind::DivZero);
    }
    if correlation {
        Value::number(cov / (var_x * var_y).sqrt())
    } else {
        Value::number(cov / var_x)
    }
}

fn apply_dyadic(instr: &Instr, a: Value, b: Value) -> Value {
    let (x, y) = (widen(a), widen(b));
    match instr {
        Instr::Add | Instr::Sub => {
            let y = if matches!(instr, Instr::Sub) { -y } else { y };
            if x.is_infinite() && y.is_infinite() {
                // opposing infinities cancel
                if x.signum() == y.signum() {
                    Value::number(x)
                } else {
                    Value::ZERO
                }
            } else {
                Value::number(x + y)
            }
        }
        Instr::Mul => {
            if (x.is_infinite() && y == 0.0) || (y.is_infinite() && x == 0.0) {
                Value::ZERO
            } else {
                Value::number(x * y)
            }
        }
        Instr::Div => {
            if x.is_infinite() && y.is_infinite() {
                // infinity ratio keeps only the sign
                Value::number(x.signum() * y.signum())
            } else if y == 0.0 {
                Value::error(ErrorKind::DivZero)
            } else {
                Value::number(x / y)
            }
        }
        Instr::SafeDiv => {
            if y.abs() < NEAR_ZERO {
                a
            } else {
                Value::number(x / y)
            }
        }
        Instr::Modulo => {
            if y == 0.0 {
                Value::error(ErrorKind::DivZero)
            } else if x.is_infinite() || y.is_infinite() {
                Value::error(ErrorKind::BadCalc)
            } else {
                Value::number(x % y)
            }
        }
        Instr::Power => Value::number(x.powf(y)),
        Instr::Eq => bool_value(x == y),
        Instr::Ne => bool_value(x != y),
        Instr::Lt => bool_value(x < y),
        Instr::Gt => bool_value(x > y),
        Instr::Le => bool_value(x <= y),
        Instr::Ge => bool_value(x >= y),
        _ => Value::error(ErrorKind::Unknown),
    }
}

fn bool_value(b: bool) -> Value {
    if b { Value::ONE } else { Value::ZERO }
}
