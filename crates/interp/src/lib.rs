//! Tree-walking evaluator for the IR. `Dup` binds one value under two
//! names, `Drop` is a no-op, and `Add` is structural so tangent values
//! (tuples and vectors of floats) can be accumulated directly.

use std::rc::Rc;

use indexmap::IndexMap;
use pullback::{Def, Expr, Fun, FunId, Konst, Prim, Var};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A runtime value.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Bool(bool),
    Int(i64),
    Float(f64),
    Tuple(Rc<Vec<Val>>),
    Vector(Rc<Vec<Val>>),
    /// One case of a trace union.
    Inj { case: usize, val: Rc<Val> },
}

impl Val {
    pub fn unit() -> Val {
        Val::Tuple(Rc::new(vec![]))
    }

    pub fn tuple(members: Vec<Val>) -> Val {
        Val::Tuple(Rc::new(members))
    }

    pub fn vector(elems: Vec<Val>) -> Val {
        Val::Vector(Rc::new(elems))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("variable `{0}` is not bound")]
    Unbound(String),

    #[error("value has the wrong type")]
    Type,

    #[error("wrong number of arguments")]
    Arity,

    #[error("tuple has the wrong number of members")]
    TupleSize,

    #[error("index {0} is out of range")]
    OutOfRange(i64),

    #[error("definition `{0}` is not in the program")]
    UndefinedFun(String),

    #[error("definition `{0}` is a declaration-only stub")]
    StubCall(String),

    #[error("assertion failed")]
    AssertFailed,

    #[error("trace union holds the other case")]
    WrongCase,

    #[error("`{0}` expects a lambda as its final argument")]
    MissingLambda(Prim),

    #[error("lambda outside of a call position")]
    StrayLambda,

    #[error("cannot sum an empty vector")]
    EmptySum,

    #[error("`$rand` cannot be interpreted")]
    Rand,
}

/// A zero value with the same structure as `val`.
fn zero_like(val: &Val) -> Val {
    match val {
        Val::Bool(_) => Val::Bool(false),
        Val::Int(_) => Val::Int(0),
        Val::Float(_) => Val::Float(0.),
        Val::Tuple(members) => Val::tuple(members.iter().map(zero_like).collect()),
        Val::Vector(elems) => Val::vector(elems.iter().map(zero_like).collect()),
        Val::Inj { case, val } => Val::Inj {
            case: *case,
            val: Rc::new(zero_like(val)),
        },
    }
}

/// Structural addition, matching the tangent-type structure.
fn add(a: &Val, b: &Val) -> Result<Val, Error> {
    match (a, b) {
        (Val::Float(x), Val::Float(y)) => Ok(Val::Float(x + y)),
        (Val::Int(x), Val::Int(y)) => Ok(Val::Int(x + y)),
        (Val::Tuple(xs), Val::Tuple(ys)) if xs.len() == ys.len() => Ok(Val::tuple(
            xs.iter()
                .zip(ys.iter())
                .map(|(x, y)| add(x, y))
                .collect::<Result<_, _>>()?,
        )),
        (Val::Vector(xs), Val::Vector(ys)) if xs.len() == ys.len() => Ok(Val::vector(
            xs.iter()
                .zip(ys.iter())
                .map(|(x, y)| add(x, y))
                .collect::<Result<_, _>>()?,
        )),
        _ => Err(Error::Type),
    }
}

fn as_int(val: Val) -> Result<i64, Error> {
    match val {
        Val::Int(n) => Ok(n),
        _ => Err(Error::Type),
    }
}

fn as_float(val: Val) -> Result<f64, Error> {
    match val {
        Val::Float(x) => Ok(x),
        _ => Err(Error::Type),
    }
}

fn as_bool(val: Val) -> Result<bool, Error> {
    match val {
        Val::Bool(b) => Ok(b),
        _ => Err(Error::Type),
    }
}

fn as_vector(val: Val) -> Result<Rc<Vec<Val>>, Error> {
    match val {
        Val::Vector(elems) => Ok(elems),
        _ => Err(Error::Type),
    }
}

struct Interpreter<'a> {
    defs: &'a [Def],
    /// Flat per-call environment; bindings are never popped on scope exit.
    /// Names are unique within a definition, except that generated adjoint
    /// code rebinds a name on purpose (`let d$x = d$x$0 + d$x`), where the
    /// insert-over semantics give exactly the intended shadowing.
    env: IndexMap<Rc<str>, Val>,
}

impl Interpreter<'_> {
    fn get(&self, var: &Var) -> Result<Val, Error> {
        self.env
            .get(&var.name)
            .cloned()
            .ok_or_else(|| Error::Unbound(var.name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Val, Error> {
        match expr {
            Expr::Var(v) => self.get(v),
            Expr::Konst(k) => Ok(match *k {
                Konst::Bool(b) => Val::Bool(b),
                Konst::Int(n) => Val::Int(n),
                Konst::Float(x) => Val::Float(x),
            }),
            Expr::Tuple(members) => Ok(Val::tuple(
                members
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Call(f, args) => self.call(f, args),
            Expr::Let { var, bind, body } => {
                let val = self.eval(bind)?;
                self.env.insert(var.name.clone(), val);
                self.eval(body)
            }
            Expr::Untuple { vars, tuple, body } => {
                let members = match self.eval(tuple)? {
                    Val::Tuple(members) => members,
                    _ => return Err(Error::Type),
                };
                if members.len() != vars.len() {
                    return Err(Error::TupleSize);
                }
                for (var, val) in vars.iter().zip(members.iter()) {
                    self.env.insert(var.name.clone(), val.clone());
                }
                self.eval(body)
            }
            Expr::If { cond, then, els } => {
                if as_bool(self.eval(cond)?)? {
                    self.eval(then)
                } else {
                    self.eval(els)
                }
            }
            Expr::Assert { cond, body } => {
                if as_bool(self.eval(cond)?)? {
                    self.eval(body)
                } else {
                    Err(Error::AssertFailed)
                }
            }
            Expr::Dup {
                left,
                right,
                from,
                body,
            } => {
                let val = self.get(from)?;
                self.env.insert(left.name.clone(), val.clone());
                self.env.insert(right.name.clone(), val);
                self.eval(body)
            }
            Expr::Drop { body, .. } => self.eval(body),
            Expr::Lam { .. } => Err(Error::StrayLambda),
        }
    }

    fn call(&mut self, f: &Fun, args: &[Expr]) -> Result<Val, Error> {
        match f {
            Fun::Prim(Prim::ForRange) => {
                let (arg, body, rest) = split_lambda(Prim::ForRange, args)?;
                if rest.len() != 2 {
                    return Err(Error::Arity);
                }
                let n = as_int(self.eval(&rest[0])?)?;
                let mut state = self.eval(&rest[1])?;
                for i in 0..n {
                    let si = Val::tuple(vec![Val::Int(i), state]);
                    self.env.insert(arg.name.clone(), si);
                    state = self.eval(body)?;
                }
                Ok(state)
            }
            Fun::Prim(Prim::Build) => {
                let (arg, body, rest) = split_lambda(Prim::Build, args)?;
                if rest.len() != 1 {
                    return Err(Error::Arity);
                }
                let n = as_int(self.eval(&rest[0])?)?;
                let mut elems = Vec::with_capacity(n.max(0) as usize);
                for i in 0..n {
                    self.env.insert(arg.name.clone(), Val::Int(i));
                    elems.push(self.eval(body)?);
                }
                Ok(Val::vector(elems))
            }
            Fun::Prim(p) => {
                let vals = args
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                self.prim(*p, vals)
            }
            Fun::Proj { member, arity } => {
                let [tuple] = call_args::<1>(args)?;
                match self.eval(tuple)? {
                    Val::Tuple(members) if members.len() == *arity => members
                        .get(*member)
                        .cloned()
                        .ok_or(Error::TupleSize),
                    Val::Tuple(_) => Err(Error::TupleSize),
                    _ => Err(Error::Type),
                }
            }
            Fun::Inj { case } => {
                let [payload] = call_args::<1>(args)?;
                Ok(Val::Inj {
                    case: *case,
                    val: Rc::new(self.eval(payload)?),
                })
            }
            Fun::Prj { case } => {
                let [union] = call_args::<1>(args)?;
                match self.eval(union)? {
                    Val::Inj { case: tag, val } if tag == *case => Ok((*val).clone()),
                    Val::Inj { .. } => Err(Error::WrongCase),
                    _ => Err(Error::Type),
                }
            }
            Fun::Def(id) => {
                let def = self
                    .defs
                    .iter()
                    .find(|d| d.id == *id)
                    .ok_or_else(|| Error::UndefinedFun(id.to_string()))?;
                let body = def
                    .body
                    .as_ref()
                    .ok_or_else(|| Error::StubCall(id.to_string()))?;
                if args.len() != def.params.len() {
                    return Err(Error::Arity);
                }
                let mut env = IndexMap::new();
                for (param, arg) in def.params.iter().zip(args.iter()) {
                    env.insert(param.name.clone(), self.eval(arg)?);
                }
                let mut callee = Interpreter {
                    defs: self.defs,
                    env,
                };
                callee.eval(body)
            }
        }
    }

    fn prim(&mut self, p: Prim, vals: Vec<Val>) -> Result<Val, Error> {
        match p {
            Prim::Add => {
                let [a, b] = prim_args::<2>(vals)?;
                add(&a, &b)
            }
            Prim::Sub => {
                let [a, b] = prim_args::<2>(vals)?;
                match (a, b) {
                    (Val::Float(x), Val::Float(y)) => Ok(Val::Float(x - y)),
                    (Val::Int(x), Val::Int(y)) => Ok(Val::Int(x - y)),
                    _ => Err(Error::Type),
                }
            }
            Prim::Mul => {
                let [a, b] = prim_args::<2>(vals)?;
                match (a, b) {
                    (Val::Float(x), Val::Float(y)) => Ok(Val::Float(x * y)),
                    (Val::Int(x), Val::Int(y)) => Ok(Val::Int(x * y)),
                    _ => Err(Error::Type),
                }
            }
            Prim::Div => {
                let [a, b] = prim_args::<2>(vals)?;
                Ok(Val::Float(as_float(a)? / as_float(b)?))
            }
            Prim::Neg => {
                let [a] = prim_args::<1>(vals)?;
                match a {
                    Val::Float(x) => Ok(Val::Float(-x)),
                    Val::Int(x) => Ok(Val::Int(-x)),
                    _ => Err(Error::Type),
                }
            }
            Prim::Eq => {
                let [a, b] = prim_args::<2>(vals)?;
                match (a, b) {
                    (Val::Float(x), Val::Float(y)) => Ok(Val::Bool(x == y)),
                    (Val::Int(x), Val::Int(y)) => Ok(Val::Bool(x == y)),
                    (Val::Bool(x), Val::Bool(y)) => Ok(Val::Bool(x == y)),
                    _ => Err(Error::Type),
                }
            }
            Prim::Gt => {
                let [a, b] = prim_args::<2>(vals)?;
                match (a, b) {
                    (Val::Float(x), Val::Float(y)) => Ok(Val::Bool(x > y)),
                    (Val::Int(x), Val::Int(y)) => Ok(Val::Bool(x > y)),
                    _ => Err(Error::Type),
                }
            }
            Prim::Log => {
                let [a] = prim_args::<1>(vals)?;
                Ok(Val::Float(as_float(a)?.ln()))
            }
            Prim::Exp => {
                let [a] = prim_args::<1>(vals)?;
                Ok(Val::Float(as_float(a)?.exp()))
            }
            Prim::IndexL => {
                let [i, xs] = prim_args::<2>(vals)?;
                let i = as_int(i)?;
                let xs = as_vector(xs)?;
                match usize::try_from(i).ok().and_then(|i| xs.get(i)) {
                    Some(elem) => Ok(elem.clone()),
                    None => match xs.first() {
                        Some(elem) => Ok(zero_like(elem)),
                        None => Err(Error::OutOfRange(i)),
                    },
                }
            }
            Prim::Index => {
                let [i, xs] = prim_args::<2>(vals)?;
                let i = as_int(i)?;
                let xs = as_vector(xs)?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| xs.get(i))
                    .cloned()
                    .ok_or(Error::OutOfRange(i))
            }
            Prim::Size => {
                let [xs] = prim_args::<1>(vals)?;
                Ok(Val::Int(as_vector(xs)?.len() as i64))
            }
            Prim::DeltaVec => {
                let [n, i, x] = prim_args::<3>(vals)?;
                let n = as_int(n)?;
                let i = as_int(i)?;
                let elems = (0..n)
                    .map(|j| if j == i { x.clone() } else { zero_like(&x) })
                    .collect();
                Ok(Val::vector(elems))
            }
            Prim::VecConst => {
                let [n, x] = prim_args::<2>(vals)?;
                let n = as_int(n)?;
                Ok(Val::vector(vec![x; n.max(0) as usize]))
            }
            Prim::VecSet => {
                let [xs, i, x] = prim_args::<3>(vals)?;
                let i = as_int(i)?;
                let mut elems = (*as_vector(xs)?).clone();
                let slot = usize::try_from(i)
                    .ok()
                    .and_then(|i| elems.get_mut(i))
                    .ok_or(Error::OutOfRange(i))?;
                *slot = x;
                Ok(Val::vector(elems))
            }
            Prim::Sum => {
                let [xs] = prim_args::<1>(vals)?;
                let xs = as_vector(xs)?;
                let mut iter = xs.iter();
                let first = iter.next().ok_or(Error::EmptySum)?.clone();
                iter.try_fold(first, |acc, x| add(&acc, x))
            }
            Prim::Rand => Err(Error::Rand),
            // reached only when the lambda argument was missing
            Prim::ForRange | Prim::Build => Err(Error::MissingLambda(p)),
        }
    }
}

fn split_lambda<'e>(p: Prim, args: &'e [Expr]) -> Result<(&'e Var, &'e Expr, &'e [Expr]), Error> {
    match args.split_last() {
        Some((Expr::Lam { arg, body }, rest)) => Ok((arg, body, rest)),
        _ => Err(Error::MissingLambda(p)),
    }
}

fn call_args<const N: usize>(args: &[Expr]) -> Result<&[Expr; N], Error> {
    args.try_into().map_err(|_| Error::Arity)
}

fn prim_args<const N: usize>(vals: Vec<Val>) -> Result<[Val; N], Error> {
    vals.try_into().map_err(|_| Error::Arity)
}

/// Runs the definition named `id` from `defs` on `args`.
pub fn interp(defs: &[Def], id: &FunId, args: Vec<Val>) -> Result<Val, Error> {
    let def = defs
        .iter()
        .find(|d| d.id == *id)
        .ok_or_else(|| Error::UndefinedFun(id.to_string()))?;
    let body = def
        .body
        .as_ref()
        .ok_or_else(|| Error::StubCall(id.to_string()))?;
    if args.len() != def.params.len() {
        return Err(Error::Arity);
    }
    let env = def
        .params
        .iter()
        .map(|p| p.name.clone())
        .zip(args)
        .collect();
    let mut interpreter = Interpreter { defs, env };
    interpreter.eval(body)
}

/// Evaluates one expression under the given bindings.
pub fn eval(defs: &[Def], bindings: &[(Var, Val)], expr: &Expr) -> Result<Val, Error> {
    let env = bindings
        .iter()
        .map(|(var, val)| (var.name.clone(), val.clone()))
        .collect();
    let mut interpreter = Interpreter { defs, env };
    interpreter.eval(expr)
}
