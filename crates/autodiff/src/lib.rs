//! Reverse-mode differentiation of linearized expressions.
//!
//! The engine walks a linear ANF expression back to front and produces three
//! artifacts per node: forward bindings that recompute the primal value,
//! a trace group naming the intermediates the reverse pass will need, and
//! reverse bindings that turn the adjoint of the node's output into adjoints
//! of its inputs. Because the input is linear, every variable is consumed by
//! exactly one node, so that node alone defines the variable's adjoint;
//! contributions only meet at `Dup`, where the two alias adjoints are summed.
//!
//! In straight-line code the trace is implicit: forward bindings stay in
//! scope all the way down the generated let-chain, so the reverse bindings
//! simply refer to them. The trace is materialized as data only where control
//! flow makes scopes diverge, as a tagged union for the two arms of a
//! conditional and as a per-iteration vector for a loop. Generated code is
//! not itself linear and is never differentiated again.

use enumset::{enum_set, EnumSet};
use indexmap::IndexSet;
use pullback::build::{wrap, Bind};
use pullback::ty::Ty;
use pullback::{Def, Expr, Flavor, Fun, FunId, Konst, NameGen, Prim, Var};

/// Primitives whose value flows forward but whose derivative is treated as
/// zero for now.
const PLACEHOLDER: EnumSet<Prim> = enum_set!(Prim::Build | Prim::Sum | Prim::Rand);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Linearize(#[from] pullback_linearize::Error),

    #[error("definition `{0}` has no body")]
    Stub(FunId),

    #[error("no derivative rule for primitive `{0}`")]
    UnsupportedPrim(Prim),

    #[error("wrong number of arguments to `{0}`")]
    Arity(Prim),

    #[error("call to derived definition `{0}` cannot be differentiated")]
    DerivedCallee(FunId),

    #[error("call argument is a nested expression, not a variable or constant")]
    ArgNotAtom,

    #[error("vector argument is not a variable reference")]
    VecNotVar,

    #[error("condition is not a variable reference")]
    CondNotVar,

    #[error("source of a destructuring bind is not a variable reference")]
    UntupleNotVar,

    #[error("body must end in a variable reference")]
    ResultNotVar,

    #[error("binding is not in administrative normal form")]
    BindNotAnf,

    #[error("trace constructors cannot appear in source code")]
    TraceOpInSource,

    #[error("conditional arms have different result types")]
    BranchResult,

    #[error("conditional arms consume different variable sets")]
    BranchVars,

    #[error("loop body captures variables other than its argument")]
    OpenLoopBody,

    #[error("loop argument must pair an index with the carried state")]
    LoopArg,

    #[error("`{0}` expects a lambda as its final argument")]
    MissingLambda(Prim),

    #[error("projection source is not a tuple-typed variable")]
    ProjArg,

    #[error("no closed zero value at type {0:?}")]
    NoZero(Ty),
}

/// The intermediates one region of code saves for its reverse pass, in
/// forward order, grouped by the node that saved them.
///
/// Materialized as a tuple of group tuples only at control-flow boundaries;
/// in straight-line code the named variables are simply still in scope.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace(pub Vec<Vec<Var>>);

impl Trace {
    fn cons(group: Vec<Var>, mut rest: Trace) -> Trace {
        if !group.is_empty() {
            rest.0.insert(0, group);
        }
        rest
    }

    /// The type of the packed trace.
    pub fn ty(&self) -> Ty {
        Ty::tuple(
            self.0
                .iter()
                .map(|group| Ty::tuple(group.iter().map(|v| v.ty.clone()).collect()))
                .collect(),
        )
    }

    /// Packs the trace into a tuple-of-tuples value.
    pub fn pack(&self) -> Expr {
        Expr::Tuple(
            self.0
                .iter()
                .map(|group| Expr::Tuple(group.iter().map(evar).collect()))
                .collect(),
        )
    }

    /// Bindings that take a packed trace in `src` apart again, rebinding
    /// every saved variable under its original name.
    pub fn unpack(&self, src: &Var, names: &mut NameGen) -> Vec<Bind> {
        let groups: Vec<Var> = self
            .0
            .iter()
            .map(|group| {
                names.var(
                    "group",
                    Ty::tuple(group.iter().map(|v| v.ty.clone()).collect()),
                )
            })
            .collect();
        let mut binds = vec![Bind::Untuple(groups.clone(), Expr::Var(src.clone()))];
        for (packed, group) in groups.into_iter().zip(&self.0) {
            binds.push(Bind::Untuple(group.clone(), Expr::Var(packed)));
        }
        binds
    }
}

/// The differentiation of one expression: forward bindings, the trace they
/// save, and reverse bindings that expect the adjoint of `result` to be
/// bound before they run.
#[derive(Clone, Debug, PartialEq)]
pub struct Diff {
    pub fwd: Vec<Bind>,
    pub trace: Trace,
    pub bwd: Vec<Bind>,
    pub result: Var,
}

impl Diff {
    fn leaf(result: Var) -> Diff {
        Diff {
            fwd: Vec::new(),
            trace: Trace::default(),
            bwd: Vec::new(),
            result,
        }
    }

    /// Stitches one node onto the differentiation of the rest of the chain:
    /// forward bindings go in program order, reverse bindings in the
    /// mirrored order, and a non-empty trace group is prepended.
    fn compose(mut fwd: Vec<Bind>, group: Vec<Var>, bwd: Vec<Bind>, rest: Diff) -> Diff {
        fwd.extend(rest.fwd);
        let mut rev = rest.bwd;
        rev.extend(bwd);
        Diff {
            fwd,
            trace: Trace::cons(group, rest.trace),
            bwd: rev,
            result: rest.result,
        }
    }
}

/// Differentiates a linearized expression.
pub fn diff(expr: &Expr, names: &mut NameGen) -> Result<Diff, Error> {
    Engine { names }.expr(expr)
}

/// A call argument in linearized form.
#[derive(Clone, Debug)]
enum Atom {
    Var(Var),
    Konst(Konst),
}

impl Atom {
    fn from_expr(e: &Expr) -> Result<Atom, Error> {
        match e {
            Expr::Var(v) => Ok(Atom::Var(v.clone())),
            Expr::Konst(k) => Ok(Atom::Konst(*k)),
            _ => Err(Error::ArgNotAtom),
        }
    }

    fn expr(&self) -> Expr {
        match self {
            Atom::Var(v) => Expr::Var(v.clone()),
            Atom::Konst(k) => Expr::Konst(*k),
        }
    }

    fn var(&self) -> Option<&Var> {
        match self {
            Atom::Var(v) => Some(v),
            Atom::Konst(_) => None,
        }
    }

    fn ty(&self) -> Ty {
        match self {
            Atom::Var(v) => v.ty.clone(),
            Atom::Konst(k) => k.ty(),
        }
    }
}

fn atoms<const N: usize>(p: Prim, args: &[Expr]) -> Result<[Atom; N], Error> {
    let got: Vec<Atom> = args.iter().map(Atom::from_expr).collect::<Result<_, _>>()?;
    got.try_into().map_err(|_| Error::Arity(p))
}

fn evar(v: &Var) -> Expr {
    Expr::Var(v.clone())
}

fn prim(p: Prim, args: Vec<Expr>) -> Expr {
    Expr::Call(Fun::Prim(p), args)
}

/// A closed zero value at a type that admits one. Vectors do not, since
/// their length is only known at run time.
fn zero(ty: &Ty) -> Result<Expr, Error> {
    match ty {
        Ty::Bool => Ok(Expr::Konst(Konst::Bool(false))),
        Ty::Int => Ok(Expr::Konst(Konst::Int(0))),
        Ty::Float => Ok(Expr::Konst(Konst::Float(0.0))),
        Ty::Tuple(members) => Ok(Expr::Tuple(
            members.iter().map(zero).collect::<Result<_, _>>()?,
        )),
        Ty::Sum(cases) => match cases.first() {
            Some(first) => Ok(Expr::Call(Fun::Inj { case: 0 }, vec![zero(first)?])),
            None => Err(Error::NoZero(ty.clone())),
        },
        Ty::Vec(_) | Ty::Lam(..) => Err(Error::NoZero(ty.clone())),
    }
}

/// A zero tangent for a value of primal type `ty`, available as `src`.
/// Unlike [`zero`] this can handle vectors by reading their length off the
/// value itself.
fn zero_like(src: &Expr, ty: &Ty) -> Result<Expr, Error> {
    match ty {
        Ty::Float => Ok(Expr::Konst(Konst::Float(0.0))),
        Ty::Bool | Ty::Int | Ty::Lam(..) | Ty::Sum(..) => Ok(Expr::Tuple(vec![])),
        Ty::Vec(elem) => Ok(prim(
            Prim::VecConst,
            vec![prim(Prim::Size, vec![src.clone()]), zero(&elem.tangent())?],
        )),
        Ty::Tuple(members) => {
            let arity = members.len();
            Ok(Expr::Tuple(
                members
                    .iter()
                    .enumerate()
                    .map(|(member, m)| {
                        zero_like(&Expr::Call(Fun::Proj { member, arity }, vec![src.clone()]), m)
                    })
                    .collect::<Result<_, _>>()?,
            ))
        }
    }
}

/// A zero adjoint for `var`, plus the trace group needed to build it: empty
/// when the tangent has a closed zero, `[var]` when the value itself must
/// survive to the reverse pass.
fn zeroed(var: &Var) -> Result<(Vec<Var>, Expr), Error> {
    match zero(&var.ty.tangent()) {
        Ok(z) => Ok((Vec::new(), z)),
        Err(Error::NoZero(_)) => {
            let z = zero_like(&Expr::Var(var.clone()), &var.ty)?;
            Ok((vec![var.clone()], z))
        }
        Err(e) => Err(e),
    }
}

struct Engine<'a> {
    names: &'a mut NameGen,
}

impl Engine<'_> {
    fn expr(&mut self, expr: &Expr) -> Result<Diff, Error> {
        match expr {
            Expr::Var(v) => Ok(Diff::leaf(v.clone())),

            Expr::Let { var, bind, body } => {
                let rest = self.expr(body)?;
                match bind.as_ref() {
                    Expr::Var(x) => Ok(Diff::compose(
                        vec![Bind::Let(var.clone(), evar(x))],
                        Vec::new(),
                        vec![Bind::Let(x.adjoint(), evar(&var.adjoint()))],
                        rest,
                    )),
                    Expr::Konst(k) => Ok(Diff::compose(
                        vec![Bind::Let(var.clone(), Expr::Konst(*k))],
                        Vec::new(),
                        Vec::new(),
                        rest,
                    )),
                    Expr::Tuple(members) => self.tuple(var, members, rest),
                    Expr::Call(f, args) => self.call(var, f, args, rest),
                    Expr::If { cond, then, els } => self.conditional(var, cond, then, els, rest),
                    Expr::Lam { .. }
                    | Expr::Let { .. }
                    | Expr::Untuple { .. }
                    | Expr::Assert { .. }
                    | Expr::Dup { .. }
                    | Expr::Drop { .. } => Err(Error::BindNotAnf),
                }
            }

            Expr::Untuple { vars, tuple, body } => {
                let src = match tuple.as_ref() {
                    Expr::Var(v) => v.clone(),
                    _ => return Err(Error::UntupleNotVar),
                };
                let rest = self.expr(body)?;
                let adjoints = vars.iter().map(|v| Expr::Var(v.adjoint())).collect();
                Ok(Diff::compose(
                    vec![Bind::Untuple(vars.clone(), evar(&src))],
                    Vec::new(),
                    vec![Bind::Let(src.adjoint(), Expr::Tuple(adjoints))],
                    rest,
                ))
            }

            Expr::Assert { cond, body } => {
                let c = match cond.as_ref() {
                    Expr::Var(v) => v.clone(),
                    _ => return Err(Error::CondNotVar),
                };
                let rest = self.expr(body)?;
                Ok(Diff::compose(
                    vec![Bind::Assert(c.clone())],
                    Vec::new(),
                    vec![Bind::Let(c.adjoint(), Expr::Tuple(vec![]))],
                    rest,
                ))
            }

            Expr::Dup {
                left,
                right,
                from,
                body,
            } => {
                let rest = self.expr(body)?;
                // The alias adjoints are summed into the source adjoint;
                // this is the only place contributions meet.
                let sum = prim(
                    Prim::Add,
                    vec![Expr::Var(left.adjoint()), Expr::Var(right.adjoint())],
                );
                Ok(Diff::compose(
                    vec![Bind::Dup(left.clone(), right.clone(), from.clone())],
                    Vec::new(),
                    vec![Bind::Let(from.adjoint(), sum)],
                    rest,
                ))
            }

            Expr::Drop { var, body } => {
                let rest = self.expr(body)?;
                let (group, z) = zeroed(var)?;
                Ok(Diff::compose(
                    vec![Bind::Drop(var.clone())],
                    group,
                    vec![Bind::Let(var.adjoint(), z)],
                    rest,
                ))
            }

            Expr::Konst(_) | Expr::Tuple(_) | Expr::Call(..) | Expr::If { .. } | Expr::Lam { .. } => {
                Err(Error::ResultNotVar)
            }
        }
    }

    fn tuple(&mut self, var: &Var, members: &[Expr], rest: Diff) -> Result<Diff, Error> {
        let parts: Vec<Atom> = members
            .iter()
            .map(Atom::from_expr)
            .collect::<Result<_, _>>()?;
        let slots = parts
            .iter()
            .map(|a| match a.var() {
                Some(v) => v.adjoint(),
                None => self.names.var("d", a.ty().tangent()),
            })
            .collect();
        Ok(Diff::compose(
            vec![Bind::Let(var.clone(), Expr::Tuple(members.to_vec()))],
            Vec::new(),
            vec![Bind::Untuple(slots, Expr::Var(var.adjoint()))],
            rest,
        ))
    }

    fn call(&mut self, var: &Var, f: &Fun, args: &[Expr], rest: Diff) -> Result<Diff, Error> {
        match f {
            Fun::Prim(Prim::ForRange) => self.loop_(var, args, rest),
            Fun::Prim(p) => self.prim_call(var, *p, args, rest),
            Fun::Proj { member, arity } => self.proj(var, *member, *arity, args, rest),
            Fun::Def(id) => self.user_call(var, id, args, rest),
            Fun::Inj { .. } | Fun::Prj { .. } => Err(Error::TraceOpInSource),
        }
    }

    fn prim_call(&mut self, var: &Var, p: Prim, args: &[Expr], rest: Diff) -> Result<Diff, Error> {
        let dv = var.adjoint();
        let mut fwd = vec![Bind::Let(var.clone(), Expr::Call(Fun::Prim(p), args.to_vec()))];
        let mut group = Vec::new();
        let mut bwd = Vec::new();
        match p {
            Prim::Add => {
                let [a, b] = atoms::<2>(p, args)?;
                for x in [&a, &b] {
                    if let Some(v) = x.var() {
                        bwd.push(Bind::Let(v.adjoint(), evar(&dv)));
                    }
                }
            }
            Prim::Sub => {
                let [a, b] = atoms::<2>(p, args)?;
                if let Some(v) = a.var() {
                    bwd.push(Bind::Let(v.adjoint(), evar(&dv)));
                }
                if let Some(v) = b.var() {
                    bwd.push(Bind::Let(v.adjoint(), prim(Prim::Neg, vec![evar(&dv)])));
                }
            }
            Prim::Mul => {
                let [a, b] = atoms::<2>(p, args)?;
                for x in [&a, &b] {
                    if let Some(v) = x.var() {
                        group.push(v.clone());
                    }
                }
                if let Some(v) = a.var() {
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Mul, vec![evar(&dv), b.expr()]),
                    ));
                }
                if let Some(v) = b.var() {
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Mul, vec![evar(&dv), a.expr()]),
                    ));
                }
            }
            Prim::Div => {
                let [a, b] = atoms::<2>(p, args)?;
                for x in [&a, &b] {
                    if let Some(v) = x.var() {
                        group.push(v.clone());
                    }
                }
                if let Some(v) = a.var() {
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Div, vec![evar(&dv), b.expr()]),
                    ));
                }
                if let Some(v) = b.var() {
                    let num = prim(Prim::Mul, vec![a.expr(), evar(&dv)]);
                    let den = prim(Prim::Mul, vec![b.expr(), b.expr()]);
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Neg, vec![prim(Prim::Div, vec![num, den])]),
                    ));
                }
            }
            Prim::Neg => {
                let [a] = atoms::<1>(p, args)?;
                if let Some(v) = a.var() {
                    bwd.push(Bind::Let(v.adjoint(), prim(Prim::Neg, vec![evar(&dv)])));
                }
            }
            Prim::Eq | Prim::Gt => {
                let [a, b] = atoms::<2>(p, args)?;
                for x in [&a, &b] {
                    if let Some(v) = x.var() {
                        bwd.push(Bind::Let(v.adjoint(), zero(&v.ty.tangent())?));
                    }
                }
            }
            Prim::Log => {
                let [a] = atoms::<1>(p, args)?;
                if let Some(v) = a.var() {
                    group.push(v.clone());
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Div, vec![evar(&dv), a.expr()]),
                    ));
                }
            }
            Prim::Exp => {
                let [a] = atoms::<1>(p, args)?;
                if let Some(v) = a.var() {
                    group.push(v.clone());
                    let again = prim(Prim::Exp, vec![a.expr()]);
                    bwd.push(Bind::Let(
                        v.adjoint(),
                        prim(Prim::Mul, vec![evar(&dv), again]),
                    ));
                }
            }
            Prim::IndexL => {
                let [i, xs] = atoms::<2>(p, args)?;
                let xs = match xs.var() {
                    Some(v) => v.clone(),
                    None => return Err(Error::VecNotVar),
                };
                // The element adjoint scatters back into a one-hot vector,
                // so the reverse pass needs the length.
                let n = self.names.var("n", Ty::Int);
                fwd.push(Bind::Let(n.clone(), prim(Prim::Size, vec![evar(&xs)])));
                group.push(n.clone());
                if let Some(v) = i.var() {
                    group.push(v.clone());
                }
                bwd.push(Bind::Let(
                    xs.adjoint(),
                    prim(Prim::DeltaVec, vec![evar(&n), i.expr(), evar(&dv)]),
                ));
                if let Some(v) = i.var() {
                    bwd.push(Bind::Let(v.adjoint(), Expr::Tuple(vec![])));
                }
            }
            p if PLACEHOLDER.contains(p) => {
                for arg in args {
                    match arg {
                        Expr::Var(v) => {
                            let (g, z) = zeroed(v)?;
                            group.extend(g);
                            bwd.push(Bind::Let(v.adjoint(), z));
                        }
                        Expr::Konst(_) => {}
                        Expr::Lam { .. } if p == Prim::Build => {}
                        _ => return Err(Error::ArgNotAtom),
                    }
                }
            }
            _ => return Err(Error::UnsupportedPrim(p)),
        }
        Ok(Diff::compose(fwd, group, bwd, rest))
    }

    fn proj(
        &mut self,
        var: &Var,
        member: usize,
        arity: usize,
        args: &[Expr],
        rest: Diff,
    ) -> Result<Diff, Error> {
        let src = match args {
            [Expr::Var(t)] => t.clone(),
            _ => return Err(Error::ProjArg),
        };
        let members = match &src.ty {
            Ty::Tuple(ms) if ms.len() == arity => ms.clone(),
            _ => return Err(Error::ProjArg),
        };
        let dv = var.adjoint();
        let mut group = Vec::new();
        let mut slots = Vec::with_capacity(arity);
        for (j, m) in members.iter().enumerate() {
            if j == member {
                slots.push(evar(&dv));
                continue;
            }
            match zero(&m.tangent()) {
                Ok(z) => slots.push(z),
                Err(Error::NoZero(_)) => {
                    if group.is_empty() {
                        group.push(src.clone());
                    }
                    let sibling = Expr::Call(Fun::Proj { member: j, arity }, vec![evar(&src)]);
                    slots.push(zero_like(&sibling, m)?);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Diff::compose(
            vec![Bind::Let(
                var.clone(),
                Expr::Call(Fun::Proj { member, arity }, vec![evar(&src)]),
            )],
            group,
            vec![Bind::Let(src.adjoint(), Expr::Tuple(slots))],
            rest,
        ))
    }

    /// A call to a user definition defers to the callee's linear-gradient
    /// twin: the argument values are saved, and the reverse pass hands them
    /// back to the twin along with the result adjoint.
    fn user_call(
        &mut self,
        var: &Var,
        id: &FunId,
        args: &[Expr],
        rest: Diff,
    ) -> Result<Diff, Error> {
        if id.flavor != Flavor::Plain {
            return Err(Error::DerivedCallee(id.clone()));
        }
        let parts: Vec<Atom> = args.iter().map(Atom::from_expr).collect::<Result<_, _>>()?;
        let fwd = vec![Bind::Let(
            var.clone(),
            Expr::Call(Fun::Def(id.clone()), args.to_vec()),
        )];
        let group: Vec<Var> = parts.iter().filter_map(|a| a.var().cloned()).collect();
        let dtup = self.names.var(
            "dargs",
            Ty::tuple(parts.iter().map(|a| a.ty().tangent()).collect()),
        );
        let mut twin_args: Vec<Expr> = parts.iter().map(Atom::expr).collect();
        twin_args.push(Expr::Var(var.adjoint()));
        let slots = parts
            .iter()
            .map(|a| match a.var() {
                Some(v) => v.adjoint(),
                None => self.names.var("d", a.ty().tangent()),
            })
            .collect();
        let bwd = vec![
            Bind::Let(
                dtup.clone(),
                Expr::Call(Fun::Def(id.lin_grad()), twin_args),
            ),
            Bind::Untuple(slots, evar(&dtup)),
        ];
        Ok(Diff::compose(fwd, group, bwd, rest))
    }

    /// Differentiates `let var = if c { then } else { els }`.
    ///
    /// Each arm is differentiated on its own; the forward conditional
    /// returns the arm result paired with the arm's packed trace, injected
    /// into a two-case union so the reverse pass can tell which arm ran.
    /// The reverse conditional re-tests the same condition, projects the
    /// matching case back out, and returns the adjoints of the variables
    /// both arms consume.
    fn conditional(
        &mut self,
        var: &Var,
        cond: &Expr,
        then: &Expr,
        els: &Expr,
        rest: Diff,
    ) -> Result<Diff, Error> {
        let c = match cond {
            Expr::Var(v) => v.clone(),
            _ => return Err(Error::CondNotVar),
        };
        let dt = self.expr(then)?;
        let de = self.expr(els)?;
        let fv_then: IndexSet<Var> = then.free_vars();
        let fv_els = els.free_vars();
        if fv_then.len() != fv_els.len() || fv_then.iter().any(|v| !fv_els.contains(v)) {
            return Err(Error::BranchVars);
        }
        if dt.result.ty != de.result.ty {
            return Err(Error::BranchResult);
        }
        let shared: Vec<Var> = fv_then.into_iter().collect();
        let union_ty = Ty::sum(vec![dt.trace.ty(), de.trace.ty()]);

        let arm0 = self.fwd_arm(0, &dt, &union_ty);
        let arm1 = self.fwd_arm(1, &de, &union_ty);
        let pair = self.names.var(
            "if",
            Ty::tuple(vec![dt.result.ty.clone(), union_ty.clone()]),
        );
        let tagged = self.names.var("trace", union_ty);
        let fwd = vec![
            Bind::Let(
                pair.clone(),
                Expr::If {
                    cond: Box::new(evar(&c)),
                    then: Box::new(arm0),
                    els: Box::new(arm1),
                },
            ),
            Bind::Untuple(vec![var.clone(), tagged.clone()], evar(&pair)),
        ];
        let group = vec![c.clone(), tagged.clone()];

        let rev0 = self.rev_arm(0, &dt, &tagged, var, &shared);
        let rev1 = self.rev_arm(1, &de, &tagged, var, &shared);
        let ds = self.names.var(
            "dif",
            Ty::tuple(shared.iter().map(|v| v.ty.tangent()).collect()),
        );
        let bwd = vec![
            Bind::Let(
                ds.clone(),
                Expr::If {
                    cond: Box::new(evar(&c)),
                    then: Box::new(rev0),
                    els: Box::new(rev1),
                },
            ),
            Bind::Untuple(shared.iter().map(Var::adjoint).collect(), evar(&ds)),
            Bind::Let(c.adjoint(), Expr::Tuple(vec![])),
        ];
        Ok(Diff::compose(fwd, group, bwd, rest))
    }

    fn fwd_arm(&mut self, case: usize, d: &Diff, union_ty: &Ty) -> Expr {
        let saved = self.names.var("saved", d.trace.ty());
        let tagged = self.names.var("trace", union_ty.clone());
        let mut binds = d.fwd.clone();
        binds.push(Bind::Let(saved.clone(), d.trace.pack()));
        binds.push(Bind::Let(
            tagged.clone(),
            Expr::Call(Fun::Inj { case }, vec![evar(&saved)]),
        ));
        wrap(binds, Expr::Tuple(vec![evar(&d.result), evar(&tagged)]))
    }

    fn rev_arm(&mut self, case: usize, d: &Diff, tagged: &Var, var: &Var, shared: &[Var]) -> Expr {
        let saved = self.names.var("saved", d.trace.ty());
        let mut binds = vec![Bind::Let(
            saved.clone(),
            Expr::Call(Fun::Prj { case }, vec![evar(tagged)]),
        )];
        binds.extend(d.trace.unpack(&saved, self.names));
        binds.push(Bind::Let(d.result.adjoint(), Expr::Var(var.adjoint())));
        binds.extend(d.bwd.clone());
        wrap(
            binds,
            Expr::Tuple(shared.iter().map(|v| Expr::Var(v.adjoint())).collect()),
        )
    }

    /// Differentiates `let var = forRange(n, init, \si. body)`.
    ///
    /// The body is differentiated once. The forward loop carries the state
    /// alongside a vector of per-iteration packed traces, written with
    /// `vecSet` at the iteration index. The reverse loop runs the same
    /// number of times, reads entry `n - 1 - j` on its `j`-th iteration,
    /// and threads the state adjoint backwards through the body's reverse
    /// bindings.
    fn loop_(&mut self, var: &Var, args: &[Expr], rest: Diff) -> Result<Diff, Error> {
        let (n, init, si, body) = match args {
            [n, init, Expr::Lam { arg, body }] => {
                (Atom::from_expr(n)?, Atom::from_expr(init)?, arg, body.as_ref())
            }
            _ => return Err(Error::MissingLambda(Prim::ForRange)),
        };
        if body.free_vars().iter().any(|v| v.name != si.name) {
            return Err(Error::OpenLoopBody);
        }
        let state_ty = match &si.ty {
            Ty::Tuple(ms) => match ms.as_slice() {
                [Ty::Int, s] => s.clone(),
                _ => return Err(Error::LoopArg),
            },
            _ => return Err(Error::LoopArg),
        };
        let db = self.expr(body)?;
        if db.result.ty != state_ty {
            return Err(Error::LoopArg);
        }
        let saved_ty = db.trace.ty();
        let trace_vec_ty = Ty::vec(saved_ty.clone());
        let aug_ty = Ty::tuple(vec![state_ty.clone(), trace_vec_ty.clone()]);

        // Forward: unpack the augmented state, rebuild the original loop
        // argument, run the body, and record its packed trace at index i.
        let si2 = self.names.var("si", Ty::tuple(vec![Ty::Int, aug_ty.clone()]));
        let i = self.names.var("i", Ty::Int);
        let s2 = self.names.var("s", aug_ty.clone());
        let s1 = self.names.var("s", state_ty.clone());
        let trv = self.names.var("tr", trace_vec_ty.clone());
        let saved = self.names.var("saved", saved_ty.clone());
        let trv2 = self.names.var("tr", trace_vec_ty.clone());
        let mut binds = vec![
            Bind::Untuple(vec![i.clone(), s2.clone()], evar(&si2)),
            Bind::Untuple(vec![s1.clone(), trv.clone()], evar(&s2)),
            Bind::Let(si.clone(), Expr::Tuple(vec![evar(&i), evar(&s1)])),
        ];
        binds.extend(db.fwd.clone());
        binds.push(Bind::Let(saved.clone(), db.trace.pack()));
        binds.push(Bind::Let(
            trv2.clone(),
            prim(Prim::VecSet, vec![evar(&trv), evar(&i), evar(&saved)]),
        ));
        let fwd_lam = Expr::Lam {
            arg: si2,
            body: Box::new(wrap(binds, Expr::Tuple(vec![evar(&db.result), evar(&trv2)]))),
        };

        let tr0 = self.names.var("tr", trace_vec_ty.clone());
        let s0 = self.names.var("s", aug_ty.clone());
        let pair = self.names.var("loop", aug_ty);
        let trf = self.names.var("tr", trace_vec_ty);
        let fwd = vec![
            Bind::Let(
                tr0.clone(),
                prim(Prim::VecConst, vec![n.expr(), zero(&saved_ty)?]),
            ),
            Bind::Let(s0.clone(), Expr::Tuple(vec![init.expr(), evar(&tr0)])),
            Bind::Let(
                pair.clone(),
                Expr::Call(Fun::Prim(Prim::ForRange), vec![n.expr(), evar(&s0), fwd_lam]),
            ),
            Bind::Untuple(vec![var.clone(), trf.clone()], evar(&pair)),
        ];
        let mut group = Vec::new();
        if let Some(v) = n.var() {
            group.push(v.clone());
        }
        group.push(trf.clone());

        // Reverse: iteration j of the reverse loop undoes iteration
        // n - 1 - j of the forward one.
        let dstate_ty = state_ty.tangent();
        let dsj = self.names.var("ds", Ty::tuple(vec![Ty::Int, dstate_ty.clone()]));
        let j = self.names.var("j", Ty::Int);
        let ds = self.names.var("ds", dstate_ty.clone());
        let idx = self.names.var("i", Ty::Int);
        let saved2 = self.names.var("saved", saved_ty);
        let di = self.names.var("di", Ty::unit());
        let dprev = self.names.var("ds", dstate_ty.clone());
        let mut binds = vec![
            Bind::Untuple(vec![j.clone(), ds.clone()], evar(&dsj)),
            Bind::Let(
                idx.clone(),
                prim(
                    Prim::Sub,
                    vec![
                        prim(Prim::Sub, vec![n.expr(), Expr::Konst(Konst::Int(1))]),
                        evar(&j),
                    ],
                ),
            ),
            Bind::Let(
                saved2.clone(),
                prim(Prim::Index, vec![evar(&idx), evar(&trf)]),
            ),
        ];
        binds.extend(db.trace.unpack(&saved2, self.names));
        binds.push(Bind::Let(db.result.adjoint(), evar(&ds)));
        binds.extend(db.bwd.clone());
        binds.push(Bind::Untuple(
            vec![di, dprev.clone()],
            Expr::Var(si.adjoint()),
        ));
        let rev_lam = Expr::Lam {
            arg: dsj,
            body: Box::new(wrap(binds, evar(&dprev))),
        };

        let target = match init.var() {
            Some(v) => v.adjoint(),
            None => self.names.var("ds", dstate_ty),
        };
        let mut bwd = vec![Bind::Let(
            target,
            Expr::Call(
                Fun::Prim(Prim::ForRange),
                vec![n.expr(), Expr::Var(var.adjoint()), rev_lam],
            ),
        )];
        if let Some(v) = n.var() {
            bwd.push(Bind::Let(v.adjoint(), Expr::Tuple(vec![])));
        }
        Ok(Diff::compose(fwd, group, bwd, rest))
    }
}

/// Builds the linear-gradient twin of a definition: same parameters plus a
/// trailing result adjoint, returning the tuple of parameter adjoints.
pub fn lin_grad(def: &Def) -> Result<Def, Error> {
    let mut names = NameGen::new();
    let lin = pullback_linearize::linearize(def, &mut names)?;
    let Some(body) = &lin.body else {
        return Err(Error::Stub(def.id.clone()));
    };
    let d = diff(body, &mut names)?;
    let dret = Var::new("$dret", def.ret.tangent());
    let mut binds = d.fwd;
    binds.push(Bind::Let(d.result.adjoint(), Expr::Var(dret.clone())));
    binds.extend(d.bwd);
    let tail = Expr::Tuple(def.params.iter().map(|p| Expr::Var(p.adjoint())).collect());
    let mut params = def.params.clone();
    params.push(dret);
    Ok(Def {
        id: def.id.lin_grad(),
        params,
        ret: Ty::tuple(def.params.iter().map(|p| p.ty.tangent()).collect()),
        body: Some(wrap(binds, tail)),
    })
}

/// Emits each definition followed by its linear-gradient twin. Derived
/// definitions pass through unchanged; a missing body is an error.
pub fn differentiate(defs: &[Def]) -> Result<Vec<Def>, Error> {
    let mut out = Vec::with_capacity(defs.len() * 2);
    for def in defs {
        if def.body.is_none() {
            return Err(Error::Stub(def.id.clone()));
        }
        out.push(def.clone());
        if def.id.flavor == Flavor::Plain {
            out.push(lin_grad(def)?);
        }
    }
    Ok(out)
}
