//! Rewrites an ANF expression so that every bound variable is consumed
//! exactly once downstream: reused variables are split with explicit `Dup`
//! nodes, unused ones are discarded with explicit `Drop` nodes, and the two
//! arms of a conditional are padded to consume the same surrounding
//! variables. The output is value-equivalent to the input and satisfies the
//! linear-usage invariant the differentiation engine relies on.

use enumset::{enum_set, EnumSet};
use indexmap::IndexSet;
use pullback::{Def, Expr, Fun, FunId, NameGen, Prim, Var};

/// Primitives whose trailing argument is a lambda.
const HIGHER_ORDER: EnumSet<Prim> = enum_set!(Prim::Build | Prim::ForRange);

/// Input-contract violations. All of these mean the upstream normalizer
/// failed its contract; none are recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("call argument is a nested expression, not a variable or constant")]
    ArgNotAtom,

    #[error("condition of a conditional is not a variable reference")]
    CondNotVar,

    #[error("condition of an assertion is not a variable reference")]
    AssertCondNotVar,

    #[error("source of a destructuring bind is not a variable reference")]
    UntupleNotVar,

    #[error("lambda outside of a higher-order primitive")]
    StrayLambda,

    #[error("`{0}` expects a lambda as its final argument")]
    MissingLambda(Prim),

    #[error("binding is not in administrative normal form")]
    BindNotAnf,

    #[error("definition `{0}` has no body")]
    Stub(FunId),
}

/// Linearizes one definition. Parameters that the body provably never uses
/// get `Drop` nodes wrapped around the body first.
pub fn linearize(def: &Def, names: &mut NameGen) -> Result<Def, Error> {
    let body = def.body.as_ref().ok_or_else(|| Error::Stub(def.id.clone()))?;
    let mut wrapped = body.clone();
    for param in def.params.iter().rev() {
        if wrapped.uses(param) == 0 {
            wrapped = Expr::Drop {
                var: param.clone(),
                body: Box::new(wrapped),
            };
        }
    }
    Ok(Def {
        id: def.id.clone(),
        params: def.params.clone(),
        ret: def.ret.clone(),
        body: Some(linearize_expr(&wrapped, names)?),
    })
}

/// Linearizes one expression.
pub fn linearize_expr(expr: &Expr, names: &mut NameGen) -> Result<Expr, Error> {
    match expr {
        Expr::Var(_) | Expr::Konst(_) => Ok(expr.clone()),

        Expr::Tuple(members) => {
            let (members, dups) = atoms(members, &IndexSet::new(), names)?;
            Ok(dup_chain(dups, Expr::Tuple(members)))
        }

        Expr::Call(f, args) => {
            let (dups, call) = call(f, args, &IndexSet::new(), names)?;
            Ok(dup_chain(dups, call))
        }

        Expr::Let { var, bind, body } => {
            let body = linearize_expr(body, names)?;
            let body = drop_unless_used(var.clone(), body);
            let later = body.free_vars();
            match bind.as_ref() {
                Expr::Var(_) | Expr::Konst(_) => {
                    let (bind, dups) = atom(bind, &later, names)?;
                    Ok(dup_chain(
                        dups,
                        Expr::Let {
                            var: var.clone(),
                            bind: Box::new(bind),
                            body: Box::new(body),
                        },
                    ))
                }
                Expr::Tuple(members) => {
                    let (members, dups) = atoms(members, &later, names)?;
                    Ok(dup_chain(
                        dups,
                        Expr::Let {
                            var: var.clone(),
                            bind: Box::new(Expr::Tuple(members)),
                            body: Box::new(body),
                        },
                    ))
                }
                Expr::Call(f, args) => {
                    let (dups, call) = call(f, args, &later, names)?;
                    Ok(dup_chain(
                        dups,
                        Expr::Let {
                            var: var.clone(),
                            bind: Box::new(call),
                            body: Box::new(body),
                        },
                    ))
                }
                Expr::If { cond, then, els } => {
                    let (dups, cond) = conditional(cond, then, els, &later, names)?;
                    Ok(dup_chain(
                        dups,
                        Expr::Let {
                            var: var.clone(),
                            bind: Box::new(cond),
                            body: Box::new(body),
                        },
                    ))
                }
                Expr::Lam { .. } => Err(Error::StrayLambda),
                Expr::Let { .. }
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
            let mut body = linearize_expr(body, names)?;
            for var in vars.iter().rev() {
                body = drop_unless_used(var.clone(), body);
            }
            let later = body.free_vars();
            let (tuple, dups) = atom(&Expr::Var(src), &later, names)?;
            Ok(dup_chain(
                dups,
                Expr::Untuple {
                    vars: vars.clone(),
                    tuple: Box::new(tuple),
                    body: Box::new(body),
                },
            ))
        }

        Expr::If { cond, then, els } => {
            let (dups, out) = conditional(cond, then, els, &IndexSet::new(), names)?;
            Ok(dup_chain(dups, out))
        }

        Expr::Assert { cond, body } => {
            match cond.as_ref() {
                Expr::Var(_) => {}
                _ => return Err(Error::AssertCondNotVar),
            }
            Ok(Expr::Assert {
                cond: cond.clone(),
                body: Box::new(linearize_expr(body, names)?),
            })
        }

        // Already-linear input passes through untouched.
        Expr::Dup {
            left,
            right,
            from,
            body,
        } => Ok(Expr::Dup {
            left: left.clone(),
            right: right.clone(),
            from: from.clone(),
            body: Box::new(linearize_expr(body, names)?),
        }),
        Expr::Drop { var, body } => Ok(Expr::Drop {
            var: var.clone(),
            body: Box::new(linearize_expr(body, names)?),
        }),

        Expr::Lam { .. } => Err(Error::StrayLambda),
    }
}

fn drop_unless_used(var: Var, body: Expr) -> Expr {
    if body.uses(&var) == 0 {
        Expr::Drop {
            var,
            body: Box::new(body),
        }
    } else {
        body
    }
}

/// Wraps `tail` in one `Dup` per `(alias, original)` pair, outermost first.
/// The original name is rebound by the dup, so it stays free downstream.
fn dup_chain(dups: Vec<(Var, Var)>, tail: Expr) -> Expr {
    dups.into_iter().rev().fold(tail, |body, (alias, orig)| Expr::Dup {
        left: alias,
        right: orig.clone(),
        from: orig,
        body: Box::new(body),
    })
}

/// Checks that `arg` is an atom, aliasing it when it is a variable that is
/// consumed again in `later`.
fn atom(
    arg: &Expr,
    later: &IndexSet<Var>,
    names: &mut NameGen,
) -> Result<(Expr, Vec<(Var, Var)>), Error> {
    match arg {
        Expr::Var(v) if later.contains(v) => {
            let alias = Var::new(names.fresh(&v.name), v.ty.clone());
            Ok((Expr::Var(alias.clone()), vec![(alias, v.clone())]))
        }
        Expr::Var(_) | Expr::Konst(_) => Ok((arg.clone(), Vec::new())),
        _ => Err(Error::ArgNotAtom),
    }
}

/// Checks that `args` are atoms and routes every argument variable that is
/// consumed again (in a later argument or in `later`) through a fresh alias.
fn atoms(
    args: &[Expr],
    later: &IndexSet<Var>,
    names: &mut NameGen,
) -> Result<(Vec<Expr>, Vec<(Var, Var)>), Error> {
    let mut out = Vec::with_capacity(args.len());
    let mut dups = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            Expr::Var(v) => {
                let reused = later.contains(v)
                    || args[i + 1..].iter().any(|rest| rest.uses(v) > 0);
                if reused {
                    let alias = Var::new(names.fresh(&v.name), v.ty.clone());
                    dups.push((alias.clone(), v.clone()));
                    out.push(Expr::Var(alias));
                } else {
                    out.push(arg.clone());
                }
            }
            Expr::Konst(_) => out.push(arg.clone()),
            _ => return Err(Error::ArgNotAtom),
        }
    }
    Ok((out, dups))
}

/// Linearizes a call. For higher-order primitives the trailing lambda's
/// body is linearized in place; every other argument must be an atom.
fn call(
    f: &Fun,
    args: &[Expr],
    later: &IndexSet<Var>,
    names: &mut NameGen,
) -> Result<(Vec<(Var, Var)>, Expr), Error> {
    if let Fun::Prim(p) = f {
        if HIGHER_ORDER.contains(*p) {
            let (lam, rest) = match args.split_last() {
                Some((Expr::Lam { arg, body }, rest)) => {
                    let body = linearize_expr(body, names)?;
                    let body = drop_unless_used(arg.clone(), body);
                    (
                        Expr::Lam {
                            arg: arg.clone(),
                            body: Box::new(body),
                        },
                        rest,
                    )
                }
                _ => return Err(Error::MissingLambda(*p)),
            };
            let (mut out, dups) = atoms(rest, later, names)?;
            out.push(lam);
            return Ok((dups, Expr::Call(f.clone(), out)));
        }
    }
    let (out, dups) = atoms(args, later, names)?;
    Ok((dups, Expr::Call(f.clone(), out)))
}

/// Linearizes both arms of a conditional, splits variables the arms share
/// with the downstream continuation, and pads each arm with `Drop`s so both
/// consume the same surrounding variable set.
fn conditional(
    cond: &Expr,
    then: &Expr,
    els: &Expr,
    later: &IndexSet<Var>,
    names: &mut NameGen,
) -> Result<(Vec<(Var, Var)>, Expr), Error> {
    let c = match cond {
        Expr::Var(v) => v.clone(),
        _ => return Err(Error::CondNotVar),
    };
    let mut then = linearize_expr(then, names)?;
    let mut els = linearize_expr(els, names)?;

    let mut union = then.free_vars();
    union.extend(els.free_vars());

    let mut dups = Vec::new();

    // The condition itself may be consumed again, by an arm or downstream.
    let c = if union.contains(&c) || later.contains(&c) {
        let alias = Var::new(names.fresh(&c.name), c.ty.clone());
        dups.push((alias.clone(), c));
        alias
    } else {
        c
    };

    // Variables consumed both by an arm and by the continuation get a fresh
    // alias inside both arms.
    let shared: Vec<Var> = union.iter().filter(|v| later.contains(*v)).cloned().collect();
    for v in shared {
        let alias = Var::new(names.fresh(&v.name), v.ty.clone());
        then = then.rename(&v, &alias);
        els = els.rename(&v, &alias);
        union.swap_remove(&v);
        union.insert(alias.clone());
        dups.push((alias, v));
    }

    // Pad: each arm discards whatever only the other arm consumes.
    for v in union.iter() {
        if then.uses(v) == 0 {
            then = Expr::Drop {
                var: v.clone(),
                body: Box::new(then),
            };
        }
        if els.uses(v) == 0 {
            els = Expr::Drop {
                var: v.clone(),
                body: Box::new(els),
            };
        }
    }

    Ok((
        dups,
        Expr::If {
            cond: Box::new(Expr::Var(c)),
            then: Box::new(then),
            els: Box::new(els),
        },
    ))
}
