//! Checks the linear-usage invariant on a linearized expression: every
//! `Let`-, `Untuple`- or `Dup`-bound variable is consumed at most once in
//! the remainder of its scope, and every `Drop`ped variable not at all.
//!
//! The two arms of a conditional are alternatives, so a variable may be
//! consumed once in each arm; consumption of an `If` is the maximum over
//! its arms, plus the condition.

use pullback::{Def, Expr, Var};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("variable `{0}` is consumed more than once")]
    Reused(String),

    #[error("discarded variable `{0}` is still consumed")]
    UsedAfterDrop(String),
}

/// Number of times `var` is consumed by `expr`, counting conditional arms
/// as alternatives rather than summing them.
fn consumed(expr: &Expr, var: &Var) -> usize {
    match expr {
        Expr::Var(v) => usize::from(v.name == var.name),
        Expr::Konst(_) => 0,
        Expr::Tuple(members) => members.iter().map(|e| consumed(e, var)).sum(),
        Expr::Call(_, args) => args.iter().map(|e| consumed(e, var)).sum(),
        Expr::Let { var: v, bind, body } => {
            let mut n = consumed(bind, var);
            if v.name != var.name {
                n += consumed(body, var);
            }
            n
        }
        Expr::Untuple { vars, tuple, body } => {
            let mut n = consumed(tuple, var);
            if vars.iter().all(|v| v.name != var.name) {
                n += consumed(body, var);
            }
            n
        }
        Expr::If { cond, then, els } => {
            consumed(cond, var) + consumed(then, var).max(consumed(els, var))
        }
        Expr::Assert { cond, body } => consumed(cond, var) + consumed(body, var),
        Expr::Dup {
            left,
            right,
            from,
            body,
        } => {
            let mut n = usize::from(from.name == var.name);
            if left.name != var.name && right.name != var.name {
                n += consumed(body, var);
            }
            n
        }
        Expr::Drop { var: v, body } => usize::from(v.name == var.name) + consumed(body, var),
        Expr::Lam { arg, body } => {
            if arg.name == var.name {
                0
            } else {
                consumed(body, var)
            }
        }
    }
}

fn at_most_once(var: &Var, scope: &Expr) -> Result<(), Error> {
    if consumed(scope, var) > 1 {
        Err(Error::Reused(var.name.to_string()))
    } else {
        Ok(())
    }
}

/// Checks every binder in `expr`.
pub fn check(expr: &Expr) -> Result<(), Error> {
    match expr {
        Expr::Var(_) | Expr::Konst(_) | Expr::Tuple(_) | Expr::Call(_, _) => Ok(()),
        Expr::Let { var, bind, body } => {
            check(bind)?;
            at_most_once(var, body)?;
            check(body)
        }
        Expr::Untuple { vars, body, .. } => {
            for var in vars {
                at_most_once(var, body)?;
            }
            check(body)
        }
        Expr::If { then, els, .. } => {
            check(then)?;
            check(els)
        }
        Expr::Assert { body, .. } => check(body),
        Expr::Dup {
            left, right, body, ..
        } => {
            at_most_once(left, body)?;
            at_most_once(right, body)?;
            check(body)
        }
        Expr::Drop { var, body } => {
            if consumed(body, var) > 0 {
                return Err(Error::UsedAfterDrop(var.name.to_string()));
            }
            check(body)
        }
        Expr::Lam { body, .. } => check(body),
    }
}

/// Checks a definition's body, plus single consumption of each parameter.
pub fn check_def(def: &Def) -> Result<(), Error> {
    if let Some(body) = &def.body {
        for param in &def.params {
            at_most_once(param, body)?;
        }
        check(body)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullback::ty::Ty;
    use pullback::{Fun, Prim};

    fn float(name: &str) -> Var {
        Var::new(name, Ty::Float)
    }

    fn var(name: &str) -> Expr {
        Expr::Var(float(name))
    }

    #[test]
    fn test_double_use_is_rejected() {
        // let r = mul(x, x) in r
        let e = Expr::Let {
            var: float("r"),
            bind: Box::new(Expr::Call(Fun::Prim(Prim::Mul), vec![var("x"), var("x")])),
            body: Box::new(var("r")),
        };
        // `x` is a free variable here, but the let-bound `r` is fine; the
        // reuse shows up when `x` is bound by a dup above.
        let e = Expr::Dup {
            left: float("x"),
            right: float("y"),
            from: float("z"),
            body: Box::new(e),
        };
        assert!(matches!(check(&e), Err(Error::Reused(name)) if name == "x"));
    }

    #[test]
    fn test_use_in_each_branch_is_linear() {
        // if c then x else x: one consumption per alternative
        let e = Expr::Let {
            var: float("x"),
            bind: Box::new(var("y")),
            body: Box::new(Expr::If {
                cond: Box::new(Expr::Var(Var::new("c", Ty::Bool))),
                then: Box::new(var("x")),
                els: Box::new(var("x")),
            }),
        };
        check(&e).unwrap();
    }

    #[test]
    fn test_use_after_drop_is_rejected() {
        let e = Expr::Drop {
            var: float("x"),
            body: Box::new(var("x")),
        };
        assert!(matches!(check(&e), Err(Error::UsedAfterDrop(name)) if name == "x"));
    }
}
