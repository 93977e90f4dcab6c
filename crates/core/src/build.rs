//! Helpers for assembling let-chains without nesting at every construction
//! site. The transforms accumulate a `Vec<Bind>` for forward and reverse
//! code and wrap a tail expression once at the end.

use crate::{Expr, Var};

/// One binding prefix of a let-chain.
#[derive(Clone, Debug, PartialEq)]
pub enum Bind {
    Let(Var, Expr),
    Untuple(Vec<Var>, Expr),
    Dup(Var, Var, Var),
    Drop(Var),
    Assert(Var),
}

/// Wraps `tail` in `binds`, first element outermost.
pub fn wrap(binds: Vec<Bind>, tail: Expr) -> Expr {
    binds.into_iter().rev().fold(tail, |body, bind| {
        let body = Box::new(body);
        match bind {
            Bind::Let(var, e) => Expr::Let {
                var,
                bind: Box::new(e),
                body,
            },
            Bind::Untuple(vars, e) => Expr::Untuple {
                vars,
                tuple: Box::new(e),
                body,
            },
            Bind::Dup(left, right, from) => Expr::Dup {
                left,
                right,
                from,
                body,
            },
            Bind::Drop(var) => Expr::Drop { var, body },
            Bind::Assert(cond) => Expr::Assert {
                cond: Box::new(Expr::Var(cond)),
                body,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Ty;

    #[test]
    fn test_wrap_order() {
        let a = Var::new("a", Ty::Float);
        let b = Var::new("b", Ty::Float);
        let e = wrap(
            vec![
                Bind::Let(a.clone(), Expr::Var(b.clone())),
                Bind::Drop(a.clone()),
            ],
            Expr::Var(b.clone()),
        );
        let expect = Expr::Let {
            var: a.clone(),
            bind: Box::new(Expr::Var(b.clone())),
            body: Box::new(Expr::Drop {
                var: a,
                body: Box::new(Expr::Var(b)),
            }),
        };
        assert_eq!(e, expect);
    }
}
