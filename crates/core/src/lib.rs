pub mod build;
pub mod ty;

use std::fmt;
use std::rc::Rc;

use enumset::EnumSetType;
use indexmap::IndexSet;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use ty::Ty;

/// A typed variable. Two variables denote the same binding iff their names
/// are equal; the annotator guarantees that equal names carry equal types.
///
/// Names containing `$` are reserved for generated variables ([`NameGen`],
/// [`Var::adjoint`]); the front end never produces them.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: Rc<str>,
    pub ty: Ty,
}

impl Var {
    pub fn new(name: impl Into<Rc<str>>, ty: Ty) -> Self {
        Var {
            name: name.into(),
            ty,
        }
    }

    /// The reverse counterpart of this variable: `d$x`, at the tangent type.
    pub fn adjoint(&self) -> Var {
        Var {
            name: format!("d${}", self.name).into(),
            ty: self.ty.tangent(),
        }
    }
}

/// A constant literal.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Konst {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Konst {
    pub fn ty(&self) -> Ty {
        match self {
            Konst::Bool(_) => Ty::Bool,
            Konst::Int(_) => Ty::Int,
            Konst::Float(_) => Ty::Float,
        }
    }
}

/// A primitive operation.
///
/// `Index`, `Size`, `DeltaVec`, `VecConst` and `VecSet` only appear in
/// generated code (trace plumbing); the annotator never emits them.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(EnumSetType, Debug, Hash)]
pub enum Prim {
    /// Structural addition; on tangent values it adds pointwise.
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Eq,
    Gt,
    Log,
    Exp,
    /// `indexL(i, xs)`: element read that yields a zero value out of range.
    IndexL,
    /// `index(i, xs)`: plain element read.
    Index,
    /// `size(xs)`: vector length.
    Size,
    /// `deltaVec(n, i, x)`: length-`n` vector, zero except `x` at `i`.
    DeltaVec,
    /// `vecConst(n, x)`: length-`n` vector filled with `x`.
    VecConst,
    /// `vecSet(xs, i, x)`: functional update of one element.
    VecSet,
    Build,
    Sum,
    ForRange,
    Rand,
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Prim::Add => "add",
            Prim::Sub => "sub",
            Prim::Mul => "mul",
            Prim::Div => "div",
            Prim::Neg => "neg",
            Prim::Eq => "eq",
            Prim::Gt => "gt",
            Prim::Log => "log",
            Prim::Exp => "exp",
            Prim::IndexL => "indexL",
            Prim::Index => "index",
            Prim::Size => "size",
            Prim::DeltaVec => "deltaVec",
            Prim::VecConst => "vecConst",
            Prim::VecSet => "vecSet",
            Prim::Build => "build",
            Prim::Sum => "sum",
            Prim::ForRange => "forRange",
            Prim::Rand => "$rand",
        };
        write!(f, "{name}")
    }
}

/// Which derivative variant of a definition a name refers to.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flavor {
    Plain,
    /// A differentiated (linear-map) variant, `D$f`.
    Deriv,
    /// A gradient variant, `grad$f`.
    Grad,
    /// A linear-gradient variant, `rev$f`.
    LinGrad,
}

/// The name of a definition, including its derivative-variant tag.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunId {
    pub name: Rc<str>,
    pub flavor: Flavor,
}

impl FunId {
    pub fn plain(name: impl Into<Rc<str>>) -> Self {
        FunId {
            name: name.into(),
            flavor: Flavor::Plain,
        }
    }

    /// The linear-gradient twin of this name.
    pub fn lin_grad(&self) -> Self {
        FunId {
            name: self.name.clone(),
            flavor: Flavor::LinGrad,
        }
    }
}

impl fmt::Display for FunId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.flavor {
            Flavor::Plain => write!(f, "{}", self.name),
            Flavor::Deriv => write!(f, "D${}", self.name),
            Flavor::Grad => write!(f, "grad${}", self.name),
            Flavor::LinGrad => write!(f, "rev${}", self.name),
        }
    }
}

/// A callee: primitive, tuple projection, trace-union constructor, or a
/// user definition.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Fun {
    Prim(Prim),
    /// Projection of one member out of an `arity`-tuple.
    Proj { member: usize, arity: usize },
    /// Injection into a trace union (generated code only).
    Inj { case: usize },
    /// Checked extraction from a trace union (generated code only).
    Prj { case: usize },
    Def(FunId),
}

/// The expression tree. A closed sum; every consumer matches exhaustively.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Var(Var),
    Konst(Konst),
    Tuple(Vec<Expr>),
    Call(Fun, Vec<Expr>),
    Let {
        var: Var,
        bind: Box<Expr>,
        body: Box<Expr>,
    },
    /// Destructuring bind of a tuple into its members.
    Untuple {
        vars: Vec<Var>,
        tuple: Box<Expr>,
        body: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },
    /// Guarded body; the condition does not get a derivative-bearing
    /// treatment.
    Assert {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    /// Splits `from` into two aliases with independent linear use
    /// downstream. Consumes `from`.
    Dup {
        left: Var,
        right: Var,
        from: Var,
        body: Box<Expr>,
    },
    /// Marks `var` as deliberately unused. Consumes `var`.
    Drop {
        var: Var,
        body: Box<Expr>,
    },
    /// Loop and `build` bodies only.
    Lam {
        arg: Var,
        body: Box<Expr>,
    },
}

impl Expr {
    /// The free variables of this expression, in first-occurrence order.
    ///
    /// `Dup` and `Drop` count as uses of the variable they consume.
    pub fn free_vars(&self) -> IndexSet<Var> {
        let mut out = IndexSet::new();
        let mut bound = Vec::new();
        self.collect_free(&mut bound, &mut out);
        out
    }

    fn collect_free(&self, bound: &mut Vec<Rc<str>>, out: &mut IndexSet<Var>) {
        match self {
            Expr::Var(v) => {
                if !bound.contains(&v.name) {
                    out.insert(v.clone());
                }
            }
            Expr::Konst(_) => {}
            Expr::Tuple(members) => {
                for member in members {
                    member.collect_free(bound, out);
                }
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_free(bound, out);
                }
            }
            Expr::Let { var, bind, body } => {
                bind.collect_free(bound, out);
                bound.push(var.name.clone());
                body.collect_free(bound, out);
                bound.pop();
            }
            Expr::Untuple { vars, tuple, body } => {
                tuple.collect_free(bound, out);
                for var in vars {
                    bound.push(var.name.clone());
                }
                body.collect_free(bound, out);
                for _ in vars {
                    bound.pop();
                }
            }
            Expr::If { cond, then, els } => {
                cond.collect_free(bound, out);
                then.collect_free(bound, out);
                els.collect_free(bound, out);
            }
            Expr::Assert { cond, body } => {
                cond.collect_free(bound, out);
                body.collect_free(bound, out);
            }
            Expr::Dup {
                left,
                right,
                from,
                body,
            } => {
                if !bound.contains(&from.name) {
                    out.insert(from.clone());
                }
                bound.push(left.name.clone());
                bound.push(right.name.clone());
                body.collect_free(bound, out);
                bound.pop();
                bound.pop();
            }
            Expr::Drop { var, body } => {
                if !bound.contains(&var.name) {
                    out.insert(var.clone());
                }
                body.collect_free(bound, out);
            }
            Expr::Lam { arg, body } => {
                bound.push(arg.name.clone());
                body.collect_free(bound, out);
                bound.pop();
            }
        }
    }

    /// Number of free occurrences of `var` in this expression.
    pub fn uses(&self, var: &Var) -> usize {
        match self {
            Expr::Var(v) => usize::from(v.name == var.name),
            Expr::Konst(_) => 0,
            Expr::Tuple(members) => members.iter().map(|e| e.uses(var)).sum(),
            Expr::Call(_, args) => args.iter().map(|e| e.uses(var)).sum(),
            Expr::Let { var: v, bind, body } => {
                let mut n = bind.uses(var);
                if v.name != var.name {
                    n += body.uses(var);
                }
                n
            }
            Expr::Untuple { vars, tuple, body } => {
                let mut n = tuple.uses(var);
                if vars.iter().all(|v| v.name != var.name) {
                    n += body.uses(var);
                }
                n
            }
            Expr::If { cond, then, els } => cond.uses(var) + then.uses(var) + els.uses(var),
            Expr::Assert { cond, body } => cond.uses(var) + body.uses(var),
            Expr::Dup {
                left,
                right,
                from,
                body,
            } => {
                let mut n = usize::from(from.name == var.name);
                if left.name != var.name && right.name != var.name {
                    n += body.uses(var);
                }
                n
            }
            Expr::Drop { var: v, body } => usize::from(v.name == var.name) + body.uses(var),
            Expr::Lam { arg, body } => {
                if arg.name == var.name {
                    0
                } else {
                    body.uses(var)
                }
            }
        }
    }

    /// Replaces free occurrences of `from` with `to`. `to` must be fresh,
    /// so the substitution cannot capture.
    pub fn rename(&self, from: &Var, to: &Var) -> Expr {
        let sub = |v: &Var| -> Var {
            if v.name == from.name {
                to.clone()
            } else {
                v.clone()
            }
        };
        match self {
            Expr::Var(v) => Expr::Var(sub(v)),
            Expr::Konst(k) => Expr::Konst(*k),
            Expr::Tuple(members) => {
                Expr::Tuple(members.iter().map(|e| e.rename(from, to)).collect())
            }
            Expr::Call(f, args) => {
                Expr::Call(f.clone(), args.iter().map(|e| e.rename(from, to)).collect())
            }
            Expr::Let { var, bind, body } => Expr::Let {
                var: var.clone(),
                bind: Box::new(bind.rename(from, to)),
                body: if var.name == from.name {
                    body.clone()
                } else {
                    Box::new(body.rename(from, to))
                },
            },
            Expr::Untuple { vars, tuple, body } => Expr::Untuple {
                vars: vars.clone(),
                tuple: Box::new(tuple.rename(from, to)),
                body: if vars.iter().any(|v| v.name == from.name) {
                    body.clone()
                } else {
                    Box::new(body.rename(from, to))
                },
            },
            Expr::If { cond, then, els } => Expr::If {
                cond: Box::new(cond.rename(from, to)),
                then: Box::new(then.rename(from, to)),
                els: Box::new(els.rename(from, to)),
            },
            Expr::Assert { cond, body } => Expr::Assert {
                cond: Box::new(cond.rename(from, to)),
                body: Box::new(body.rename(from, to)),
            },
            Expr::Dup {
                left,
                right,
                from: src,
                body,
            } => Expr::Dup {
                left: left.clone(),
                right: right.clone(),
                from: sub(src),
                body: if left.name == from.name || right.name == from.name {
                    body.clone()
                } else {
                    Box::new(body.rename(from, to))
                },
            },
            Expr::Drop { var, body } => Expr::Drop {
                var: sub(var),
                body: Box::new(body.rename(from, to)),
            },
            Expr::Lam { arg, body } => Expr::Lam {
                arg: arg.clone(),
                body: if arg.name == from.name {
                    body.clone()
                } else {
                    Box::new(body.rename(from, to))
                },
            },
        }
    }
}

/// A user definition. `body` is `None` for declaration-only stubs.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Def {
    pub id: FunId,
    pub params: Vec<Var>,
    pub ret: Ty,
    pub body: Option<Expr>,
}

/// Fresh-name generator: a sequential counter scoped to one definition's
/// transformation, so renaming is deterministic.
#[derive(Debug, Default)]
pub struct NameGen {
    next: usize,
}

impl NameGen {
    pub fn new() -> Self {
        NameGen::default()
    }

    pub fn fresh(&mut self, base: &str) -> Rc<str> {
        let n = self.next;
        self.next += 1;
        format!("{base}${n}").into()
    }

    pub fn var(&mut self, base: &str, ty: Ty) -> Var {
        Var {
            name: self.fresh(base),
            ty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(name: &str) -> Var {
        Var::new(name, Ty::Float)
    }

    #[test]
    fn test_adjoint_name_and_type() {
        let v = Var::new("x", Ty::tuple(vec![Ty::Float, Ty::Int]));
        let d = v.adjoint();
        assert_eq!(&*d.name, "d$x");
        assert_eq!(d.ty, Ty::tuple(vec![Ty::Float, Ty::unit()]));
    }

    #[test]
    fn test_free_vars_respects_shadowing() {
        // let x = y in x
        let e = Expr::Let {
            var: float("x"),
            bind: Box::new(Expr::Var(float("y"))),
            body: Box::new(Expr::Var(float("x"))),
        };
        let free = e.free_vars();
        assert_eq!(free.len(), 1);
        assert!(free.contains(&float("y")));
    }

    #[test]
    fn test_drop_and_dup_count_as_uses() {
        let e = Expr::Drop {
            var: float("a"),
            body: Box::new(Expr::Var(float("b"))),
        };
        assert_eq!(e.uses(&float("a")), 1);
        let e = Expr::Dup {
            left: float("a1"),
            right: float("a2"),
            from: float("a"),
            body: Box::new(Expr::Var(float("a1"))),
        };
        assert_eq!(e.uses(&float("a")), 1);
        assert!(e.free_vars().contains(&float("a")));
    }

    #[test]
    fn test_rename_stops_at_binders() {
        // let x = x in x: only the bind-position occurrence is free
        let e = Expr::Let {
            var: float("x"),
            bind: Box::new(Expr::Var(float("x"))),
            body: Box::new(Expr::Var(float("x"))),
        };
        let renamed = e.rename(&float("x"), &float("z"));
        match renamed {
            Expr::Let { bind, body, .. } => {
                assert_eq!(*bind, Expr::Var(float("z")));
                assert_eq!(*body, Expr::Var(float("x")));
            }
            _ => panic!("expected let"),
        }
    }

    #[test]
    fn test_fresh_names_are_deterministic() {
        let mut names = NameGen::new();
        assert_eq!(&*names.fresh("x"), "x$0");
        assert_eq!(&*names.fresh("x"), "x$1");
        let mut again = NameGen::new();
        assert_eq!(&*again.fresh("x"), "x$0");
    }
}
