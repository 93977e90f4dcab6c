//! End-to-end checks: differentiate whole definitions, then run the
//! generated linear-gradient twins under the interpreter and compare
//! against hand-computed or finite-difference derivatives.

use pullback::ty::Ty;
use pullback::{Def, Expr, Fun, FunId, Konst, NameGen, Prim, Var};
use pullback_autodiff::differentiate;
use pullback_interp::{eval, interp, Val};

fn float(name: &str) -> Var {
    Var::new(name, Ty::Float)
}

fn var(name: &str) -> Expr {
    Expr::Var(float(name))
}

fn call2(p: Prim, a: Expr, b: Expr) -> Expr {
    Expr::Call(Fun::Prim(p), vec![a, b])
}

fn let_(name: &str, bind: Expr, body: Expr) -> Expr {
    Expr::Let {
        var: float(name),
        bind: Box::new(bind),
        body: Box::new(body),
    }
}

fn def(name: &str, params: Vec<Var>, ret: Ty, body: Expr) -> Def {
    Def {
        id: FunId::plain(name),
        params,
        ret,
        body: Some(body),
    }
}

/// Runs the linear-gradient twin of `name` and returns the adjoint tuple.
fn gradient(defs: &[Def], name: &str, mut args: Vec<Val>, dret: Val) -> Vec<Val> {
    let out = differentiate(defs).unwrap();
    args.push(dret);
    match interp(&out, &FunId::plain(name).lin_grad(), args).unwrap() {
        Val::Tuple(members) => members.to_vec(),
        other => panic!("expected a tuple of adjoints, got {other:?}"),
    }
}

fn apply(defs: &[Def], name: &str, args: Vec<Val>) -> f64 {
    match interp(defs, &FunId::plain(name), args).unwrap() {
        Val::Float(x) => x,
        other => panic!("expected a float, got {other:?}"),
    }
}

fn floats(vals: Vec<Val>) -> Vec<f64> {
    vals.into_iter()
        .map(|v| match v {
            Val::Float(x) => x,
            other => panic!("expected a float adjoint, got {other:?}"),
        })
        .collect()
}

/// Central difference of `name` in its `k`-th argument.
fn central(defs: &[Def], name: &str, args: &[f64], k: usize) -> f64 {
    let h = 1e-6;
    let mut hi = args.to_vec();
    let mut lo = args.to_vec();
    hi[k] += h;
    lo[k] -= h;
    let hi: Vec<Val> = hi.into_iter().map(Val::Float).collect();
    let lo: Vec<Val> = lo.into_iter().map(Val::Float).collect();
    (apply(defs, name, hi) - apply(defs, name, lo)) / (2.0 * h)
}

fn close(got: f64, want: f64, tol: f64) {
    assert!(
        (got - want).abs() <= tol * (1.0 + want.abs()),
        "got {got}, want {want}"
    );
}

/// f(x, y) = x * y + log(x)
fn composite() -> Def {
    let body = let_(
        "a",
        call2(Prim::Mul, var("x"), var("y")),
        let_(
            "b",
            Expr::Call(Fun::Prim(Prim::Log), vec![var("x")]),
            let_("c", call2(Prim::Add, var("a"), var("b")), var("c")),
        ),
    );
    def("f", vec![float("x"), float("y")], Ty::Float, body)
}

#[test]
fn test_product_gradient() {
    let f = def(
        "f",
        vec![float("a"), float("b")],
        Ty::Float,
        let_("r", call2(Prim::Mul, var("a"), var("b")), var("r")),
    );
    let g = gradient(&[f], "f", vec![Val::Float(3.0), Val::Float(4.0)], Val::Float(1.0));
    assert_eq!(g, vec![Val::Float(4.0), Val::Float(3.0)]);
}

#[test]
fn test_sum_gradient_scales_with_the_seed() {
    let f = def(
        "f",
        vec![float("a"), float("b")],
        Ty::Float,
        let_("r", call2(Prim::Add, var("a"), var("b")), var("r")),
    );
    let g = gradient(&[f], "f", vec![Val::Float(3.0), Val::Float(4.0)], Val::Float(2.0));
    assert_eq!(g, vec![Val::Float(2.0), Val::Float(2.0)]);
}

#[test]
fn test_difference_gradient() {
    let f = def(
        "f",
        vec![float("a"), float("b")],
        Ty::Float,
        let_("r", call2(Prim::Sub, var("a"), var("b")), var("r")),
    );
    let at = [3.0, 4.0];
    let g = gradient(
        &[f.clone()],
        "f",
        vec![Val::Float(at[0]), Val::Float(at[1])],
        Val::Float(1.0),
    );
    assert_eq!(g, vec![Val::Float(1.0), Val::Float(-1.0)]);
    close(1.0, central(&[f.clone()], "f", &at, 0), 1e-4);
    close(-1.0, central(&[f], "f", &at, 1), 1e-4);
}

#[test]
fn test_square_adds_both_contributions() {
    let f = def(
        "f",
        vec![float("x")],
        Ty::Float,
        let_("r", call2(Prim::Mul, var("x"), var("x")), var("r")),
    );
    let g = gradient(&[f], "f", vec![Val::Float(3.0)], Val::Float(1.0));
    assert_eq!(g, vec![Val::Float(6.0)]);
}

#[test]
fn test_constant_operands_carry_no_adjoint() {
    let f = def(
        "f",
        vec![float("x")],
        Ty::Float,
        let_(
            "r",
            call2(Prim::Add, var("x"), Expr::Konst(Konst::Float(2.0))),
            var("r"),
        ),
    );
    let g = gradient(&[f], "f", vec![Val::Float(3.0)], Val::Float(1.0));
    assert_eq!(g, vec![Val::Float(1.0)]);
}

#[test]
fn test_gradient_matches_finite_differences() {
    let f = composite();
    let at = [0.5, 0.25];
    let g = floats(gradient(
        &[f.clone()],
        "f",
        vec![Val::Float(at[0]), Val::Float(at[1])],
        Val::Float(1.0),
    ));
    close(g[0], central(&[f.clone()], "f", &at, 0), 1e-4);
    close(g[1], central(&[f], "f", &at, 1), 1e-4);
}

#[test]
fn test_quotient_of_exponential_matches_finite_differences() {
    // g(x) = exp(x) / x
    let g = def(
        "g",
        vec![float("x")],
        Ty::Float,
        let_(
            "a",
            Expr::Call(Fun::Prim(Prim::Exp), vec![var("x")]),
            let_("r", call2(Prim::Div, var("a"), var("x")), var("r")),
        ),
    );
    let at = [0.7];
    let d = floats(gradient(&[g.clone()], "g", vec![Val::Float(at[0])], Val::Float(1.0)));
    close(d[0], central(&[g], "g", &at, 0), 1e-4);
}

/// f(p, q) = if p > q then p * p else p + q
fn branchy() -> Def {
    let c = Var::new("c", Ty::Bool);
    let body = Expr::Let {
        var: c.clone(),
        bind: Box::new(call2(Prim::Gt, var("p"), var("q"))),
        body: Box::new(let_(
            "r",
            Expr::If {
                cond: Box::new(Expr::Var(c)),
                then: Box::new(let_("m", call2(Prim::Mul, var("p"), var("p")), var("m"))),
                els: Box::new(let_("s", call2(Prim::Add, var("p"), var("q")), var("s"))),
            },
            var("r"),
        )),
    };
    def("f", vec![float("p"), float("q")], Ty::Float, body)
}

#[test]
fn test_branch_gradient_on_the_then_side() {
    let g = gradient(
        &[branchy()],
        "f",
        vec![Val::Float(3.0), Val::Float(2.0)],
        Val::Float(1.0),
    );
    assert_eq!(g, vec![Val::Float(6.0), Val::Float(0.0)]);
}

#[test]
fn test_branch_gradient_on_the_else_side() {
    let g = gradient(
        &[branchy()],
        "f",
        vec![Val::Float(1.0), Val::Float(2.0)],
        Val::Float(1.0),
    );
    assert_eq!(g, vec![Val::Float(1.0), Val::Float(1.0)]);
}

/// f(s0) = forRange(3, s0, \(i, s). s ⊕ s)
fn looped(op: Prim) -> Def {
    let si = Var::new("si", Ty::tuple(vec![Ty::Int, Ty::Float]));
    let lam_body = Expr::Untuple {
        vars: vec![Var::new("i", Ty::Int), float("s")],
        tuple: Box::new(Expr::Var(si.clone())),
        body: Box::new(let_("t", call2(op, var("s"), var("s")), var("t"))),
    };
    let body = let_(
        "r",
        Expr::Call(
            Fun::Prim(Prim::ForRange),
            vec![
                Expr::Konst(Konst::Int(3)),
                var("s0"),
                Expr::Lam {
                    arg: si,
                    body: Box::new(lam_body),
                },
            ],
        ),
        var("r"),
    );
    def("f", vec![float("s0")], Ty::Float, body)
}

#[test]
fn test_loop_gradient_through_doubling() {
    let f = looped(Prim::Add);
    assert_eq!(apply(&[f.clone()], "f", vec![Val::Float(5.0)]), 40.0);
    let g = gradient(&[f], "f", vec![Val::Float(5.0)], Val::Float(1.0));
    assert_eq!(g, vec![Val::Float(8.0)]);
}

#[test]
fn test_loop_gradient_reads_the_trace_backwards() {
    // Squaring three times computes s0^8; the reverse pass needs each
    // iteration's input state off the trace.
    let f = looped(Prim::Mul);
    let s0 = 1.1f64;
    close(
        apply(&[f.clone()], "f", vec![Val::Float(s0)]),
        s0.powi(8),
        1e-12,
    );
    let g = floats(gradient(&[f], "f", vec![Val::Float(s0)], Val::Float(1.0)));
    close(g[0], 8.0 * s0.powi(7), 1e-12);
}

#[test]
fn test_loop_sum_gives_unit_adjoint_per_element() {
    // f(xs) = forRange(3, (xs, 0), \(i, (v, acc)). (v, acc + v[i]))
    // carries the vector through the state so the loop body stays closed.
    let vec_ty = Ty::vec(Ty::Float);
    let state_ty = Ty::tuple(vec![vec_ty.clone(), Ty::Float]);
    let xs = Var::new("xs", vec_ty.clone());
    let si = Var::new("si", Ty::tuple(vec![Ty::Int, state_ty.clone()]));
    let i = Var::new("i", Ty::Int);
    let s = Var::new("s", state_ty.clone());
    let v = Var::new("v", vec_ty);
    let lam_body = Expr::Untuple {
        vars: vec![i.clone(), s.clone()],
        tuple: Box::new(Expr::Var(si.clone())),
        body: Box::new(Expr::Untuple {
            vars: vec![v.clone(), float("acc")],
            tuple: Box::new(Expr::Var(s)),
            body: Box::new(Expr::Let {
                var: float("x"),
                bind: Box::new(Expr::Call(
                    Fun::Prim(Prim::IndexL),
                    vec![Expr::Var(i), Expr::Var(v.clone())],
                )),
                body: Box::new(let_(
                    "acc2",
                    call2(Prim::Add, var("acc"), var("x")),
                    Expr::Let {
                        var: Var::new("s2", state_ty.clone()),
                        bind: Box::new(Expr::Tuple(vec![Expr::Var(v), var("acc2")])),
                        body: Box::new(Expr::Var(Var::new("s2", state_ty.clone()))),
                    },
                )),
            }),
        }),
    };
    let body = Expr::Let {
        var: Var::new("s0", state_ty.clone()),
        bind: Box::new(Expr::Tuple(vec![
            Expr::Var(xs.clone()),
            Expr::Konst(Konst::Float(0.0)),
        ])),
        body: Box::new(Expr::Let {
            var: Var::new("r", state_ty.clone()),
            bind: Box::new(Expr::Call(
                Fun::Prim(Prim::ForRange),
                vec![
                    Expr::Konst(Konst::Int(3)),
                    Expr::Var(Var::new("s0", state_ty.clone())),
                    Expr::Lam {
                        arg: si,
                        body: Box::new(lam_body),
                    },
                ],
            )),
            body: Box::new(Expr::Var(Var::new("r", state_ty.clone()))),
        }),
    };
    let f = def("f", vec![xs], state_ty, body);
    let elems = Val::vector(vec![Val::Float(2.0), Val::Float(4.0), Val::Float(8.0)]);
    let seed = Val::tuple(vec![
        Val::vector(vec![Val::Float(0.0); 3]),
        Val::Float(1.0),
    ]);
    let g = gradient(&[f], "f", vec![elems], seed);
    assert_eq!(
        g,
        vec![Val::vector(vec![
            Val::Float(1.0),
            Val::Float(1.0),
            Val::Float(1.0)
        ])]
    );
}

#[test]
fn test_element_gradient_is_a_delta() {
    let xs = Var::new("xs", Ty::vec(Ty::Float));
    let i = Var::new("i", Ty::Int);
    let body = Expr::Let {
        var: float("v"),
        bind: Box::new(Expr::Call(
            Fun::Prim(Prim::IndexL),
            vec![Expr::Var(i.clone()), Expr::Var(xs.clone())],
        )),
        body: Box::new(var("v")),
    };
    let f = def("f", vec![xs, i], Ty::Float, body);
    let elems = Val::vector(vec![Val::Float(10.0), Val::Float(20.0), Val::Float(30.0)]);
    let g = gradient(&[f], "f", vec![elems, Val::Int(1)], Val::Float(1.0));
    assert_eq!(
        g,
        vec![
            Val::vector(vec![Val::Float(0.0), Val::Float(1.0), Val::Float(0.0)]),
            Val::unit(),
        ]
    );
}

#[test]
fn test_calls_defer_to_the_callee_twin() {
    let square = def(
        "square",
        vec![float("a")],
        Ty::Float,
        let_("r", call2(Prim::Mul, var("a"), var("a")), var("r")),
    );
    let f = def(
        "f",
        vec![float("x")],
        Ty::Float,
        let_(
            "y",
            Expr::Call(Fun::Def(FunId::plain("square")), vec![var("x")]),
            var("y"),
        ),
    );
    let g = gradient(&[square, f], "f", vec![Val::Float(3.0)], Val::Float(1.0));
    assert_eq!(g, vec![Val::Float(6.0)]);
}

#[test]
fn test_linearized_body_keeps_the_value() {
    let f = composite();
    let mut names = NameGen::new();
    let lin = pullback_linearize::linearize(&f, &mut names).unwrap();
    pullback_validate::check_def(&lin).unwrap();
    let env = [
        (float("x"), Val::Float(0.5)),
        (float("y"), Val::Float(0.25)),
    ];
    let body = f.body.as_ref().unwrap();
    let linear = lin.body.as_ref().unwrap();
    assert_eq!(
        eval(&[], &env, body).unwrap(),
        eval(&[], &env, linear).unwrap()
    );
}

#[test]
fn test_branchy_linearization_keeps_the_value() {
    let f = branchy();
    let mut names = NameGen::new();
    let lin = pullback_linearize::linearize(&f, &mut names).unwrap();
    pullback_validate::check_def(&lin).unwrap();
    for (p, q) in [(3.0, 2.0), (1.0, 2.0)] {
        let env = [(float("p"), Val::Float(p)), (float("q"), Val::Float(q))];
        let body = f.body.as_ref().unwrap();
        let linear = lin.body.as_ref().unwrap();
        assert_eq!(
            eval(&[], &env, body).unwrap(),
            eval(&[], &env, linear).unwrap()
        );
    }
}
