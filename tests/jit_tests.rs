#![cfg(all(target_arch = "x86_64", unix))]

use descent::{
    build_line_function, gradient, x, EngineError, JitCallContext, JitCompiler, Value, VarsContext,
    VarsMapper,
};

#[test]
fn smoke_add() {
    let context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let value = x().at("a").val().unwrap() + x().at("a").val().unwrap();

    let vars_config = context.freeze().unwrap();
    let jit_call_context = JitCallContext::from_config(vars_config);
    let mut code_generator = JitCompiler::new(&jit_call_context).unwrap();
    let f = code_generator.compile(value).unwrap();
    assert!(f.code_size() > 0);

    let mut input = VarsMapper::new(jit_call_context.config());
    assert_eq!(2.0, f.call(&jit_call_context, &input.x).unwrap());

    input.at("a").set(2.0).unwrap();
    assert_eq!(4.0, f.call(&jit_call_context, &input.x).unwrap());

    input.at("a").set(-2.0).unwrap();
    assert_eq!(-4.0, f.call(&jit_call_context, &input.x).unwrap());

    // Other calling synopsis.
    assert_eq!(5.0, f.call(&jit_call_context, &[2.5]).unwrap());
}

#[test]
fn smoke_add_constant() {
    let _context = VarsContext::new().unwrap();
    x().at("b").set(1.0).unwrap();
    let value = x().at("b").val().unwrap() + 1.0;

    // No explicit freeze; the call context freezes the session itself.
    let jit_call_context = JitCallContext::new().unwrap();
    let f = JitCompiler::new(&jit_call_context)
        .unwrap()
        .compile(value)
        .unwrap();

    let mut input = VarsMapper::new(jit_call_context.config());
    assert_eq!(2.0, f.call(&jit_call_context, &input.x).unwrap());

    input.at("b").set(2.0).unwrap();
    assert_eq!(3.0, f.call(&jit_call_context, &input.x).unwrap());

    input.at("b").set(-2.0).unwrap();
    assert_eq!(-1.0, f.call(&jit_call_context, &input.x).unwrap());
}

#[test]
fn smoke_function_returning_vector() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    x().at("b").set(1.0).unwrap();
    let a = x().at("a").val().unwrap();
    let b = x().at("b").val().unwrap();
    let values = vec![a + b, a - b, a * b, a / b];

    let jit_call_context = JitCallContext::new().unwrap();
    let g = JitCompiler::new(&jit_call_context)
        .unwrap()
        .compile_vector(&values)
        .unwrap();

    let mut input = VarsMapper::new(jit_call_context.config());
    input.at("a").set(10.0).unwrap();
    input.at("b").set(5.0).unwrap();
    assert_eq!(
        vec![15.0, 5.0, 50.0, 2.0],
        g.call(&jit_call_context, &input.x).unwrap()
    );

    assert_eq!(
        vec![6.0, 2.0, 8.0, 2.0],
        g.call(&jit_call_context, &[4.0, 2.0]).unwrap()
    );
}

#[test]
fn function_returning_vector_has_an_upper_bound_on_dim() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(0.0).unwrap();
    let v = x().at("a").val().unwrap();

    let values: Vec<Vec<Value>> = (2..=6)
        .map(|n| (1..=n).map(|k| v + k as f64).collect())
        .collect();
    let (values_2, values_3, values_5, values_6) = (&values[0], &values[1], &values[3], &values[4]);

    {
        // For one variable the default number of extra output slots is five,
        // so five outputs compile and six do not.
        let ctx = JitCallContext::new().unwrap();
        let f5 = JitCompiler::new(&ctx).unwrap().compile_vector(values_5).unwrap();
        assert_eq!(
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            f5.call(&ctx, &[0.0]).unwrap()
        );
        assert!(matches!(
            JitCompiler::new(&ctx).unwrap().compile_vector(values_6),
            Err(EngineError::NotEnoughExtras {
                required: 6,
                available: 5
            })
        ));
    }

    {
        // An explicit capacity of six makes six outputs runnable.
        let ctx = JitCallContext::with_extras(6).unwrap();
        let f5 = JitCompiler::new(&ctx).unwrap().compile_vector(values_5).unwrap();
        assert_eq!(
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            f5.call(&ctx, &[0.0]).unwrap()
        );
        let f6 = JitCompiler::new(&ctx).unwrap().compile_vector(values_6).unwrap();
        assert_eq!(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            f6.call(&ctx, &[0.0]).unwrap()
        );
    }

    {
        // An explicit capacity of two makes three outputs go out of bounds.
        let ctx = JitCallContext::with_extras(2).unwrap();
        let f2 = JitCompiler::new(&ctx).unwrap().compile_vector(values_2).unwrap();
        assert_eq!(vec![1.0, 2.0], f2.call(&ctx, &[0.0]).unwrap());
        assert!(matches!(
            JitCompiler::new(&ctx).unwrap().compile_vector(values_3),
            Err(EngineError::NotEnoughExtras { .. })
        ));
    }
}

#[test]
fn exp_matches_the_host_bitwise() {
    let _context = VarsContext::new().unwrap();
    x().at("c").set(0.0).unwrap();
    let value = x().at("c").val().unwrap().exp();

    let jit_call_context = JitCallContext::new().unwrap();
    let f = JitCompiler::new(&jit_call_context)
        .unwrap()
        .compile(value)
        .unwrap();

    let mut input = VarsMapper::new(jit_call_context.config());
    for c in [-2.0f64, -1.0, 0.0, 1.0, 2.0] {
        input.at("c").set(c).unwrap();
        assert_eq!(
            c.exp().to_bits(),
            f.call(&jit_call_context, &input.x).unwrap().to_bits()
        );
    }
}

#[test]
fn every_math_function_matches_the_host() {
    let cases: Vec<(fn(Value) -> Value, fn(f64) -> f64)> = vec![
        (|v| v.exp(), |t| t.exp()),
        (|v| v.log(), |t| t.ln()),
        (|v| v.sin(), |t| t.sin()),
        (|v| v.cos(), |t| t.cos()),
        (|v| v.tan(), |t| t.tan()),
        (|v| v.sqr(), |t| t * t),
        (|v| v.sqrt(), |t| t.sqrt()),
        (|v| v.asin(), |t| t.asin()),
        (|v| v.acos(), |t| t.acos()),
        (|v| v.atan(), |t| t.atan()),
        (|v| v.unit_step(), |t| if t >= 0.0 { 1.0 } else { 0.0 }),
        (|v| v.ramp(), |t| if t > 0.0 { t } else { 0.0 }),
        (|v| v.sigmoid(), |t| 1.0 / (1.0 + (-t).exp())),
        (|v| v.log_sigmoid(), |t| -(1.0 + (-t).exp()).ln()),
    ];
    for (build, expected) in cases {
        let _context = VarsContext::new().unwrap();
        x().at("t").set(0.7).unwrap();
        let f_expr = build(x().at("t").val().unwrap());
        let ctx = JitCallContext::new().unwrap();
        let f = JitCompiler::new(&ctx).unwrap().compile(f_expr).unwrap();
        assert_eq!(
            expected(0.7).to_bits(),
            f.call(&ctx, &[0.7]).unwrap().to_bits()
        );
    }
}

#[test]
fn evaluation_is_deterministic_bit_for_bit() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.3).unwrap();
    x().at("b").set(-0.4).unwrap();
    let a = x().at("a").val().unwrap();
    let b = x().at("b").val().unwrap();
    let f_expr = (a * b + a.sin()) / b.exp() + (a / b).atan();

    let ctx = JitCallContext::new().unwrap();
    let f = JitCompiler::new(&ctx).unwrap().compile(f_expr).unwrap();
    let first = f.call(&ctx, &[1.3, -0.4]).unwrap();
    let second = f.call(&ctx, &[1.3, -0.4]).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
}

#[test]
fn stored_immediates_evaluate() {
    // 0.3 and 0.7 do not fit into inline handles and go through the store.
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let a = x().at("a").val().unwrap();
    let f_expr = a * 0.3 + 0.7;
    let ctx = JitCallContext::new().unwrap();
    let f = JitCompiler::new(&ctx).unwrap().compile(f_expr).unwrap();
    assert_eq!(1.0f64 * 0.3 + 0.7, f.call(&ctx, &[1.0]).unwrap());
}

#[test]
fn scalar_roots_that_are_not_nodes() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(2.5).unwrap();
    let a = x().at("a").val().unwrap();
    let ctx = JitCallContext::new().unwrap();
    let mut compiler = JitCompiler::new(&ctx).unwrap();
    // A bare variable and a bare immediate are valid roots.
    let f_var = compiler.compile(a).unwrap();
    let f_imm = compiler.compile(Value::from(4.0)).unwrap();
    assert_eq!(2.5, f_var.call(&ctx, &[2.5]).unwrap());
    assert_eq!(4.0, f_imm.call(&ctx, &[2.5]).unwrap());
}

#[test]
fn compiled_line_function_takes_lambda() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(0.0).unwrap();
    let v = x().at(0).val().unwrap();
    let f_expr = (v - 3.0).sqr();
    let config = context.reindex_vars().unwrap();
    let g = gradient(f_expr, &config).unwrap();
    let l = build_line_function(f_expr, &g, &config).unwrap();

    let ctx = JitCallContext::new().unwrap();
    // Compiled alone in its own scope, the line function computes everything
    // it needs, including the gradient subexpressions it references.
    let compiled_l = JitCompiler::new(&ctx)
        .unwrap()
        .compile_with_argument(l)
        .unwrap();
    // l(λ) = (x + λ·g - 3)² with x = 0, g = -6.
    assert_eq!(9.0, compiled_l.call(&ctx, &[0.0], 0.0).unwrap());
    assert_eq!(0.0, compiled_l.call(&ctx, &[0.0], -0.5).unwrap());
    assert_eq!(9.0, compiled_l.call(&ctx, &[0.0], -1.0).unwrap());
}

#[test]
fn functions_sharing_a_scope_reuse_cached_slots() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(2.0).unwrap();
    let v = x().at(0).val().unwrap();
    let f_expr = (v * v + v.exp()).sqrt();
    let config = context.reindex_vars().unwrap();
    let g_expr = gradient(f_expr, &config).unwrap();

    // Shared scope: f first, then the gradient reusing f's slots.
    let shared = {
        let ctx = JitCallContext::new().unwrap();
        let mut compiler = JitCompiler::new(&ctx).unwrap();
        let f = compiler.compile(f_expr).unwrap();
        let g = compiler.compile_vector(&g_expr).unwrap();
        f.call(&ctx, &[2.0]).unwrap();
        g.call(&ctx, &[2.0]).unwrap()
    };

    // Fresh scope: the gradient alone, recomputing everything.
    let fresh = {
        let ctx = JitCallContext::new().unwrap();
        let g = JitCompiler::new(&ctx)
            .unwrap()
            .compile_vector(&g_expr)
            .unwrap();
        g.call(&ctx, &[2.0]).unwrap()
    };

    assert_eq!(shared, fresh);
}

#[test]
fn emission_order_is_enforced_per_point() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(2.0).unwrap();
    let v = x().at(0).val().unwrap();
    let f_expr = v.sqr();
    let config = context.reindex_vars().unwrap();
    let g_expr = gradient(f_expr, &config).unwrap();

    let ctx = JitCallContext::new().unwrap();
    let mut compiler = JitCompiler::new(&ctx).unwrap();
    let f = compiler.compile(f_expr).unwrap();
    let g = compiler.compile_vector(&g_expr).unwrap();

    // On a fresh point the gradient may not run before the function.
    assert!(matches!(
        g.call(&ctx, &[2.0]),
        Err(EngineError::PrerequisiteNotMet)
    ));
    ctx.mark_new_point();
    assert_eq!(4.0, f.call(&ctx, &[2.0]).unwrap());
    assert_eq!(vec![4.0], g.call(&ctx, &[2.0]).unwrap());

    // Re-calling climbed functions is always legal...
    assert_eq!(4.0, f.call(&ctx, &[2.0]).unwrap());
    assert_eq!(vec![4.0], g.call(&ctx, &[2.0]).unwrap());

    // ...until the ladder is reset for the next point.
    ctx.mark_new_point();
    assert!(matches!(
        g.call(&ctx, &[3.0]),
        Err(EngineError::PrerequisiteNotMet)
    ));
    assert_eq!(9.0, f.call(&ctx, &[3.0]).unwrap());
    assert_eq!(vec![6.0], g.call(&ctx, &[3.0]).unwrap());
}

#[test]
fn compiled_functions_refuse_foreign_contexts() {
    let context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let value = x().at("a").val().unwrap() + 1.0;
    let config = context.freeze().unwrap();

    let ctx_a = JitCallContext::from_config(config.clone());
    let ctx_b = JitCallContext::from_config(config);
    let f = JitCompiler::new(&ctx_a).unwrap().compile(value).unwrap();
    assert_eq!(2.0, f.call(&ctx_a, &[1.0]).unwrap());
    assert!(matches!(
        f.call(&ctx_b, &[1.0]),
        Err(EngineError::ContextMismatch)
    ));
}

#[test]
fn input_vector_must_cover_the_vars() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    x().at("b").set(2.0).unwrap();
    let value = x().at("a").val().unwrap() + x().at("b").val().unwrap();
    let ctx = JitCallContext::new().unwrap();
    let f = JitCompiler::new(&ctx).unwrap().compile(value).unwrap();
    assert!(matches!(
        f.call(&ctx, &[1.0]),
        Err(EngineError::ValuesLen {
            expected: 2,
            got: 1
        })
    ));
}

#[test]
fn compiler_needs_an_active_session() {
    let config = {
        let context = VarsContext::new().unwrap();
        x().at("a").set(1.0).unwrap();
        context.freeze().unwrap()
        // The session dies here; the config survives.
    };
    let ctx = JitCallContext::from_config(config);
    assert!(matches!(JitCompiler::new(&ctx), Err(EngineError::NoSession)));
}

#[test]
fn no_intersecting_call_contexts() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let _ctx = JitCallContext::new().unwrap();
    assert!(matches!(JitCallContext::new(), Err(EngineError::AlreadyFrozen)));
}

#[test]
fn call_context_unfreezes_on_drop() {
    let context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    {
        let _ctx = JitCallContext::new().unwrap();
    }
    {
        let _ctx = JitCallContext::new().unwrap();
    }
    context.freeze().unwrap();
    assert!(matches!(JitCallContext::new(), Err(EngineError::AlreadyFrozen)));
}

#[test]
fn nodes_created_after_the_context_do_not_compile() {
    let _context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let a = x().at("a").val().unwrap();
    let before = a + 1.0;
    let ctx = JitCallContext::new().unwrap();
    let late = before + 1.0;
    let mut compiler = JitCompiler::new(&ctx).unwrap();
    compiler.compile(before).unwrap();
    assert!(matches!(
        compiler.compile(late),
        Err(EngineError::Management(_))
    ));
}

#[test]
fn random_expression_chains_match_host_arithmetic() {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let _context = VarsContext::new().unwrap();
        let start: f64 = rng.gen_range(-1.0..1.0);
        x().at("v").set(start).unwrap();
        let mut expr = x().at("v").val().unwrap();
        let mut expected = start;
        // Apply the same operation chain to the expression and to a plain
        // double; the JIT must reproduce the host arithmetic bit for bit.
        for _ in 0..500 {
            match rng.gen_range(0..7) {
                0 => {
                    let c: f64 = rng.gen_range(-2.0..2.0);
                    expr = expr + c;
                    expected += c;
                }
                1 => {
                    let c: f64 = rng.gen_range(-2.0..2.0);
                    expr = expr - c;
                    expected -= c;
                }
                2 => {
                    let c: f64 = rng.gen_range(-2.0..2.0);
                    expr = expr * c;
                    expected *= c;
                }
                3 => {
                    let c: f64 = rng.gen_range(1.0..2.0);
                    expr = expr / c;
                    expected /= c;
                }
                4 => {
                    expr = expr.sin();
                    expected = expected.sin();
                }
                5 => {
                    expr = expr.atan();
                    expected = expected.atan();
                }
                _ => {
                    expr = expr.sigmoid();
                    expected = 1.0 / (1.0 + (-expected).exp());
                }
            }
        }
        let ctx = JitCallContext::new().unwrap();
        let f = JitCompiler::new(&ctx).unwrap().compile(expr).unwrap();
        assert_eq!(
            expected.to_bits(),
            f.call(&ctx, &[start]).unwrap().to_bits()
        );
    }
}

#[test]
fn deep_expression_compiles_and_evaluates() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(1.0).unwrap();
    let v = x().at(0).val().unwrap();
    let mut f_expr = v;
    for _ in 0..100_000 {
        f_expr = f_expr + v;
    }
    let config = context.reindex_vars().unwrap();
    let df = descent::differentiate(f_expr, &config, 0).unwrap();

    let ctx = JitCallContext::new().unwrap();
    let mut compiler = JitCompiler::new(&ctx).unwrap();
    let f = compiler.compile(f_expr).unwrap();
    let g = compiler.compile(df).unwrap();
    assert_eq!(100_001.0, f.call(&ctx, &[1.0]).unwrap());
    assert_eq!(100_001.0, g.call(&ctx, &[1.0]).unwrap());
}
