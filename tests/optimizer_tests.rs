#![cfg(all(target_arch = "x86_64", unix))]

use descent::{line_search, x, EngineError, OptimizationContext, VarsContext};

#[test]
fn quadratic_descends_to_the_minimum_in_one_iteration() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(0.0).unwrap();
    let f = (x().at(0).val().unwrap() - 3.0).sqr();

    let mut opt = OptimizationContext::new(&context, f).unwrap();
    assert_eq!(9.0, opt.compute_current_objective_function_value().unwrap());
    assert_eq!(vec![-6.0], opt.compute_current_gradient_value().unwrap());

    let result = line_search(&opt.line_search_context()).unwrap();
    opt.move_point_along_gradient(result.best_step).unwrap();
    assert!(opt.compute_current_objective_function_value().unwrap() < 1e-12);
}

#[test]
fn multi_variable_descent_converges() {
    let context = VarsContext::new().unwrap();
    x().at("a").set(5.0).unwrap();
    x().at("b").set(-4.0).unwrap();
    let a = x().at("a").val().unwrap();
    let b = x().at("b").val().unwrap();
    let f = (a - 1.0).sqr() + (b + 2.0).sqr();

    let mut opt = OptimizationContext::new(&context, f).unwrap();
    for _ in 0..3 {
        opt.mark_new_point();
        opt.compute_current_objective_function_value().unwrap();
        opt.compute_current_gradient_value().unwrap();
        let result = line_search(&opt.line_search_context()).unwrap();
        opt.move_point_along_gradient(result.best_step).unwrap();
    }
    opt.mark_new_point();
    assert!(opt.compute_current_objective_function_value().unwrap() < 1e-10);
    assert!((opt.current_point()[0] - 1.0).abs() < 1e-6);
    assert!((opt.current_point()[1] + 2.0).abs() < 1e-6);
}

#[test]
fn constants_are_pinned_under_point_moves() {
    let context = VarsContext::new().unwrap();
    x().at("one").set(1.0).unwrap();
    x().at("two").set(2.0).unwrap();
    x().at("three").set(3.0).unwrap();
    x().at("two").set_constant().unwrap();
    x().at("three").set_constant().unwrap();
    let one = x().at("one").val().unwrap();
    let two = x().at("two").val().unwrap();
    let three = x().at("three").val().unwrap();
    // Every variable participates, but only `one` may move.
    let f = one.sqr() + two * three;

    let mut opt = OptimizationContext::new(&context, f).unwrap();
    // Dense order is lexicographic: one, three, two.
    assert_eq!(vec![false, true, true], opt.config.is_constant);

    opt.compute_current_objective_function_value().unwrap();
    // The gradient of a constant leaf is zero.
    assert_eq!(
        vec![2.0, 0.0, 0.0],
        opt.compute_current_gradient_value().unwrap()
    );

    opt.move_point_along_gradient(-0.5).unwrap();
    assert_eq!([0.0, 3.0, 2.0].as_slice(), opt.current_point());

    opt.mark_new_point();
    assert_eq!(6.0, opt.compute_current_objective_function_value().unwrap());
}

#[test]
fn functions_must_be_invoked_in_emission_order_on_a_new_point() {
    let context = VarsContext::new().unwrap();
    x().at(0).set(0.0).unwrap();
    let f = (x().at(0).val().unwrap() - 3.0).sqr();
    let opt = OptimizationContext::new(&context, f).unwrap();

    // The gradient is compiled after the function; on a fresh point it may
    // not be invoked first.
    assert!(matches!(
        opt.compute_current_gradient_value(),
        Err(EngineError::PrerequisiteNotMet)
    ));
    opt.mark_new_point();
    opt.compute_current_objective_function_value().unwrap();
    opt.compute_current_gradient_value().unwrap();
}

#[test]
fn moving_against_a_wrong_sized_gradient_is_rejected() {
    let context = VarsContext::new().unwrap();
    x().at("a").set(1.0).unwrap();
    let a = x().at("a").val().unwrap();
    let f = a.sqr();
    let mut opt = OptimizationContext::new(&context, f).unwrap();
    opt.compute_current_objective_function_value().unwrap();
    opt.compute_current_gradient_value().unwrap();

    let short = Vec::new();
    let error = opt
        .vars_mapper
        .move_point(&opt.jit_call_context, &short, -1.0);
    assert!(matches!(
        error,
        Err(EngineError::GradientDimMismatch {
            expected: 1,
            got: 0
        })
    ));
}
