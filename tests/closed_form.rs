use approx::assert_relative_eq;
use hypergrad::{
    AdjointEngine, Accumulation, HyperGradient, Hyperparameters, RunOptions, SensitivityConfig,
    SensitivityEngine,
};

#[path = "common/mod.rs"]
mod common;
use common::*;

fn linear_setup() -> (Hyperparameters<f64>, Linear) {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    (hypers, Linear { a: 0.5, h })
}

#[test]
fn reverse_matches_geometric_sum() {
    let (hypers, dynamics) = linear_setup();
    let h = dynamics.h;
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();

    let grads = run_and_collect(&mut engine, &hypers, &[h], 5);
    assert_relative_eq!(grads[0][0], 1.9375, max_relative = 1e-12);
    assert_relative_eq!(grads[0][0], geometric_sum(0.5, 5), max_relative = 1e-12);
}

#[test]
fn forward_matches_geometric_sum() {
    let (hypers, dynamics) = linear_setup();
    let h = dynamics.h;
    let mut engine = SensitivityEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();

    let grads = run_and_collect(&mut engine, &hypers, &[h], 5);
    assert_relative_eq!(grads[0][0], 1.9375, max_relative = 1e-12);
}

#[test]
fn final_state_is_unrolled_value() {
    let (hypers, dynamics) = linear_setup();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();
    engine.run(&hypers, RunOptions::new(5)).unwrap();
    // s_5 = h Σ_{k<5} a^k
    assert_relative_eq!(engine.states()[0][0][0], 0.3 * 1.9375, max_relative = 1e-12);
}

#[test]
fn gradient_grows_with_horizon() {
    for steps in [1, 2, 7, 20] {
        let (hypers, dynamics) = linear_setup();
        let h = dynamics.h;
        let mut engine = AdjointEngine::<f64>::new();
        engine
            .compute_gradients(&hypers, Last, dynamics, None)
            .unwrap();
        let grads = run_and_collect(&mut engine, &hypers, &[h], steps);
        assert_relative_eq!(grads[0][0], geometric_sum(0.5, steps), max_relative = 1e-12);
    }
}

#[test]
fn zero_steps_leave_only_direct_term() {
    let (hypers, dynamics) = linear_setup();
    let h = dynamics.h;

    let mut reverse = AdjointEngine::<f64>::new();
    reverse
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    let report = reverse.run(&hypers, RunOptions::new(0)).unwrap();
    assert_eq!(report.forward_steps, 0);
    assert_eq!(report.backward_steps, 0);
    assert_eq!(report.history_len, 1);
    assert_eq!(reverse.hgrads_hvars(&hypers, None, None, None).unwrap()[0].0, vec![0.0]);

    let mut forward = SensitivityEngine::<f64>::new();
    forward
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();
    forward.run(&hypers, RunOptions::new(0)).unwrap();
    assert_eq!(forward.hgrads_hvars(&hypers, None, None, None).unwrap()[0].0, vec![0.0]);
}

#[test]
fn truncated_reverse_keeps_last_steps() {
    let (hypers, dynamics) = linear_setup();
    let h = dynamics.h;
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();

    let report = engine
        .run(&hypers, RunOptions::new(10).truncate(3))
        .unwrap();
    assert_eq!(report.forward_steps, 10);
    assert_eq!(report.backward_steps, 3);
    assert_eq!(report.history_len, 11);

    let grad = engine.hgrads_hvars(&hypers, Some(&[h][..]), None, None).unwrap();
    assert_relative_eq!(grad[0].0[0], geometric_sum(0.5, 3), max_relative = 1e-12);
}

#[test]
fn running_objective_sums_every_state() {
    let (hypers, dynamics) = linear_setup();
    let h = dynamics.h;
    let mut engine = SensitivityEngine::<f64>::with_config(SensitivityConfig {
        accumulation: Accumulation::Sum,
        ..SensitivityConfig::default()
    });
    engine
        .compute_gradients(&hypers, Last, dynamics, None)
        .unwrap();

    let grads = run_and_collect(&mut engine, &hypers, &[h], 4);
    // d/dh Σ_{t=0..4} s_t = Σ_{t=1..4} Σ_{k<t} a^k
    let expected: f64 = (1..=4).map(|t| geometric_sum(0.5, t)).sum();
    assert_relative_eq!(grads[0][0], expected, max_relative = 1e-12);
}
