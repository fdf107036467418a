use approx::assert_relative_eq;
use hypergrad::{
    Accumulation, AdjointEngine, HyperGradient, HyperId, HyperValues, Hyperparameters,
    OuterObjective, RunOptions, Scalar, SensitivityConfig, SensitivityEngine,
};

#[path = "common/mod.rs"]
mod common;
use common::*;

fn heavy_ball() -> (Hyperparameters<f64>, HeavyBall) {
    let mut hypers = Hyperparameters::new();
    let bb = HeavyBall::register(&mut hypers);
    (hypers, bb)
}

fn online_vs_batch<E: HyperGradient<f64>>(mut make: impl FnMut() -> E) {
    let (hypers, bb) = heavy_ball();

    let mut online = make();
    online
        .compute_gradients(&hypers, validation(&bb), bb.clone(), None)
        .unwrap();
    online.run(&hypers, RunOptions::new(1)).unwrap();
    online.run(&hypers, RunOptions::new(1).online(true)).unwrap();
    let stepwise = online.hgrads_hvars(&hypers, None, None, None).unwrap();

    let mut batch = make();
    batch
        .compute_gradients(&hypers, validation(&bb), bb, None)
        .unwrap();
    batch.run(&hypers, RunOptions::new(2)).unwrap();
    let whole = batch.hgrads_hvars(&hypers, None, None, None).unwrap();

    assert_eq!(stepwise.len(), whole.len());
    for ((a, ha), (b, hb)) in stepwise.iter().zip(whole.iter()) {
        assert_eq!(ha, hb);
        assert_relative_eq!(a[0], b[0], max_relative = 1e-12);
    }
}

#[test]
fn reverse_online_runs_extend_the_horizon() {
    online_vs_batch(AdjointEngine::<f64>::new);
}

#[test]
fn forward_online_runs_extend_the_horizon() {
    online_vs_batch(SensitivityEngine::<f64>::new);
}

#[test]
fn online_state_continues() {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();

    let mut reverse = AdjointEngine::<f64>::new();
    reverse
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    let mut forward = SensitivityEngine::<f64>::new();
    forward
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();

    for _ in 0..3 {
        reverse.run(&hypers, RunOptions::new(2).online(true)).unwrap();
        forward.run(&hypers, RunOptions::new(2).online(true)).unwrap();
    }
    let expected = 0.3 * geometric_sum(0.5, 6);
    assert_relative_eq!(reverse.states()[0][0][0], expected, max_relative = 1e-12);
    assert_relative_eq!(forward.states()[0][0][0], expected, max_relative = 1e-12);
    assert_eq!(reverse.history().len(), 7);

    let rev = reverse.hgrads_hvars(&hypers, None, None, None).unwrap();
    let fwd = forward.hgrads_hvars(&hypers, None, None, None).unwrap();
    assert_relative_eq!(rev[0].0[0], geometric_sum(0.5, 6), max_relative = 1e-12);
    assert_relative_eq!(fwd[0].0[0], geometric_sum(0.5, 6), max_relative = 1e-12);
}

#[test]
fn first_online_run_starts_fresh() {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();

    let report = engine.run(&hypers, RunOptions::new(3).online(true)).unwrap();
    assert_eq!(report.history_len, 4);
    assert_eq!(engine.history().get(0).unwrap().step, None);
}

#[test]
fn non_online_run_discards_progress() {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    let mut engine = SensitivityEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();

    engine.run(&hypers, RunOptions::new(5)).unwrap();
    engine.run(&hypers, RunOptions::new(1)).unwrap();
    assert_relative_eq!(engine.states()[0][0][0], 0.3, max_relative = 1e-12);
    let sens = engine.sensitivities(0, h).unwrap();
    assert_relative_eq!(sens[0][0], 1.0, max_relative = 1e-12);
}

/// O = s + h
struct PlusH {
    h: HyperId,
}

impl OuterObjective<f64> for PlusH {
    fn eval<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> T {
        state[0][0] + hypers.scalar(self.h)
    }
}

#[test]
fn manual_reset_counts_the_initial_state() {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    let summing = || {
        let mut engine = SensitivityEngine::<f64>::with_config(SensitivityConfig {
            accumulation: Accumulation::Sum,
            ..SensitivityConfig::default()
        });
        engine
            .compute_gradients(&hypers, PlusH { h }, Linear { a: 0.5, h }, None)
            .unwrap();
        engine
    };

    let mut fresh = summing();
    fresh.run(&hypers, RunOptions::new(3)).unwrap();

    let mut resumed = summing();
    resumed.run(&hypers, RunOptions::new(5)).unwrap();
    resumed.reset(&hypers, None);
    // Right after the reset the slot already holds the s_0 term.
    assert_eq!(resumed.accumulator().contributions(h)[0], vec![1.0]);
    resumed.run(&hypers, RunOptions::new(3).online(true)).unwrap();

    // Σ_{t≤3} (∂s_t/∂h + 1)
    let expected = 4.0 + (0..=3).map(|t| geometric_sum(0.5, t)).sum::<f64>();
    let a = fresh.hgrads_hvars(&hypers, None, None, None).unwrap();
    let b = resumed.hgrads_hvars(&hypers, None, None, None).unwrap();
    assert_relative_eq!(a[0].0[0], expected, max_relative = 1e-12);
    assert_relative_eq!(b[0].0[0], expected, max_relative = 1e-12);
}
