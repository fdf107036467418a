use approx::assert_relative_eq;
use hypergrad::{
    clip_by_norm, clip_by_value, AdjointEngine, Aggregation, Error, HyperGradient, HyperId,
    Hyperparameters, HypergradientAccumulator, RunOptions, SensitivityEngine,
};

#[path = "common/mod.rs"]
mod common;
use common::*;

const STEPS: usize = 6;

/// Two recurrences driven by the same `h`.
fn shared_setup() -> (Hyperparameters<f64>, HyperId) {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    (hypers, h)
}

fn register_pair<E: HyperGradient<f64>>(engine: &mut E, hypers: &Hyperparameters<f64>, h: HyperId) {
    engine
        .compute_gradients(hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    engine
        .compute_gradients(hypers, Last, Linear { a: 0.25, h }, None)
        .unwrap();
}

#[test]
fn shared_hyperparameter_defaults_to_mean() {
    let (hypers, h) = shared_setup();
    let expected = (geometric_sum(0.5, STEPS) + geometric_sum(0.25, STEPS)) / 2.0;

    let mut reverse = AdjointEngine::<f64>::new();
    register_pair(&mut reverse, &hypers, h);
    assert_eq!(reverse.num_registrations(), 2);
    let grads = run_and_collect(&mut reverse, &hypers, &[h], STEPS);
    assert_relative_eq!(grads[0][0], expected, max_relative = 1e-12);
    assert_eq!(reverse.accumulator().contributions(h).len(), 2);

    let mut forward = SensitivityEngine::<f64>::new();
    register_pair(&mut forward, &hypers, h);
    let grads = run_and_collect(&mut forward, &hypers, &[h], STEPS);
    assert_relative_eq!(grads[0][0], expected, max_relative = 1e-12);
}

#[test]
fn sum_and_custom_aggregation() {
    let (hypers, h) = shared_setup();
    let mut engine = AdjointEngine::<f64>::new();
    register_pair(&mut engine, &hypers, h);
    engine.run(&hypers, RunOptions::new(STEPS)).unwrap();

    let sum = engine
        .hgrads_hvars(&hypers, None, Some(Aggregation::Sum), None)
        .unwrap();
    assert_relative_eq!(
        sum[0].0[0],
        geometric_sum(0.5, STEPS) + geometric_sum(0.25, STEPS),
        max_relative = 1e-12
    );

    let largest = Aggregation::Custom(Box::new(|cs: &[Vec<f64>]| {
        vec![cs.iter().map(|c| c[0]).fold(f64::NEG_INFINITY, f64::max)]
    }));
    let max = engine.hgrads_hvars(&hypers, None, Some(largest), None).unwrap();
    assert_relative_eq!(max[0].0[0], geometric_sum(0.5, STEPS), max_relative = 1e-12);
}

#[test]
fn post_processing_runs_after_aggregation() {
    let (hypers, h) = shared_setup();
    let mut engine = SensitivityEngine::<f64>::new();
    register_pair(&mut engine, &hypers, h);
    engine.run(&hypers, RunOptions::new(STEPS)).unwrap();

    let clip: &dyn Fn(Vec<f64>) -> Vec<f64> = &clip_by_value(-1.0, 1.0);
    let clipped = engine
        .hgrads_hvars(&hypers, None, Some(Aggregation::Sum), Some(clip))
        .unwrap();
    assert_eq!(clipped[0].0, vec![1.0]);

    let unit: &dyn Fn(Vec<f64>) -> Vec<f64> = &clip_by_norm(0.5);
    let scaled = engine.hgrads_hvars(&hypers, None, None, Some(unit)).unwrap();
    assert_relative_eq!(scaled[0].0[0], 0.5, max_relative = 1e-12);
}

#[test]
fn missing_hypergradient_names_the_hyperparameter() {
    let (mut hypers, h) = shared_setup();
    let never = hypers.scalar("never/registered", 1.0).unwrap();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, Some(&[h][..]))
        .unwrap();
    engine.run(&hypers, RunOptions::new(2)).unwrap();

    let err = engine
        .hgrads_hvars(&hypers, Some(&[h, never][..]), None, None)
        .unwrap_err();
    assert_eq!(
        err,
        Error::MissingHypergradient {
            name: "never/registered".to_string()
        }
    );
    assert_eq!(
        err.to_string(),
        "no hypergradient registered for hyperparameter `never/registered`"
    );
}

#[test]
fn external_contributions_survive_runs() {
    let (hypers, h) = shared_setup();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    engine.accumulator_mut().add_contribution(h, vec![10.0]);

    for _ in 0..2 {
        let grads = run_and_collect(&mut engine, &hypers, &[h], 3);
        assert_relative_eq!(
            grads[0][0],
            (geometric_sum(0.5, 3) + 10.0) / 2.0,
            max_relative = 1e-12
        );
    }
}

#[test]
fn live_engines_share_one_accumulator() {
    let (hypers, h) = shared_setup();
    let shared = HypergradientAccumulator::<f64>::shared();

    let mut reverse = AdjointEngine::<f64>::new().with_accumulator(shared.clone());
    reverse
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    let mut forward =
        SensitivityEngine::<f64>::new().with_accumulator(reverse.shared_accumulator());
    forward
        .compute_gradients(&hypers, Last, Linear { a: 0.25, h }, None)
        .unwrap();
    assert_eq!(shared.borrow().contributions(h).len(), 2);

    let mean = |rev_steps: usize, fwd_steps: usize| {
        (geometric_sum(0.5, rev_steps) + geometric_sum(0.25, fwd_steps)) / 2.0
    };

    reverse.run(&hypers, RunOptions::new(4)).unwrap();
    forward.run(&hypers, RunOptions::new(4)).unwrap();
    let grads = forward.hgrads_hvars(&hypers, Some(&[h][..]), None, None).unwrap();
    assert_relative_eq!(grads[0].0[0], mean(4, 4), max_relative = 1e-12);

    // A later run of either engine only rewrites its own slot.
    reverse.run(&hypers, RunOptions::new(2)).unwrap();
    let from_forward = forward.hgrads_hvars(&hypers, Some(&[h][..]), None, None).unwrap();
    let from_reverse = reverse.hgrads_hvars(&hypers, Some(&[h][..]), None, None).unwrap();
    assert_relative_eq!(from_forward[0].0[0], mean(2, 4), max_relative = 1e-12);
    assert_eq!(from_forward, from_reverse);

    forward.run(&hypers, RunOptions::new(1)).unwrap();
    let sum = shared
        .borrow()
        .retrieve(&hypers, &[h], &Aggregation::Sum, None)
        .unwrap();
    assert_relative_eq!(sum[0].0[0], 2.0 * mean(2, 1), max_relative = 1e-12);
}

#[test]
#[should_panic(expected = "with_accumulator must be called before registering dynamics")]
fn swapping_the_accumulator_after_registration_panics() {
    let (hypers, h) = shared_setup();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    let _ = engine.with_accumulator(HypergradientAccumulator::shared());
}
