use approx::assert_relative_eq;
use hypergrad::{AdjointEngine, HyperGradient, Hyperparameters, RunOptions, StepSource};

#[path = "common/mod.rs"]
mod common;
use common::*;

fn engine() -> (Hyperparameters<f64>, AdjointEngine<f64>) {
    let mut hypers = Hyperparameters::new();
    let h = hypers.scalar("h", 0.3).unwrap();
    let mut engine = AdjointEngine::<f64>::new();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.5, h }, None)
        .unwrap();
    (hypers, engine)
}

#[test]
fn history_holds_initial_state_and_every_step() {
    let (hypers, mut engine) = engine();
    assert!(engine.history().is_empty());

    engine.run(&hypers, RunOptions::new(4)).unwrap();
    let history = engine.history();
    assert_eq!(history.len(), 5);
    assert_eq!(history.get(0).unwrap().step, None);
    let steps: Vec<_> = history.iter().skip(1).map(|s| s.step).collect();
    assert_eq!(steps, vec![Some(0), Some(1), Some(2), Some(3)]);

    // s_{t+1} = 0.5 s_t + 0.3, s_0 = 0
    let mut expected = 0.0;
    for snapshot in history {
        assert_eq!(snapshot.states.len(), 1);
        assert_relative_eq!(snapshot.states[0][0][0], expected, max_relative = 1e-12);
        expected = 0.5 * expected + 0.3;
    }
    assert_eq!(history.last().unwrap().states, engine.states());
}

#[test]
fn reset_empties_history() {
    let (hypers, mut engine) = engine();
    engine.run(&hypers, RunOptions::new(3)).unwrap();
    assert_eq!(engine.history().len(), 4);

    engine.reset(&hypers, None);
    assert_eq!(engine.history().len(), 0);
    assert_eq!(engine.states()[0], vec![vec![0.0]]);
    assert_eq!(engine.adjoints(0).unwrap(), &[vec![0.0]][..]);
}

#[test]
fn second_run_starts_over() {
    let (hypers, mut engine) = engine();
    engine.run(&hypers, RunOptions::new(6)).unwrap();
    let report = engine.run(&hypers, RunOptions::new(2)).unwrap();
    assert_eq!(report.history_len, 3);
    assert_eq!(engine.history().len(), 3);

    let grads = engine.hgrads_hvars(&hypers, None, None, None).unwrap();
    assert_relative_eq!(grads[0].0[0], geometric_sum(0.5, 2), max_relative = 1e-12);
}

#[test]
fn truncation_keeps_full_history() {
    let (hypers, mut engine) = engine();
    for k in [0, 1, 4, 8, 20] {
        let report = engine
            .run(&hypers, RunOptions::new(8).truncate(k))
            .unwrap();
        assert_eq!(report.history_len, 9);
        assert_eq!(report.backward_steps, k.min(8));
        let grads = engine.hgrads_hvars(&hypers, None, None, None).unwrap();
        assert_relative_eq!(
            grads[0].0[0],
            geometric_sum(0.5, k.min(8)),
            max_relative = 1e-12
        );
    }
}

#[test]
fn iterator_steps_are_recorded() {
    let (hypers, mut engine) = engine();
    engine
        .run(&hypers, RunOptions::new(StepSource::iter([10, 11, 12])))
        .unwrap();
    let steps: Vec<_> = engine.history().iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![None, Some(10), Some(11), Some(12)]);
}

#[test]
fn new_registration_invalidates_history() {
    let (mut hypers, mut engine) = engine();
    engine.run(&hypers, RunOptions::new(3)).unwrap();
    assert!(!engine.history().is_empty());

    let g = hypers.scalar("g", 0.1).unwrap();
    engine
        .compute_gradients(&hypers, Last, Linear { a: 0.9, h: g }, Some(&[g][..]))
        .unwrap();
    assert!(engine.history().is_empty());

    engine.run(&hypers, RunOptions::new(3)).unwrap();
    assert_eq!(engine.history().get(2).unwrap().states.len(), 2);
}
