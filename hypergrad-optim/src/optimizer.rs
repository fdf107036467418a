use std::marker::PhantomData;

use hypergrad::{Aggregation, HyperGradient, HyperId, Hyperparameters, Real, Result, RunOptions, RunReport};

use crate::bounds::Bounds;
use crate::update::{norm, HyperUpdate};

/// Outcome of one outer step.
#[derive(Debug, Clone)]
pub struct HyperStepReport<F> {
    /// Outer steps completed, including this one.
    pub outer_step: usize,
    /// Report of the inner run.
    pub run: RunReport,
    /// Norm of all hypergradients, concatenated, before the update.
    pub grad_norm: F,
    /// Hypergradients that were applied.
    pub hypergradients: Vec<(Vec<F>, HyperId)>,
}

/// Couples a hypergradient engine with an update rule and box constraints.
///
/// Each [`HyperOptimizer::step`] runs the inner dynamics, retrieves the
/// hypergradients of every registered hyperparameter, updates them in place
/// and projects them back into their bounds.
pub struct HyperOptimizer<F, B, E, U>
where
    F: Real,
    B: Clone,
    E: HyperGradient<F, B>,
    U: HyperUpdate<F>,
{
    engine: E,
    update: U,
    bounds: Bounds<F>,
    aggregation: Option<fn() -> Aggregation<F>>,
    outer_step: usize,
    _batch: PhantomData<fn(B)>,
}

impl<F, B, E, U> HyperOptimizer<F, B, E, U>
where
    F: Real,
    B: Clone,
    E: HyperGradient<F, B>,
    U: HyperUpdate<F>,
{
    pub fn new(engine: E, update: U) -> Self {
        HyperOptimizer {
            engine,
            update,
            bounds: Bounds::new(),
            aggregation: None,
            outer_step: 0,
            _batch: PhantomData,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds<F>) -> Self {
        self.bounds = bounds;
        self
    }

    /// Aggregation used when several registrations share a hyperparameter
    /// (default: mean).
    pub fn with_aggregation(mut self, aggregation: fn() -> Aggregation<F>) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Register more dynamics through the engine.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn update_rule(&self) -> &U {
        &self.update
    }

    pub fn bounds(&self) -> &Bounds<F> {
        &self.bounds
    }

    pub fn outer_step(&self) -> usize {
        self.outer_step
    }

    /// One outer iteration. The run's step counter defaults to the number of
    /// outer steps taken so far.
    pub fn step(
        &mut self,
        hypers: &mut Hyperparameters<F>,
        options: RunOptions<'_, F, B>,
    ) -> Result<HyperStepReport<F>> {
        let options = match options.step_counter {
            Some(_) => options,
            None => options.step_counter(self.outer_step),
        };
        let run = self.engine.run(hypers, options)?;
        let aggregation = self.aggregation.map(|make| make());
        let grads = self.engine.hgrads_hvars(hypers, None, aggregation, None)?;

        let flat: Vec<F> = grads.iter().flat_map(|(g, _)| g.iter().copied()).collect();
        let grad_norm = norm(&flat);

        for (grad, id) in &grads {
            let value = hypers.value_mut(*id)?;
            self.update.update(*id, value, grad);
            self.bounds.project_value(*id, value);
        }
        self.outer_step += 1;

        tracing::debug!(
            engine = self.engine.name(),
            outer_step = self.outer_step,
            hypers = grads.len(),
            grad_norm = %grad_norm,
            "outer step"
        );
        Ok(HyperStepReport {
            outer_step: self.outer_step,
            run,
            grad_norm,
            hypergradients: grads,
        })
    }

    /// Forget the update rule's state and restart the outer step count.
    pub fn reset(&mut self) {
        self.update.reset();
        self.outer_step = 0;
    }
}
