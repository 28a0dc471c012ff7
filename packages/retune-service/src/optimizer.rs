use std::collections::BTreeMap;

use serde::Serialize;

use crate::analyzer::OutcomeSignal;
use retune_domain::{
	intent::IntentLabel,
	policy::{IntentWeights, PolicyBounds, SeedWeights, ValidationError},
};

pub(crate) const SEED_WEIGHT_CONFIDENCE: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParameterValue {
	Integer(u32),
	Float(f64),
	Flag(bool),
}

/// One field that differs between the input and the optimized parameters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParameterChange {
	pub intent: IntentLabel,
	pub parameter: String,
	pub old_value: ParameterValue,
	pub new_value: ParameterValue,
	/// Size of the change relative to the parameter's allowed range, in `0.0..=1.0`.
	pub impact: f64,
	/// Fixed per parameter kind. Reflects how directly the evidence supports the change; it is
	/// not a statistical estimate.
	pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimizationResult<T> {
	pub optimized: T,
	/// Loss reduction from the input to the optimized parameters. Never negative.
	pub improvement: f64,
	pub converged: bool,
	pub iterations: u32,
	/// Exact copy of the input, before any clamping.
	pub rollback: T,
	pub parameter_changes: Vec<ParameterChange>,
	pub validation_errors: Vec<ValidationError>,
}
impl<T> OptimizationResult<T>
where
	T: Clone,
{
	pub fn unchanged(input: &T) -> Self {
		Self {
			optimized: input.clone(),
			improvement: 0.0,
			converged: true,
			iterations: 0,
			rollback: input.clone(),
			parameter_changes: Vec::new(),
			validation_errors: Vec::new(),
		}
	}

	pub fn has_changes(&self) -> bool {
		!self.parameter_changes.is_empty()
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerOptions {
	pub learning_rate: f64,
	pub max_iterations: u32,
	pub convergence_threshold: f64,
	pub min_signals_per_intent: usize,
	pub bounds: PolicyBounds,
}
impl OptimizerOptions {
	pub fn from_config(cfg: &retune_config::Optimizer) -> Self {
		Self {
			learning_rate: cfg.learning_rate,
			max_iterations: cfg.max_iterations,
			convergence_threshold: cfg.convergence_threshold,
			min_signals_per_intent: cfg.min_signals_per_intent,
			bounds: PolicyBounds::with_weight_range(cfg.min_weight, cfg.max_weight),
		}
	}
}
impl Default for OptimizerOptions {
	fn default() -> Self {
		Self::from_config(&retune_config::Optimizer::default())
	}
}

/// Gradient-style tuning of per-intent seed weights.
///
/// Each seed weight is treated as the parameter of a logistic model that predicts satisfaction
/// from the weight a signal ran with. A pass moves every weight along the averaged residual
/// `(observed - predicted) * signal_weight`, so weights that co-occur with satisfied outcomes
/// grow and weights that co-occur with unsatisfied ones shrink.
#[derive(Clone, Debug, Default)]
pub struct WeightOptimizer {
	options: OptimizerOptions,
}
impl WeightOptimizer {
	pub fn new(options: OptimizerOptions) -> Self {
		Self { options }
	}

	pub fn options(&self) -> &OptimizerOptions {
		&self.options
	}

	pub fn optimize(
		&self,
		signals: &[OutcomeSignal],
		current: &IntentWeights,
	) -> OptimizationResult<IntentWeights> {
		if signals.is_empty() || current.values().all(BTreeMap::is_empty) {
			return OptimizationResult::unchanged(current);
		}

		let groups = eligible_groups(signals, self.options.min_signals_per_intent, |intent| {
			current.get(&intent).is_some_and(|weights| !weights.is_empty())
		});

		if groups.is_empty() {
			tracing::debug!(
				signals = signals.len(),
				min_signals_per_intent = self.options.min_signals_per_intent,
				"No intent has enough signals for weight optimization."
			);

			return OptimizationResult::unchanged(current);
		}

		let bounds = &self.options.bounds;
		let mut weights = current.clone();
		let mut validation_errors = Vec::new();

		for intent in groups.keys() {
			if let Some(seed_weights) = weights.get_mut(intent) {
				validation_errors.extend(clamp_weights(*intent, seed_weights, bounds));
			}
		}

		let initial_loss = weight_loss(&groups, &weights);
		let mut best = weights.clone();
		let mut best_loss = initial_loss;
		let mut previous_loss = initial_loss;
		let mut iterations = 0;
		let mut converged = false;

		while iterations < self.options.max_iterations {
			iterations += 1;

			for (intent, group) in &groups {
				if let Some(seed_weights) = weights.get_mut(intent) {
					self.step(seed_weights, group);
				}
			}

			let loss = weight_loss(&groups, &weights);

			tracing::debug!(iteration = iterations, loss, "Weight optimizer pass.");

			if loss < best_loss {
				best_loss = loss;
				best = weights.clone();
			}
			if previous_loss - loss < self.options.convergence_threshold {
				converged = true;

				break;
			}

			previous_loss = loss;
		}

		let parameter_changes = groups
			.keys()
			.flat_map(|intent| {
				let before = current.get(intent).cloned().unwrap_or_default();
				let after = best.get(intent).cloned().unwrap_or_default();

				weight_changes(*intent, &before, &after, bounds)
			})
			.collect();
		let improvement = (initial_loss - best_loss).max(0.0);

		tracing::info!(
			intents = groups.len(),
			iterations,
			converged,
			improvement,
			"Weight optimization finished."
		);

		OptimizationResult {
			optimized: best,
			improvement,
			converged,
			iterations,
			rollback: current.clone(),
			parameter_changes,
			validation_errors,
		}
	}

	fn step(&self, seed_weights: &mut SeedWeights, group: &[&OutcomeSignal]) {
		let gradients: Vec<(String, f64)> = seed_weights
			.iter()
			.filter_map(|(source, weight)| {
				residual_gradient(group, source, *weight).map(|gradient| (source.clone(), gradient))
			})
			.collect();

		for (source, gradient) in gradients {
			if let Some(weight) = seed_weights.get_mut(&source) {
				let stepped = *weight + self.options.learning_rate * gradient;

				*weight = self.options.bounds.clamp_weight(stepped);
			}
		}
	}
}

/// Signals grouped by intent, keeping only intents that pass `accept` and have at least
/// `min_signals` signals.
pub(crate) fn eligible_groups<'a>(
	signals: &'a [OutcomeSignal],
	min_signals: usize,
	accept: impl Fn(IntentLabel) -> bool,
) -> BTreeMap<IntentLabel, Vec<&'a OutcomeSignal>> {
	let mut groups: BTreeMap<IntentLabel, Vec<&OutcomeSignal>> = BTreeMap::new();

	for signal in signals {
		groups.entry(signal.intent).or_default().push(signal);
	}

	groups.retain(|intent, group| group.len() >= min_signals.max(1) && accept(*intent));

	groups
}

pub(crate) fn weight_changes(
	intent: IntentLabel,
	before: &SeedWeights,
	after: &SeedWeights,
	bounds: &PolicyBounds,
) -> Vec<ParameterChange> {
	let range = bounds.max_weight - bounds.min_weight;

	after
		.iter()
		.filter_map(|(source, new)| {
			let old = before.get(source).copied()?;

			if old == *new {
				return None;
			}

			let impact = if range > 0.0 { ((new - old).abs() / range).min(1.0) } else { 0.0 };

			Some(ParameterChange {
				intent,
				parameter: format!("seed_weights.{source}"),
				old_value: ParameterValue::Float(old),
				new_value: ParameterValue::Float(*new),
				impact,
				confidence: SEED_WEIGHT_CONFIDENCE,
			})
		})
		.collect()
}

fn clamp_weights(
	intent: IntentLabel,
	seed_weights: &mut SeedWeights,
	bounds: &PolicyBounds,
) -> Vec<ValidationError> {
	let mut errors = Vec::new();

	for (source, weight) in seed_weights.iter_mut() {
		if weight.is_finite() && (bounds.min_weight..=bounds.max_weight).contains(weight) {
			continue;
		}

		errors.push(ValidationError {
			intent: Some(intent),
			field: format!("seed_weights.{source}"),
			value: *weight,
			min: bounds.min_weight,
			max: bounds.max_weight,
		});

		*weight = bounds.clamp_weight(*weight);
	}

	errors
}

fn residual_gradient(group: &[&OutcomeSignal], source: &str, weight: f64) -> Option<f64> {
	let mut sum = 0.0;
	let mut count = 0_usize;

	for signal in group {
		let Some(signal_weight) = signal.policy.seed_weights.get(source).copied() else {
			continue;
		};

		if !signal_weight.is_finite() {
			continue;
		}

		let observed = if signal.satisfied { 1.0 } else { 0.0 };
		let predicted = sigmoid(signal_weight * weight);

		sum += (observed - predicted) * signal_weight;
		count += 1;
	}

	(count > 0).then(|| sum / count as f64)
}

/// Negative mean likelihood of the observed outcomes under the logistic model.
fn weight_loss(
	groups: &BTreeMap<IntentLabel, Vec<&OutcomeSignal>>,
	weights: &IntentWeights,
) -> f64 {
	let mut likelihood = 0.0;
	let mut terms = 0_usize;

	for (intent, group) in groups {
		let Some(seed_weights) = weights.get(intent) else {
			continue;
		};

		for signal in group {
			for (source, weight) in seed_weights {
				let Some(signal_weight) = signal.policy.seed_weights.get(source).copied() else {
					continue;
				};

				if !signal_weight.is_finite() {
					continue;
				}

				let predicted = sigmoid(signal_weight * weight);

				likelihood += if signal.satisfied { predicted } else { 1.0 - predicted };
				terms += 1;
			}
		}
	}

	if terms == 0 { 0.0 } else { -likelihood / terms as f64 }
}

fn sigmoid(x: f64) -> f64 {
	1.0 / (1.0 + (-x).exp())
}
