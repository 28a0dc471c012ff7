use std::collections::BTreeMap;

use crate::{
	analyzer::OutcomeSignal,
	optimizer::{self, OptimizationResult, ParameterChange, ParameterValue},
};
use retune_domain::{
	intent::IntentLabel,
	policy::{PolicyBounds, PolicyDecision, PolicyTable},
};

const FLAG_CONFIDENCE: f64 = 0.9;
const MAX_DEPTH_CONFIDENCE: f64 = 0.8;
const EARLY_STOP_CONFIDENCE: f64 = 0.7;

const UNSATISFIED_LOWER_THRESHOLD_SHARE: f64 = 0.6;
const SATISFIED_HIGHER_THRESHOLD_SHARE: f64 = 0.7;
const LONG_RESOLUTION_SECS: f64 = 10.0;
const SHORT_RESOLUTION_SECS: f64 = 3.0;
const LONG_RESOLUTION_SHARE: f64 = 0.5;
const SHORT_RESOLUTION_SHARE: f64 = 0.7;
const SEED_WEIGHT_STEP: f64 = 0.1;
const FLAG_OFF_BELOW: f64 = 0.3;
const FLAG_ON_ABOVE: f64 = 0.8;
const SIMILARITY_SCALE: f64 = 10.0;
const LOSS_TOLERANCE: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TunerOptions {
	pub max_iterations: u32,
	pub convergence_threshold: f64,
	pub min_signals_per_intent: usize,
	pub bounds: PolicyBounds,
}
impl TunerOptions {
	pub fn from_config(tuner: &retune_config::Tuner, optimizer: &retune_config::Optimizer) -> Self {
		Self {
			max_iterations: tuner.max_iterations,
			convergence_threshold: tuner.convergence_threshold,
			min_signals_per_intent: tuner.min_signals_per_intent,
			bounds: PolicyBounds::with_weight_range(optimizer.min_weight, optimizer.max_weight),
		}
	}
}
impl Default for TunerOptions {
	fn default() -> Self {
		Self::from_config(&retune_config::Tuner::default(), &retune_config::Optimizer::default())
	}
}

/// Heuristic tuning of depth, early stop, include flags, and seed weights.
///
/// Every pass applies the rules below to each intent with enough signals, clamps the result,
/// and scores the table by how closely it resembles the policies that satisfied users. A pass
/// that scores worse than the one before is discarded and ends the run.
#[derive(Clone, Debug, Default)]
pub struct PolicyTuner {
	options: TunerOptions,
}
impl PolicyTuner {
	pub fn new(options: TunerOptions) -> Self {
		Self { options }
	}

	pub fn tune(
		&self,
		signals: &[OutcomeSignal],
		current: &PolicyTable,
	) -> OptimizationResult<PolicyTable> {
		let bounds = &self.options.bounds;
		let mut working = current.clone();
		let validation_errors = working.clamp(bounds);

		for error in &validation_errors {
			tracing::warn!(error = %error, "Clamped out-of-bounds policy parameter.");
		}

		let groups = optimizer::eligible_groups(
			signals,
			self.options.min_signals_per_intent,
			|intent| working.entry(intent).is_some(),
		);

		if groups.is_empty() {
			return OptimizationResult {
				optimized: working,
				improvement: 0.0,
				converged: true,
				iterations: 0,
				rollback: current.clone(),
				parameter_changes: Vec::new(),
				validation_errors,
			};
		}

		let baseline = working.clone();
		let initial_loss = policy_loss(&groups, &working, bounds);
		let mut previous_loss = initial_loss;
		let mut iterations = 0;
		let mut converged = false;

		while iterations < self.options.max_iterations {
			iterations += 1;

			let mut candidate = working.clone();

			for (intent, group) in &groups {
				if let Some(policy) = working.entry(*intent) {
					candidate.insert(*intent, adjust_policy(*intent, policy, group, bounds));
				}
			}

			if candidate == working {
				converged = true;

				break;
			}

			let loss = policy_loss(&groups, &candidate, bounds);

			tracing::debug!(iteration = iterations, loss, "Policy tuner pass.");

			if loss - previous_loss > LOSS_TOLERANCE {
				converged = true;

				break;
			}

			working = candidate;

			if previous_loss - loss < self.options.convergence_threshold {
				converged = true;

				break;
			}

			previous_loss = loss;
		}

		let final_loss = policy_loss(&groups, &working, bounds);
		let parameter_changes = policy_changes(&baseline, &working, bounds);

		tracing::info!(
			intents = groups.len(),
			iterations,
			converged,
			changes = parameter_changes.len(),
			"Policy tuning finished."
		);

		OptimizationResult {
			optimized: working,
			improvement: (initial_loss - final_loss).max(0.0),
			converged,
			iterations,
			rollback: current.clone(),
			parameter_changes,
			validation_errors,
		}
	}
}

fn adjust_policy(
	intent: IntentLabel,
	policy: &PolicyDecision,
	group: &[&OutcomeSignal],
	bounds: &PolicyBounds,
) -> PolicyDecision {
	let mut adjusted = policy.clone();
	let (satisfied, unsatisfied): (Vec<&OutcomeSignal>, Vec<&OutcomeSignal>) =
		group.iter().copied().partition(|signal| signal.satisfied);
	let current_threshold = policy.early_stop_threshold;

	if share(&unsatisfied, |signal| signal.policy.early_stop_threshold < current_threshold)
		.is_some_and(|share| share >= UNSATISFIED_LOWER_THRESHOLD_SHARE)
	{
		adjusted.early_stop_threshold = policy.early_stop_threshold.saturating_add(1);
	} else if share(&satisfied, |signal| signal.policy.early_stop_threshold > current_threshold)
		.is_some_and(|share| share >= SATISFIED_HIGHER_THRESHOLD_SHARE)
	{
		adjusted.early_stop_threshold = policy.early_stop_threshold.saturating_sub(1);
	}

	let timed: Vec<f64> = group.iter().filter_map(|signal| signal.time_to_fix_secs).collect();

	if !timed.is_empty() {
		let total = timed.len() as f64;
		let long = timed.iter().filter(|secs| **secs > LONG_RESOLUTION_SECS).count() as f64;
		let short = timed.iter().filter(|secs| **secs < SHORT_RESOLUTION_SECS).count() as f64;

		if long / total > LONG_RESOLUTION_SHARE {
			adjusted.max_depth = policy.max_depth.saturating_add(1);
		} else if short / total > SHORT_RESOLUTION_SHARE {
			adjusted.max_depth = policy.max_depth.saturating_sub(1);
		}
	}

	for (source, weight) in adjusted.seed_weights.iter_mut() {
		let (Some(satisfied_mean), Some(unsatisfied_mean)) =
			(mean_weight(&satisfied, source), mean_weight(&unsatisfied, source))
		else {
			continue;
		};

		if satisfied_mean > unsatisfied_mean {
			*weight += SEED_WEIGHT_STEP;
		} else if satisfied_mean < unsatisfied_mean {
			*weight -= SEED_WEIGHT_STEP;
		}
	}

	adjusted.include_symbols =
		flip_flag(policy.include_symbols, group, |policy| policy.include_symbols);
	adjusted.include_files = flip_flag(policy.include_files, group, |policy| policy.include_files);
	adjusted.include_content =
		flip_flag(policy.include_content, group, |policy| policy.include_content);

	adjusted.clamp(Some(intent), bounds);

	adjusted
}

/// Share of `signals` matching `predicate`, or `None` for an empty set.
fn share(signals: &[&OutcomeSignal], predicate: impl Fn(&OutcomeSignal) -> bool) -> Option<f64> {
	if signals.is_empty() {
		return None;
	}

	let matching = signals.iter().filter(|signal| predicate(signal)).count();

	Some(matching as f64 / signals.len() as f64)
}

fn mean_weight(signals: &[&OutcomeSignal], source: &str) -> Option<f64> {
	let weights: Vec<f64> = signals
		.iter()
		.filter_map(|signal| signal.policy.seed_weights.get(source).copied())
		.filter(|weight| weight.is_finite())
		.collect();

	if weights.is_empty() {
		return None;
	}

	Some(weights.iter().sum::<f64>() / weights.len() as f64)
}

/// Satisfaction among signals that ran with the flag on decides the flag.
fn flip_flag(
	current: bool,
	group: &[&OutcomeSignal],
	flag: impl Fn(&PolicyDecision) -> bool,
) -> bool {
	let with_flag: Vec<&OutcomeSignal> =
		group.iter().copied().filter(|signal| flag(&signal.policy)).collect();
	let Some(rate) = share(&with_flag, |signal| signal.satisfied) else {
		return current;
	};

	if current && rate < FLAG_OFF_BELOW {
		false
	} else if !current && rate > FLAG_ON_ABOVE {
		true
	} else {
		current
	}
}

/// Negative similarity-weighted satisfaction: signals whose policy resembles the candidate count
/// for more.
fn policy_loss(
	groups: &BTreeMap<IntentLabel, Vec<&OutcomeSignal>>,
	table: &PolicyTable,
	bounds: &PolicyBounds,
) -> f64 {
	let mut weighted_satisfaction = 0.0;
	let mut total_weight = 0.0;

	for (intent, group) in groups {
		let Some(policy) = table.entry(*intent) else {
			continue;
		};

		for signal in group {
			let similarity = similarity(&signal.policy, policy, bounds);

			total_weight += similarity;

			if signal.satisfied {
				weighted_satisfaction += similarity;
			}
		}
	}

	if total_weight > 0.0 { -weighted_satisfaction / total_weight } else { 0.0 }
}

fn similarity(observed: &PolicyDecision, candidate: &PolicyDecision, bounds: &PolicyBounds) -> f64 {
	let depth_range = f64::from(bounds.max_depth.saturating_sub(bounds.min_depth).max(1));
	let early_stop_range =
		f64::from(bounds.max_early_stop.saturating_sub(bounds.min_early_stop).max(1));
	let weight_range = (bounds.max_weight - bounds.min_weight).max(f64::EPSILON);
	let flags = [
		observed.include_symbols != candidate.include_symbols,
		observed.include_files != candidate.include_files,
		observed.include_content != candidate.include_content,
	];
	let mut distance = f64::from(observed.max_depth.abs_diff(candidate.max_depth)) / depth_range
		+ f64::from(observed.early_stop_threshold.abs_diff(candidate.early_stop_threshold))
			/ early_stop_range
		+ flags.iter().filter(|differs| **differs).count() as f64 / flags.len() as f64;
	let weight_gaps: Vec<f64> = candidate
		.seed_weights
		.iter()
		.filter_map(|(source, weight)| {
			observed.seed_weights.get(source).map(|seen| (seen - weight).abs() / weight_range)
		})
		.filter(|gap| gap.is_finite())
		.collect();

	if !weight_gaps.is_empty() {
		distance += weight_gaps.iter().sum::<f64>() / weight_gaps.len() as f64;
	}

	1.0 / (1.0 + SIMILARITY_SCALE * distance)
}

fn policy_changes(
	before: &PolicyTable,
	after: &PolicyTable,
	bounds: &PolicyBounds,
) -> Vec<ParameterChange> {
	let mut changes = Vec::new();

	for (intent, new) in after.iter() {
		let Some(old) = before.entry(intent) else {
			continue;
		};

		push_integer_change(
			&mut changes,
			intent,
			"max_depth",
			(old.max_depth, new.max_depth),
			bounds.max_depth.saturating_sub(bounds.min_depth),
			MAX_DEPTH_CONFIDENCE,
		);
		push_integer_change(
			&mut changes,
			intent,
			"early_stop_threshold",
			(old.early_stop_threshold, new.early_stop_threshold),
			bounds.max_early_stop.saturating_sub(bounds.min_early_stop),
			EARLY_STOP_CONFIDENCE,
		);

		for (parameter, old_flag, new_flag) in [
			("include_symbols", old.include_symbols, new.include_symbols),
			("include_files", old.include_files, new.include_files),
			("include_content", old.include_content, new.include_content),
		] {
			if old_flag != new_flag {
				changes.push(ParameterChange {
					intent,
					parameter: parameter.to_string(),
					old_value: ParameterValue::Flag(old_flag),
					new_value: ParameterValue::Flag(new_flag),
					impact: 1.0,
					confidence: FLAG_CONFIDENCE,
				});
			}
		}

		changes.extend(optimizer::weight_changes(
			intent,
			&old.seed_weights,
			&new.seed_weights,
			bounds,
		));
	}

	changes
}

fn push_integer_change(
	changes: &mut Vec<ParameterChange>,
	intent: IntentLabel,
	parameter: &str,
	(old, new): (u32, u32),
	range: u32,
	confidence: f64,
) {
	if old == new {
		return;
	}

	changes.push(ParameterChange {
		intent,
		parameter: parameter.to_string(),
		old_value: ParameterValue::Integer(old),
		new_value: ParameterValue::Integer(new),
		impact: (f64::from(old.abs_diff(new)) / f64::from(range.max(1))).min(1.0),
		confidence,
	});
}
