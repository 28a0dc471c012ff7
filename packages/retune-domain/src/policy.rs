use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::intent::IntentLabel;

pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 10;
pub const MIN_EARLY_STOP: u32 = 1;
pub const MAX_EARLY_STOP: u32 = 50;
pub const MIN_SEED_WEIGHT: f64 = 0.1;
pub const MAX_SEED_WEIGHT: f64 = 5.0;

/// Source tag to weight. Ordered so that serialization and iteration are deterministic.
pub type SeedWeights = BTreeMap<String, f64>;

/// Seed weights for every intent, the unit the weight optimizer works on.
pub type IntentWeights = BTreeMap<IntentLabel, SeedWeights>;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PolicyDecision {
	pub max_depth: u32,
	pub include_symbols: bool,
	pub include_files: bool,
	pub include_content: bool,
	pub early_stop_threshold: u32,
	pub seed_weights: SeedWeights,
}
impl PolicyDecision {
	pub fn validate(
		&self,
		intent: Option<IntentLabel>,
		bounds: &PolicyBounds,
	) -> Vec<ValidationError> {
		self.clone().clamp(intent, bounds)
	}

	/// Clamps every numeric field into `bounds` and reports each violation that was corrected.
	pub fn clamp(
		&mut self,
		intent: Option<IntentLabel>,
		bounds: &PolicyBounds,
	) -> Vec<ValidationError> {
		let mut errors = Vec::new();

		if !(bounds.min_depth..=bounds.max_depth).contains(&self.max_depth) {
			errors.push(ValidationError {
				intent,
				field: "max_depth".to_string(),
				value: f64::from(self.max_depth),
				min: f64::from(bounds.min_depth),
				max: f64::from(bounds.max_depth),
			});

			self.max_depth = self.max_depth.clamp(bounds.min_depth, bounds.max_depth);
		}
		if !(bounds.min_early_stop..=bounds.max_early_stop).contains(&self.early_stop_threshold) {
			errors.push(ValidationError {
				intent,
				field: "early_stop_threshold".to_string(),
				value: f64::from(self.early_stop_threshold),
				min: f64::from(bounds.min_early_stop),
				max: f64::from(bounds.max_early_stop),
			});

			self.early_stop_threshold =
				self.early_stop_threshold.clamp(bounds.min_early_stop, bounds.max_early_stop);
		}

		for (source, weight) in self.seed_weights.iter_mut() {
			if weight.is_finite() && (bounds.min_weight..=bounds.max_weight).contains(weight) {
				continue;
			}

			errors.push(ValidationError {
				intent,
				field: format!("seed_weights.{source}"),
				value: *weight,
				min: bounds.min_weight,
				max: bounds.max_weight,
			});

			*weight = bounds.clamp_weight(*weight);
		}

		errors
	}

	pub fn is_within(&self, bounds: &PolicyBounds) -> bool {
		self.validate(None, bounds).is_empty()
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolicyBounds {
	pub min_depth: u32,
	pub max_depth: u32,
	pub min_early_stop: u32,
	pub max_early_stop: u32,
	pub min_weight: f64,
	pub max_weight: f64,
}
impl PolicyBounds {
	/// Bounds with a custom weight range. The range is intersected with the hard weight limits.
	pub fn with_weight_range(min_weight: f64, max_weight: f64) -> Self {
		let min_weight = min_weight.max(MIN_SEED_WEIGHT);
		let max_weight = max_weight.min(MAX_SEED_WEIGHT).max(min_weight);

		Self { min_weight, max_weight, ..Self::default() }
	}

	/// Non-finite weights land on the neutral weight before clamping.
	pub fn clamp_weight(&self, weight: f64) -> f64 {
		if weight.is_finite() {
			weight.clamp(self.min_weight, self.max_weight)
		} else {
			1.0_f64.clamp(self.min_weight, self.max_weight)
		}
	}
}
impl Default for PolicyBounds {
	fn default() -> Self {
		Self {
			min_depth: MIN_DEPTH,
			max_depth: MAX_DEPTH,
			min_early_stop: MIN_EARLY_STOP,
			max_early_stop: MAX_EARLY_STOP,
			min_weight: MIN_SEED_WEIGHT,
			max_weight: MAX_SEED_WEIGHT,
		}
	}
}

/// A policy parameter that was outside its bound. Reported as data; the value is clamped.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ValidationError {
	pub intent: Option<IntentLabel>,
	pub field: String,
	pub value: f64,
	pub min: f64,
	pub max: f64,
}
impl fmt::Display for ValidationError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.intent {
			Some(intent) => write!(
				f,
				"{intent}.{} = {} is outside the range {}-{}.",
				self.field, self.value, self.min, self.max
			),
			None => write!(
				f,
				"{} = {} is outside the range {}-{}.",
				self.field, self.value, self.min, self.max
			),
		}
	}
}

/// The live policy table: one decision per intent.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PolicyTable {
	policies: BTreeMap<IntentLabel, PolicyDecision>,
}
impl PolicyTable {
	pub fn builtin() -> Self {
		Self {
			policies: IntentLabel::ALL
				.into_iter()
				.map(|intent| (intent, default_policy(intent)))
				.collect(),
		}
	}

	pub fn from_policies(policies: BTreeMap<IntentLabel, PolicyDecision>) -> Self {
		Self { policies }
	}

	/// Falls back to the table's `search` entry, then to the built-in `search` default.
	pub fn get(&self, intent: IntentLabel) -> PolicyDecision {
		self.policies
			.get(&intent)
			.or_else(|| self.policies.get(&IntentLabel::Search))
			.cloned()
			.unwrap_or_else(|| default_policy(IntentLabel::Search))
	}

	pub fn entry(&self, intent: IntentLabel) -> Option<&PolicyDecision> {
		self.policies.get(&intent)
	}

	pub fn insert(&mut self, intent: IntentLabel, policy: PolicyDecision) {
		self.policies.insert(intent, policy);
	}

	pub fn iter(&self) -> impl Iterator<Item = (IntentLabel, &PolicyDecision)> {
		self.policies.iter().map(|(intent, policy)| (*intent, policy))
	}

	pub fn len(&self) -> usize {
		self.policies.len()
	}

	pub fn is_empty(&self) -> bool {
		self.policies.is_empty()
	}

	pub fn seed_weights(&self) -> IntentWeights {
		self.policies
			.iter()
			.map(|(intent, policy)| (*intent, policy.seed_weights.clone()))
			.collect()
	}

	/// Replaces the seed weights of every intent present in `weights`.
	pub fn with_seed_weights(mut self, weights: &IntentWeights) -> Self {
		for (intent, seed_weights) in weights {
			if let Some(policy) = self.policies.get_mut(intent) {
				policy.seed_weights = seed_weights.clone();
			}
		}

		self
	}

	pub fn validate(&self, bounds: &PolicyBounds) -> Vec<ValidationError> {
		self.policies
			.iter()
			.flat_map(|(intent, policy)| policy.validate(Some(*intent), bounds))
			.collect()
	}

	pub fn clamp(&mut self, bounds: &PolicyBounds) -> Vec<ValidationError> {
		self.policies
			.iter_mut()
			.flat_map(|(intent, policy)| policy.clamp(Some(*intent), bounds))
			.collect()
	}
}
impl Default for PolicyTable {
	fn default() -> Self {
		Self::builtin()
	}
}

pub fn default_policy(intent: IntentLabel) -> PolicyDecision {
	match intent {
		IntentLabel::Symbol => PolicyDecision {
			max_depth: 2,
			include_symbols: true,
			include_files: false,
			include_content: false,
			early_stop_threshold: 5,
			seed_weights: weights(&[
				("definition", 2.0),
				("symbol", 1.8),
				("implementation", 1.2),
				("reference", 0.8),
			]),
		},
		IntentLabel::Config => PolicyDecision {
			max_depth: 2,
			include_symbols: false,
			include_files: true,
			include_content: true,
			early_stop_threshold: 3,
			seed_weights: weights(&[("config", 2.0), ("file", 1.5), ("documentation", 0.8)]),
		},
		IntentLabel::Api => PolicyDecision {
			max_depth: 3,
			include_symbols: true,
			include_files: true,
			include_content: true,
			early_stop_threshold: 8,
			seed_weights: weights(&[
				("definition", 1.5),
				("implementation", 1.5),
				("documentation", 1.2),
				("test", 0.8),
			]),
		},
		IntentLabel::Incident => PolicyDecision {
			max_depth: 4,
			include_symbols: true,
			include_files: true,
			include_content: true,
			early_stop_threshold: 12,
			seed_weights: weights(&[
				("log", 1.8),
				("implementation", 1.5),
				("test", 1.2),
				("reference", 1.0),
			]),
		},
		IntentLabel::Docs => PolicyDecision {
			max_depth: 2,
			include_symbols: false,
			include_files: true,
			include_content: true,
			early_stop_threshold: 6,
			seed_weights: weights(&[("documentation", 2.0), ("file", 1.0)]),
		},
		IntentLabel::Search => PolicyDecision {
			max_depth: 3,
			include_symbols: true,
			include_files: true,
			include_content: true,
			early_stop_threshold: 10,
			seed_weights: weights(&[
				("definition", 1.0),
				("implementation", 1.0),
				("reference", 1.0),
				("file", 1.0),
			]),
		},
	}
}

fn weights(pairs: &[(&str, f64)]) -> SeedWeights {
	pairs.iter().map(|(source, weight)| ((*source).to_string(), *weight)).collect()
}
