use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
	intent::IntentLabel,
	pattern,
	policy::{PolicyBounds, PolicyDecision, PolicyTable, SeedWeights},
};
use retune_config::PolicyOverride;

const ALL_INTENTS_KEY: &str = "*";
const LOW_CONFIDENCE: f64 = 0.5;
const HIGH_CONFIDENCE: f64 = 0.8;
const TIGHT_DEPTH_FLOOR: u32 = 1;
const TIGHT_EARLY_STOP_FLOOR: u32 = 2;
const RELAXED_DEPTH_CAP: u32 = 5;
const RELAXED_EARLY_STOP_CAP: u32 = 15;
const SHORT_QUERY_CHARS: usize = 10;
const LONG_QUERY_CHARS: usize = 50;
const LOW_TOKEN_BUDGET: u32 = 2_000;
const LOW_BUDGET_EARLY_STOP_FACTOR: f64 = 0.7;

/// Per-query input to the contextual adjustment layer. Never persisted.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SearchContext {
	pub repository: Option<String>,
	pub language: Option<String>,
	pub query_length: usize,
	pub token_budget: Option<u32>,
	/// Intent classifier confidence, when known.
	pub confidence: Option<f64>,
}

struct RepositoryRule {
	key: String,
	matcher: Option<Regex>,
	intents: BTreeMap<String, PolicyOverride>,
}

/// Repository overrides compiled from configuration. Exact keys win over glob keys; glob keys are
/// tried in key order.
#[derive(Default)]
pub struct RepositoryOverrides {
	exact: BTreeMap<String, BTreeMap<String, PolicyOverride>>,
	globs: Vec<RepositoryRule>,
}
impl RepositoryOverrides {
	pub fn from_config(repositories: &BTreeMap<String, BTreeMap<String, PolicyOverride>>) -> Self {
		let mut overrides = Self::default();

		for (key, intents) in repositories {
			if pattern::is_glob(key) {
				overrides.globs.push(RepositoryRule {
					key: key.clone(),
					matcher: pattern::compile_glob(key),
					intents: intents.clone(),
				});
			} else {
				overrides.exact.insert(key.clone(), intents.clone());
			}
		}

		overrides
	}

	pub fn is_empty(&self) -> bool {
		self.exact.is_empty() && self.globs.is_empty()
	}

	/// Returns the matched repository key with its `*` and intent-specific layers, in that order.
	pub fn resolve(
		&self,
		repository: &str,
		intent: IntentLabel,
	) -> Option<(&str, Vec<&PolicyOverride>)> {
		let (key, intents) = if let Some((key, intents)) = self.exact.get_key_value(repository) {
			(key.as_str(), intents)
		} else {
			let rule = self.globs.iter().find(|rule| {
				rule.matcher.as_ref().map(|re| re.is_match(repository)).unwrap_or(false)
			})?;

			(rule.key.as_str(), &rule.intents)
		};
		let layers: Vec<&PolicyOverride> =
			[intents.get(ALL_INTENTS_KEY), intents.get(intent.as_str())]
				.into_iter()
				.flatten()
				.collect();

		Some((key, layers))
	}
}

/// Resolves the decision for one query: intent default, then repository override, then contextual
/// adjustments, then a final clamp into the hard bounds.
pub fn evaluate(
	table: &PolicyTable,
	overrides: &RepositoryOverrides,
	intent: IntentLabel,
	context: &SearchContext,
) -> PolicyDecision {
	let mut decision = table.get(intent);

	if let Some(repository) = context.repository.as_deref()
		&& let Some((_, layers)) = overrides.resolve(repository, intent)
	{
		for layer in layers {
			decision = apply_override(decision, layer);
		}
	}

	decision = adjust_for_context(decision, context);

	decision.clamp(Some(intent), &PolicyBounds::default());

	decision
}

/// Present override fields replace the base; seed weights merge key by key.
pub fn apply_override(base: PolicyDecision, layer: &PolicyOverride) -> PolicyDecision {
	let mut seed_weights = base.seed_weights;

	if let Some(overrides) = layer.seed_weights.as_ref() {
		for (source, weight) in overrides {
			seed_weights.insert(source.clone(), *weight);
		}
	}

	PolicyDecision {
		max_depth: layer.max_depth.unwrap_or(base.max_depth),
		include_symbols: layer.include_symbols.unwrap_or(base.include_symbols),
		include_files: layer.include_files.unwrap_or(base.include_files),
		include_content: layer.include_content.unwrap_or(base.include_content),
		early_stop_threshold: layer.early_stop_threshold.unwrap_or(base.early_stop_threshold),
		seed_weights,
	}
}

pub fn adjust_for_context(decision: PolicyDecision, context: &SearchContext) -> PolicyDecision {
	let decision = adjust_for_confidence(decision, context.confidence);
	let decision = adjust_for_query_length(decision, context.query_length);
	let decision = adjust_for_token_budget(decision, context.token_budget);

	adjust_for_language(decision, context.language.as_deref())
}

fn adjust_for_confidence(mut decision: PolicyDecision, confidence: Option<f64>) -> PolicyDecision {
	let Some(confidence) = confidence.filter(|value| value.is_finite()) else {
		return decision;
	};

	if confidence < LOW_CONFIDENCE {
		decision.max_depth = decision.max_depth.saturating_sub(1).max(TIGHT_DEPTH_FLOOR);
		decision.early_stop_threshold =
			decision.early_stop_threshold.saturating_sub(1).max(TIGHT_EARLY_STOP_FLOOR);
	} else if confidence > HIGH_CONFIDENCE {
		decision.max_depth =
			decision.max_depth.saturating_add(1).min(RELAXED_DEPTH_CAP).max(decision.max_depth);
		decision.early_stop_threshold = decision
			.early_stop_threshold
			.saturating_add(2)
			.min(RELAXED_EARLY_STOP_CAP)
			.max(decision.early_stop_threshold);
	}

	decision
}

fn adjust_for_query_length(mut decision: PolicyDecision, query_length: usize) -> PolicyDecision {
	if query_length < SHORT_QUERY_CHARS {
		decision.max_depth = decision.max_depth.saturating_add(1);
	} else if query_length > LONG_QUERY_CHARS {
		decision.max_depth = decision.max_depth.saturating_sub(1).max(1);
		decision.early_stop_threshold = decision.early_stop_threshold.saturating_sub(1).max(1);
	}

	decision
}

fn adjust_for_token_budget(
	mut decision: PolicyDecision,
	token_budget: Option<u32>,
) -> PolicyDecision {
	if let Some(budget) = token_budget
		&& budget < LOW_TOKEN_BUDGET
	{
		decision.include_content = false;
		decision.early_stop_threshold =
			((f64::from(decision.early_stop_threshold) * LOW_BUDGET_EARLY_STOP_FACTOR).floor()
				as u32)
				.max(1);
	}

	decision
}

fn adjust_for_language(mut decision: PolicyDecision, language: Option<&str>) -> PolicyDecision {
	let Some(language) = language else {
		return decision;
	};

	for (source, multiplier) in language_bias(language) {
		bias_weight(&mut decision.seed_weights, source, *multiplier);
	}

	decision
}

fn language_bias(language: &str) -> &'static [(&'static str, f64)] {
	match language.trim().to_ascii_lowercase().as_str() {
		"python" | "py" => &[("definition", 1.2), ("implementation", 1.1)],
		"go" | "golang" => &[("package", 1.3), ("definition", 1.1)],
		"rust" | "rs" => &[("definition", 1.2), ("implementation", 1.1), ("test", 0.9)],
		"typescript" | "ts" | "javascript" | "js" => &[("definition", 1.1), ("reference", 1.1)],
		"java" | "kotlin" => &[("implementation", 1.2), ("definition", 1.1)],
		_ => &[],
	}
}

/// Absent sources start from the neutral weight before the multiplier applies.
fn bias_weight(weights: &mut SeedWeights, source: &str, multiplier: f64) {
	let weight = weights.entry(source.to_string()).or_insert(1.0);

	*weight *= multiplier;
}
