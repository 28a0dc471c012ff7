use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intent::IntentLabel;

pub const BUNDLE_PREFIX: &str = "b_";
pub const QUERY_PREFIX: &str = "q_";
pub const SIGNATURE_HEX_LEN: usize = 16;

const FEATURE_DELIMITER: &str = "|";

/// The shape of a result bundle: everything the bundle signature depends on.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BundleShape {
	/// Source tag and candidate count pairs. Order is not significant.
	pub sources: Vec<(String, usize)>,
	pub intent: Option<IntentLabel>,
	pub confidence: Option<f64>,
	pub token_count: u32,
	pub token_budget: u32,
	/// File extensions or content kinds present in the bundle. Order and duplicates are not
	/// significant.
	pub content_kinds: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureError {
	NonFiniteConfidence,
	ZeroTokenBudget,
}
impl fmt::Display for SignatureError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::NonFiniteConfidence => f.write_str("confidence must be a finite number"),
			Self::ZeroTokenBudget => f.write_str("token budget must be greater than zero"),
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenBucket {
	Small,
	Medium,
	Large,
	XLarge,
}
impl TokenBucket {
	pub fn from_count(tokens: u32) -> Self {
		match tokens {
			0..1_000 => Self::Small,
			1_000..4_000 => Self::Medium,
			4_000..16_000 => Self::Large,
			_ => Self::XLarge,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Small => "small",
			Self::Medium => "medium",
			Self::Large => "large",
			Self::XLarge => "xlarge",
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BudgetBucket {
	Low,
	Medium,
	High,
	Critical,
}
impl BudgetBucket {
	pub fn from_usage(used: u32, budget: u32) -> Result<Self, SignatureError> {
		if budget == 0 {
			return Err(SignatureError::ZeroTokenBudget);
		}

		let ratio = f64::from(used) / f64::from(budget);

		Ok(if ratio < 0.5 {
			Self::Low
		} else if ratio < 0.8 {
			Self::Medium
		} else if ratio < 0.95 {
			Self::High
		} else {
			Self::Critical
		})
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Low => "low",
			Self::Medium => "medium",
			Self::High => "high",
			Self::Critical => "critical",
		}
	}
}

pub fn confidence_bucket(confidence: f64) -> Result<&'static str, SignatureError> {
	if !confidence.is_finite() {
		return Err(SignatureError::NonFiniteConfidence);
	}

	Ok(if confidence < 0.5 {
		"low"
	} else if confidence < 0.8 {
		"medium"
	} else {
		"high"
	})
}

/// Bucketed features in canonical order. Fails only on inputs that cannot be bucketed.
pub fn bundle_features(shape: &BundleShape) -> Result<Vec<String>, SignatureError> {
	let mut sources: Vec<(String, usize)> = Vec::with_capacity(shape.sources.len());

	for (source, count) in &shape.sources {
		let tag = source.trim().to_ascii_lowercase();

		match sources.iter_mut().find(|(existing, _)| *existing == tag) {
			Some((_, total)) => *total += count,
			None => sources.push((tag, *count)),
		}
	}

	sources.sort();

	let mut features: Vec<String> =
		sources.into_iter().map(|(source, count)| format!("src:{source}:{count}")).collect();
	let intent = shape.intent.unwrap_or(IntentLabel::Search);
	let confidence = match shape.confidence {
		Some(value) => confidence_bucket(value)?,
		None => "unknown",
	};

	features.push(format!("intent:{intent}:{confidence}"));
	features.push(format!("tokens:{}", TokenBucket::from_count(shape.token_count).as_str()));
	features.push(format!(
		"budget:{}",
		BudgetBucket::from_usage(shape.token_count, shape.token_budget)?.as_str()
	));

	let mut kinds: Vec<String> = shape
		.content_kinds
		.iter()
		.map(|kind| kind.trim().trim_start_matches('.').to_ascii_lowercase())
		.filter(|kind| !kind.is_empty())
		.collect();

	kinds.sort();
	kinds.dedup();
	features.push(format!("kinds:{}", kinds.join(",")));

	Ok(features)
}

/// Deterministic `b_` signature. Inputs that cannot be bucketed fall back to hashing their raw
/// serialization, so this never fails.
pub fn bundle_signature(shape: &BundleShape) -> String {
	match bundle_features(shape) {
		Ok(features) => tagged_digest(BUNDLE_PREFIX, features.join(FEATURE_DELIMITER).as_bytes()),
		Err(_) => tagged_digest(BUNDLE_PREFIX, raw_serialization(shape).as_bytes()),
	}
}

/// Stand-in signature for a bundle whose shape is no longer available.
pub fn fallback_bundle_signature(bundle_id: &str) -> String {
	tagged_digest(BUNDLE_PREFIX, format!("bundle:{}", bundle_id.trim()).as_bytes())
}

/// Deterministic `q_` signature over the normalized query, its intent, and the repository.
pub fn query_signature(query: &str, intent: IntentLabel, repository: Option<&str>) -> String {
	let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
	let features = [
		format!("query:{normalized}"),
		format!("intent:{intent}"),
		format!("repo:{}", repository.map(str::trim).unwrap_or("")),
	];

	tagged_digest(QUERY_PREFIX, features.join(FEATURE_DELIMITER).as_bytes())
}

fn raw_serialization(shape: &BundleShape) -> String {
	serde_json::to_string(shape).unwrap_or_else(|_| format!("{shape:?}"))
}

fn tagged_digest(prefix: &str, payload: &[u8]) -> String {
	let hex = blake3::hash(payload).to_hex();

	format!("{prefix}{}", &hex.as_str()[..SIGNATURE_HEX_LEN])
}
