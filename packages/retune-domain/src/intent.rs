use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

const BASE_CONFIDENCE: f64 = 0.6;
const CONFIDENCE_STEP: f64 = 0.15;
const MAX_KEYWORD_CONFIDENCE: f64 = 0.95;
const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Why the user is searching. Unknown labels resolve to [`IntentLabel::Search`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
	Symbol,
	Config,
	Api,
	Incident,
	Docs,
	Search,
}
impl IntentLabel {
	pub const ALL: [Self; 6] =
		[Self::Symbol, Self::Config, Self::Api, Self::Incident, Self::Docs, Self::Search];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Symbol => "symbol",
			Self::Config => "config",
			Self::Api => "api",
			Self::Incident => "incident",
			Self::Docs => "docs",
			Self::Search => "search",
		}
	}

	pub fn parse(value: &str) -> Option<Self> {
		match value.trim().to_ascii_lowercase().as_str() {
			"symbol" => Some(Self::Symbol),
			"config" => Some(Self::Config),
			"api" => Some(Self::Api),
			"incident" => Some(Self::Incident),
			"docs" => Some(Self::Docs),
			"search" => Some(Self::Search),
			_ => None,
		}
	}

	pub fn parse_lossy(value: &str) -> Self {
		Self::parse(value).unwrap_or(Self::Search)
	}
}
impl fmt::Display for IntentLabel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Classification {
	pub intent: IntentLabel,
	pub confidence: f64,
	pub entities: Vec<String>,
}

/// Keyword fallback used when a record carries no intent, or when no classifier is wired in.
pub fn classify_keywords(query: &str) -> Classification {
	let lowered = query.to_ascii_lowercase();
	let entities = extract_entities(query);
	let mut best: Option<(IntentLabel, usize)> = None;

	for (intent, keywords) in keyword_table() {
		let hits = keywords.iter().filter(|keyword| lowered.contains(*keyword)).count();

		if hits > 0 && best.map(|(_, top)| hits > top).unwrap_or(true) {
			best = Some((intent, hits));
		}
	}

	match best {
		Some((intent, hits)) => Classification {
			intent,
			confidence: (BASE_CONFIDENCE + CONFIDENCE_STEP * (hits - 1) as f64)
				.min(MAX_KEYWORD_CONFIDENCE),
			entities,
		},
		None if !entities.is_empty() => {
			Classification { intent: IntentLabel::Symbol, confidence: 0.5, entities }
		},
		None => {
			Classification {
				intent: IntentLabel::Search,
				confidence: FALLBACK_CONFIDENCE,
				entities,
			}
		},
	}
}

fn keyword_table() -> [(IntentLabel, &'static [&'static str]); 5] {
	[
		(
			IntentLabel::Incident,
			&[
				"error",
				"exception",
				"panic",
				"crash",
				"stack trace",
				"traceback",
				"failing",
				"incident",
				"outage",
				"bug",
			],
		),
		(
			IntentLabel::Config,
			&[
				"config",
				"setting",
				"environment variable",
				"env var",
				".yaml",
				".yml",
				".toml",
				"feature flag",
				"dotenv",
			],
		),
		(
			IntentLabel::Api,
			&["api", "endpoint", "route", "request", "response", "grpc", "rest ", "http", "webhook"],
		),
		(
			IntentLabel::Symbol,
			&[
				"function",
				"class ",
				"method",
				"struct",
				"definition",
				"defined",
				"where is",
				"implements",
				"interface",
				"symbol",
			],
		),
		(
			IntentLabel::Docs,
			&["documentation", "docs", "readme", "how to", "how do", "guide", "explain", "tutorial"],
		),
	]
}

fn extract_entities(query: &str) -> Vec<String> {
	let Ok(re) = Regex::new(
		r"\b(?:[A-Za-z_][A-Za-z0-9_]*(?:::|\.)[A-Za-z_][A-Za-z0-9_.:]*|[a-z]+_[a-z0-9_]+|[a-z]+[A-Z][A-Za-z0-9]*|[A-Z][a-z0-9]+[A-Z][A-Za-z0-9]*)\b",
	) else {
		return Vec::new();
	};
	let mut entities: Vec<String> =
		re.find_iter(query).map(|found| found.as_str().to_string()).collect();

	entities.sort();
	entities.dedup();

	entities
}
