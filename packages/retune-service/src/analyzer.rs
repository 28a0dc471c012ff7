use std::{
	collections::{BTreeMap, HashMap},
	sync::Arc,
};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{Collaborators, PolicyGate, Result};
use retune_domain::{
	gate::{self, SearchContext},
	intent::{self, IntentLabel},
	policy::{PolicyDecision, PolicyTable},
	signature::{self, BundleShape},
};
use retune_storage::models::{BundleStructure, InteractionRecord};

const CHARS_PER_TOKEN: u32 = 4;

/// Outcome metadata the recorder stores in an interaction's `notes` document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct InteractionNotes {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub intent: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub confidence: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub repository: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub branch: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub time_to_fix_secs: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token_usage: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token_budget: Option<u32>,
}

/// One historical query with the policy that was in effect for it.
#[derive(Clone, Debug, PartialEq)]
pub struct OutcomeSignal {
	pub interaction_id: Uuid,
	pub session_id: Uuid,
	pub query: String,
	pub intent: IntentLabel,
	pub repository: Option<String>,
	pub bundle_signature: String,
	pub satisfied: bool,
	pub time_to_fix_secs: Option<f64>,
	pub token_usage: u32,
	pub policy: PolicyDecision,
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GroupMetrics {
	pub total: usize,
	pub satisfied: usize,
	pub satisfaction_rate: f64,
	pub avg_time_to_fix_secs: Option<f64>,
	pub avg_token_usage: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SatisfactionMetrics {
	pub total_signals: usize,
	pub satisfied_signals: usize,
	pub overall_satisfaction_rate: f64,
	pub avg_time_to_fix_secs: Option<f64>,
	pub avg_token_usage: Option<f64>,
	pub by_intent: BTreeMap<IntentLabel, GroupMetrics>,
	pub by_signature: BTreeMap<String, GroupMetrics>,
}

#[derive(Debug, thiserror::Error)]
enum RecordError {
	#[error("record has no satisfaction verdict")]
	MissingOutcome,
	#[error("notes are not a valid outcome document: {0}")]
	MalformedNotes(#[from] serde_json::Error),
}

pub struct OutcomeAnalyzer {
	collaborators: Collaborators,
	gate: Arc<PolicyGate>,
}
impl OutcomeAnalyzer {
	pub fn new(collaborators: Collaborators, gate: Arc<PolicyGate>) -> Self {
		Self { collaborators, gate }
	}

	/// Signals for every interaction in the trailing `since_days` window.
	pub async fn analyze(&self, since_days: u32) -> Result<Vec<OutcomeSignal>> {
		let since = OffsetDateTime::now_utc() - Duration::days(i64::from(since_days));

		self.analyze_since(since).await
	}

	pub async fn analyze_since(&self, since: OffsetDateTime) -> Result<Vec<OutcomeSignal>> {
		let records = self.collaborators.interactions.interactions_since(since).await?;

		Ok(self.signals_from_records(&records).await)
	}

	/// Reconstructs signals record by record. Records that cannot be interpreted are logged and
	/// skipped.
	pub async fn signals_from_records(&self, records: &[InteractionRecord]) -> Vec<OutcomeSignal> {
		let table = self.gate.table();
		let mut signatures = HashMap::new();
		let mut signals = Vec::with_capacity(records.len());

		for record in records {
			match self.signal_from_record(record, &table, &mut signatures).await {
				Ok(signal) => signals.push(signal),
				Err(err) => tracing::warn!(
					interaction_id = %record.interaction_id,
					error = %err,
					"Skipping interaction record."
				),
			}
		}

		tracing::debug!(records = records.len(), signals = signals.len(), "Analyzed interactions.");

		signals
	}

	async fn signal_from_record(
		&self,
		record: &InteractionRecord,
		table: &PolicyTable,
		signatures: &mut HashMap<String, String>,
	) -> Result<OutcomeSignal, RecordError> {
		let satisfied = record.satisfied.ok_or(RecordError::MissingOutcome)?;
		let notes: InteractionNotes = match record.notes.as_deref().map(str::trim) {
			Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
			_ => InteractionNotes::default(),
		};
		let (intent, confidence) = self.resolve_intent(record, &notes).await;
		let bundle_signature = self.resolve_signature(record, signatures).await;
		let context = SearchContext {
			repository: notes.repository.clone(),
			language: notes.language.clone(),
			query_length: record.query.chars().count(),
			token_budget: notes.token_budget,
			confidence,
		};
		let policy = gate::evaluate(table, self.gate.overrides(), intent, &context);

		Ok(OutcomeSignal {
			interaction_id: record.interaction_id,
			session_id: record.session_id,
			query: record.query.clone(),
			intent,
			repository: notes.repository,
			bundle_signature,
			satisfied,
			time_to_fix_secs: notes
				.time_to_fix_secs
				.filter(|secs| secs.is_finite() && *secs >= 0.0),
			token_usage: notes.token_usage.unwrap_or_else(|| estimate_tokens(&record.query)),
			policy,
			created_at: record.created_at,
		})
	}

	async fn resolve_intent(
		&self,
		record: &InteractionRecord,
		notes: &InteractionNotes,
	) -> (IntentLabel, Option<f64>) {
		if let Some(intent) = notes.intent.as_deref().and_then(IntentLabel::parse) {
			return (intent, notes.confidence);
		}

		let classification = match self.collaborators.classifier.classify(&record.query).await {
			Ok(classification) => classification,
			Err(err) => {
				tracing::warn!(
					interaction_id = %record.interaction_id,
					error = %err,
					"Intent classifier failed. Using keyword classification."
				);

				intent::classify_keywords(&record.query)
			},
		};

		(classification.intent, Some(classification.confidence))
	}

	async fn resolve_signature(
		&self,
		record: &InteractionRecord,
		signatures: &mut HashMap<String, String>,
	) -> String {
		let Some(bundle_id) = record.bundle_id.as_deref() else {
			return signature::fallback_bundle_signature(&record.interaction_id.to_string());
		};

		if let Some(known) = signatures.get(bundle_id) {
			return known.clone();
		}

		let resolved = match self.collaborators.bundles.find_bundle(bundle_id).await {
			Ok(Some(structure)) => signature::bundle_signature(&bundle_shape(&structure)),
			Ok(None) => signature::fallback_bundle_signature(bundle_id),
			Err(err) => {
				tracing::warn!(
					bundle_id,
					error = %err,
					"Bundle lookup failed. Using fallback signature."
				);

				signature::fallback_bundle_signature(bundle_id)
			},
		};

		signatures.insert(bundle_id.to_string(), resolved.clone());

		resolved
	}
}

pub fn bundle_shape(structure: &BundleStructure) -> BundleShape {
	BundleShape {
		sources: structure.sources.iter().map(|(source, count)| (source.clone(), *count)).collect(),
		intent: structure.intent.as_deref().and_then(IntentLabel::parse),
		confidence: structure.confidence,
		token_count: structure.token_count,
		token_budget: structure.token_budget,
		content_kinds: structure.content_kinds.clone(),
	}
}

pub fn estimate_tokens(query: &str) -> u32 {
	let chars = u32::try_from(query.chars().count()).unwrap_or(u32::MAX);

	chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Aggregates signals in one pass. An empty input yields all-zero metrics.
pub fn compute_satisfaction_metrics(signals: &[OutcomeSignal]) -> SatisfactionMetrics {
	let mut overall = Accumulator::default();
	let mut by_intent: BTreeMap<IntentLabel, Accumulator> = BTreeMap::new();
	let mut by_signature: BTreeMap<&str, Accumulator> = BTreeMap::new();

	for signal in signals {
		overall.add(signal);
		by_intent.entry(signal.intent).or_default().add(signal);
		by_signature.entry(signal.bundle_signature.as_str()).or_default().add(signal);
	}

	let overall = overall.finish();

	SatisfactionMetrics {
		total_signals: overall.total,
		satisfied_signals: overall.satisfied,
		overall_satisfaction_rate: overall.satisfaction_rate,
		avg_time_to_fix_secs: overall.avg_time_to_fix_secs,
		avg_token_usage: overall.avg_token_usage,
		by_intent: by_intent.into_iter().map(|(intent, acc)| (intent, acc.finish())).collect(),
		by_signature: by_signature
			.into_iter()
			.map(|(signature, acc)| (signature.to_string(), acc.finish()))
			.collect(),
	}
}

#[derive(Default)]
struct Accumulator {
	total: usize,
	satisfied: usize,
	time_to_fix_sum: f64,
	time_to_fix_count: usize,
	token_sum: u64,
}
impl Accumulator {
	fn add(&mut self, signal: &OutcomeSignal) {
		self.total += 1;

		if signal.satisfied {
			self.satisfied += 1;
		}
		if let Some(secs) = signal.time_to_fix_secs {
			self.time_to_fix_sum += secs;
			self.time_to_fix_count += 1;
		}

		self.token_sum += u64::from(signal.token_usage);
	}

	fn finish(self) -> GroupMetrics {
		if self.total == 0 {
			return GroupMetrics::default();
		}

		GroupMetrics {
			total: self.total,
			satisfied: self.satisfied,
			satisfaction_rate: self.satisfied as f64 / self.total as f64,
			avg_time_to_fix_secs: (self.time_to_fix_count > 0)
				.then(|| self.time_to_fix_sum / self.time_to_fix_count as f64),
			avg_token_usage: Some(self.token_sum as f64 / self.total as f64),
		}
	}
}
