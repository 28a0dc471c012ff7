pub mod analyzer;
pub mod cache;
pub mod gate;
pub mod optimizer;
pub mod orchestrator;
pub mod tuner;

mod error;

pub use analyzer::{GroupMetrics, OutcomeAnalyzer, OutcomeSignal, SatisfactionMetrics};
pub use cache::{
	CacheEntry, CacheSettings, CacheStats, Clock, ManualClock, SignatureCache, SystemClock,
};
pub use error::{Error, Result};
pub use gate::PolicyGate;
pub use optimizer::{
	OptimizationResult, OptimizerOptions, ParameterChange, ParameterValue, WeightOptimizer,
};
pub use orchestrator::{
	InteractionOutcome, Orchestrator, QueryDecision, RunStatus, StepName, StepReport, StepStatus,
	WorkflowReport,
};
pub use tuner::{PolicyTuner, TunerOptions};

use std::{future::Future, pin::Pin, sync::Arc};

use time::OffsetDateTime;
use uuid::Uuid;

use retune_domain::{
	intent::{self, Classification},
	policy::PolicyTable,
};
use retune_storage::{
	jsonl::JsonlStore,
	memory::MemoryStore,
	models::{BundleStructure, InteractionRecord, NewInteraction, PolicySnapshot, SessionRecord},
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait InteractionStore
where
	Self: Send + Sync,
{
	fn create_session<'a>(
		&'a self,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>>;

	/// Returns the session with this id, creating it from the given attributes when unknown.
	fn ensure_session<'a>(
		&'a self,
		session_id: Uuid,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>>;

	fn create_interaction(
		&self,
		interaction: NewInteraction,
	) -> BoxFuture<'_, Result<InteractionRecord>>;

	fn interactions_since(
		&self,
		since: OffsetDateTime,
	) -> BoxFuture<'_, Result<Vec<InteractionRecord>>>;
}

pub trait BundleStore
where
	Self: Send + Sync,
{
	fn find_bundle<'a>(
		&'a self,
		bundle_id: &'a str,
	) -> BoxFuture<'a, Result<Option<BundleStructure>>>;
}

pub trait IntentClassifier
where
	Self: Send + Sync,
{
	fn classify<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Classification>>;
}

/// Durable home of the live policy table.
pub trait PolicyStore
where
	Self: Send + Sync,
{
	fn save_policies<'a>(&'a self, table: &'a PolicyTable) -> BoxFuture<'a, Result<()>>;

	fn load_policies(&self) -> BoxFuture<'_, Result<Option<PolicyTable>>>;
}

#[derive(Clone)]
pub struct Collaborators {
	pub interactions: Arc<dyn InteractionStore>,
	pub bundles: Arc<dyn BundleStore>,
	pub classifier: Arc<dyn IntentClassifier>,
	pub policies: Arc<dyn PolicyStore>,
}
impl Collaborators {
	/// Wires one store for every storage concern and the keyword classifier.
	pub fn from_store<S>(store: Arc<S>) -> Self
	where
		S: 'static + InteractionStore + BundleStore + PolicyStore,
	{
		Self {
			interactions: store.clone(),
			bundles: store.clone(),
			classifier: Arc::new(KeywordClassifier),
			policies: store,
		}
	}
}

/// Classifier backed by the built-in keyword table.
pub struct KeywordClassifier;
impl IntentClassifier for KeywordClassifier {
	fn classify<'a>(&'a self, query: &'a str) -> BoxFuture<'a, Result<Classification>> {
		Box::pin(async move { Ok(intent::classify_keywords(query)) })
	}
}

impl InteractionStore for MemoryStore {
	fn create_session<'a>(
		&'a self,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>> {
		Box::pin(async move {
			Ok(MemoryStore::create_session(self, repository, branch, OffsetDateTime::now_utc()))
		})
	}

	fn ensure_session<'a>(
		&'a self,
		session_id: Uuid,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(MemoryStore::ensure_session(self, session_id, repository, branch, now))
		})
	}

	fn create_interaction(
		&self,
		interaction: NewInteraction,
	) -> BoxFuture<'_, Result<InteractionRecord>> {
		Box::pin(async move { Ok(MemoryStore::create_interaction(self, interaction)?) })
	}

	fn interactions_since(
		&self,
		since: OffsetDateTime,
	) -> BoxFuture<'_, Result<Vec<InteractionRecord>>> {
		Box::pin(async move { Ok(MemoryStore::interactions_since(self, since)) })
	}
}

impl BundleStore for MemoryStore {
	fn find_bundle<'a>(
		&'a self,
		bundle_id: &'a str,
	) -> BoxFuture<'a, Result<Option<BundleStructure>>> {
		Box::pin(async move { Ok(MemoryStore::find_bundle(self, bundle_id)) })
	}
}

impl PolicyStore for MemoryStore {
	fn save_policies<'a>(&'a self, table: &'a PolicyTable) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			self.save_policy_snapshot(policy_snapshot(table)?);

			Ok(())
		})
	}

	fn load_policies(&self) -> BoxFuture<'_, Result<Option<PolicyTable>>> {
		Box::pin(async move { self.load_policy_snapshot().map(policy_table).transpose() })
	}
}

impl InteractionStore for JsonlStore {
	fn create_session<'a>(
		&'a self,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>> {
		Box::pin(async move {
			Ok(JsonlStore::create_session(self, repository, branch, OffsetDateTime::now_utc())
				.await?)
		})
	}

	fn ensure_session<'a>(
		&'a self,
		session_id: Uuid,
		repository: Option<&'a str>,
		branch: Option<&'a str>,
	) -> BoxFuture<'a, Result<SessionRecord>> {
		Box::pin(async move {
			let now = OffsetDateTime::now_utc();

			Ok(JsonlStore::ensure_session(self, session_id, repository, branch, now).await?)
		})
	}

	fn create_interaction(
		&self,
		interaction: NewInteraction,
	) -> BoxFuture<'_, Result<InteractionRecord>> {
		Box::pin(async move { Ok(JsonlStore::create_interaction(self, interaction).await?) })
	}

	fn interactions_since(
		&self,
		since: OffsetDateTime,
	) -> BoxFuture<'_, Result<Vec<InteractionRecord>>> {
		Box::pin(async move { Ok(JsonlStore::interactions_since(self, since).await?) })
	}
}

impl BundleStore for JsonlStore {
	fn find_bundle<'a>(
		&'a self,
		bundle_id: &'a str,
	) -> BoxFuture<'a, Result<Option<BundleStructure>>> {
		Box::pin(async move { Ok(JsonlStore::find_bundle(self, bundle_id).await?) })
	}
}

impl PolicyStore for JsonlStore {
	fn save_policies<'a>(&'a self, table: &'a PolicyTable) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let snapshot = policy_snapshot(table)?;

			Ok(self.save_policy_snapshot(&snapshot).await?)
		})
	}

	fn load_policies(&self) -> BoxFuture<'_, Result<Option<PolicyTable>>> {
		Box::pin(async move { self.load_policy_snapshot().await?.map(policy_table).transpose() })
	}
}

fn policy_snapshot(table: &PolicyTable) -> Result<PolicySnapshot> {
	Ok(PolicySnapshot {
		snapshot_id: Uuid::new_v4(),
		payload: serde_json::to_value(table)?,
		saved_at: OffsetDateTime::now_utc(),
	})
}

fn policy_table(snapshot: PolicySnapshot) -> Result<PolicyTable> {
	Ok(serde_json::from_value(snapshot.payload)?)
}
