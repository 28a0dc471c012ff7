mod error;

pub use error::{Error, Result};

use std::{
	collections::BTreeMap,
	env, fs,
	future::Future,
	path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use retune_storage::{
	jsonl::JsonlStore,
	models::{BundleStructure, InteractionRecord},
};

/// A scratch directory for a JSON-lines store. Removed on `cleanup` or drop.
pub struct TestStoreDir {
	path: PathBuf,
	cleaned: bool,
}
impl TestStoreDir {
	pub fn new() -> Result<Self> {
		let path = env::temp_dir().join(format!("retune_test_{}", Uuid::new_v4().simple()));

		fs::create_dir_all(&path).map_err(|err| {
			Error::Message(format!("Failed to create test store directory {path:?}: {err}."))
		})?;

		Ok(Self { path, cleaned: false })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub async fn open_store(&self) -> Result<JsonlStore> {
		Ok(JsonlStore::open(&self.path).await?)
	}

	pub fn cleanup(mut self) -> Result<()> {
		self.cleanup_inner()
	}

	fn cleanup_inner(&mut self) -> Result<()> {
		if self.cleaned {
			return Ok(());
		}

		match fs::remove_dir_all(&self.path) {
			Ok(()) => {},
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
			Err(err) => {
				return Err(Error::Message(format!(
					"Failed to remove test store directory {:?}: {err}.",
					self.path
				)));
			},
		}

		self.cleaned = true;

		Ok(())
	}
}
impl Drop for TestStoreDir {
	fn drop(&mut self) {
		if let Err(err) = self.cleanup_inner() {
			eprintln!("Test store cleanup failed: {err}");
		}
	}
}

pub async fn with_test_store<F, Fut, T>(f: F) -> Result<T>
where
	F: FnOnce(JsonlStore) -> Fut,
	Fut: Future<Output = Result<T>>,
{
	let dir = TestStoreDir::new()?;
	let store = dir.open_store().await?;
	let result = f(store).await;

	if let Err(err) = dir.cleanup() {
		eprintln!("Test store cleanup warning: {err}");

		if result.is_ok() {
			return Err(err);
		}
	}

	result
}

/// Builds raw interaction records with outcome notes in the shape the recorder writes.
#[derive(Clone, Debug)]
pub struct InteractionBuilder {
	session_id: Uuid,
	query: String,
	bundle_id: Option<String>,
	satisfied: Option<bool>,
	notes: Map<String, Value>,
	created_at: OffsetDateTime,
}
impl InteractionBuilder {
	pub fn new(query: impl Into<String>) -> Self {
		Self {
			session_id: Uuid::new_v4(),
			query: query.into(),
			bundle_id: None,
			satisfied: None,
			notes: Map::new(),
			created_at: OffsetDateTime::now_utc(),
		}
	}

	pub fn session(mut self, session_id: Uuid) -> Self {
		self.session_id = session_id;

		self
	}

	pub fn satisfied(mut self, satisfied: bool) -> Self {
		self.satisfied = Some(satisfied);

		self
	}

	pub fn bundle(mut self, bundle_id: impl Into<String>) -> Self {
		self.bundle_id = Some(bundle_id.into());

		self
	}

	pub fn intent(self, intent: &str) -> Self {
		self.note("intent", Value::from(intent))
	}

	pub fn repository(self, repository: &str) -> Self {
		self.note("repository", Value::from(repository))
	}

	pub fn time_to_fix_secs(self, seconds: f64) -> Self {
		self.note("time_to_fix_secs", Value::from(seconds))
	}

	pub fn token_usage(self, tokens: u32) -> Self {
		self.note("token_usage", Value::from(tokens))
	}

	pub fn note(mut self, key: &str, value: Value) -> Self {
		self.notes.insert(key.to_string(), value);

		self
	}

	pub fn days_ago(mut self, days: i64) -> Self {
		self.created_at = OffsetDateTime::now_utc() - Duration::days(days);

		self
	}

	pub fn build(self) -> InteractionRecord {
		let notes =
			if self.notes.is_empty() { None } else { Some(Value::Object(self.notes).to_string()) };

		InteractionRecord {
			interaction_id: Uuid::new_v4(),
			session_id: self.session_id,
			query: self.query,
			bundle_id: self.bundle_id,
			satisfied: self.satisfied,
			notes,
			created_at: self.created_at,
		}
	}
}

/// Raw record whose notes are not a JSON document.
pub fn malformed_interaction(query: &str) -> InteractionRecord {
	let mut record = InteractionBuilder::new(query).satisfied(true).build();

	record.notes = Some("{not json".to_string());

	record
}

pub fn bundle_structure(
	bundle_id: &str,
	intent: &str,
	sources: &[(&str, usize)],
	token_count: u32,
	token_budget: u32,
) -> BundleStructure {
	BundleStructure {
		bundle_id: bundle_id.to_string(),
		intent: Some(intent.to_string()),
		confidence: Some(0.9),
		sources: sources
			.iter()
			.map(|(source, count)| ((*source).to_string(), *count))
			.collect::<BTreeMap<_, _>>(),
		token_count,
		token_budget,
		content_kinds: vec!["rs".to_string()],
		created_at: OffsetDateTime::now_utc(),
	}
}
