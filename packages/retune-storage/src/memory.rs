use std::{
	collections::HashMap,
	sync::{Mutex, MutexGuard},
};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Error, Result,
	models::{BundleStructure, InteractionRecord, NewInteraction, PolicySnapshot, SessionRecord},
};

#[derive(Default)]
struct State {
	sessions: HashMap<Uuid, SessionRecord>,
	interactions: Vec<InteractionRecord>,
	bundles: HashMap<String, BundleStructure>,
	policies: Option<PolicySnapshot>,
}

/// Process-local store. Used by tests and by embedders that do not need durability.
#[derive(Default)]
pub struct MemoryStore {
	state: Mutex<State>,
}
impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_session(
		&self,
		repository: Option<&str>,
		branch: Option<&str>,
		now: OffsetDateTime,
	) -> SessionRecord {
		let session = SessionRecord {
			session_id: Uuid::new_v4(),
			repository: repository.map(str::to_string),
			branch: branch.map(str::to_string),
			created_at: now,
		};

		self.lock().sessions.insert(session.session_id, session.clone());

		session
	}

	/// Returns the session with this id, creating it when it is unknown.
	pub fn ensure_session(
		&self,
		session_id: Uuid,
		repository: Option<&str>,
		branch: Option<&str>,
		now: OffsetDateTime,
	) -> SessionRecord {
		self.lock()
			.sessions
			.entry(session_id)
			.or_insert_with(|| SessionRecord {
				session_id,
				repository: repository.map(str::to_string),
				branch: branch.map(str::to_string),
				created_at: now,
			})
			.clone()
	}

	pub fn session(&self, session_id: Uuid) -> Option<SessionRecord> {
		self.lock().sessions.get(&session_id).cloned()
	}

	/// Unknown sessions are rejected so that orphaned interactions never reach analysis.
	pub fn create_interaction(&self, interaction: NewInteraction) -> Result<InteractionRecord> {
		let mut state = self.lock();

		if !state.sessions.contains_key(&interaction.session_id) {
			return Err(Error::NotFound(format!("session {}", interaction.session_id)));
		}

		let record = interaction.into_record();

		state.interactions.push(record.clone());

		Ok(record)
	}

	/// Records created at or after `since`, oldest first.
	pub fn interactions_since(&self, since: OffsetDateTime) -> Vec<InteractionRecord> {
		let mut records: Vec<InteractionRecord> = self
			.lock()
			.interactions
			.iter()
			.filter(|record| record.created_at >= since)
			.cloned()
			.collect();

		records.sort_by_key(|record| record.created_at);

		records
	}

	/// Inserts raw records as-is, bypassing session checks. Lets tests seed arbitrary history.
	pub fn import_interactions(&self, records: impl IntoIterator<Item = InteractionRecord>) {
		self.lock().interactions.extend(records);
	}

	pub fn put_bundle(&self, bundle: BundleStructure) {
		self.lock().bundles.insert(bundle.bundle_id.clone(), bundle);
	}

	pub fn find_bundle(&self, bundle_id: &str) -> Option<BundleStructure> {
		self.lock().bundles.get(bundle_id).cloned()
	}

	pub fn save_policy_snapshot(&self, snapshot: PolicySnapshot) {
		self.lock().policies = Some(snapshot);
	}

	pub fn load_policy_snapshot(&self) -> Option<PolicySnapshot> {
		self.lock().policies.clone()
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|err| err.into_inner())
	}
}
