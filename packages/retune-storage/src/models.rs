use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionRecord {
	pub session_id: Uuid,
	pub repository: Option<String>,
	pub branch: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

/// One raw interaction as the storage engine keeps it. `notes` is an opaque JSON document owned
/// by the writer; readers must tolerate anything in it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InteractionRecord {
	pub interaction_id: Uuid,
	pub session_id: Uuid,
	pub query: String,
	pub bundle_id: Option<String>,
	pub satisfied: Option<bool>,
	pub notes: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewInteraction {
	pub session_id: Uuid,
	pub query: String,
	pub bundle_id: Option<String>,
	pub satisfied: Option<bool>,
	pub notes: Option<String>,
	pub created_at: OffsetDateTime,
}
impl NewInteraction {
	pub fn into_record(self) -> InteractionRecord {
		InteractionRecord {
			interaction_id: Uuid::new_v4(),
			session_id: self.session_id,
			query: self.query,
			bundle_id: self.bundle_id,
			satisfied: self.satisfied,
			notes: self.notes,
			created_at: self.created_at,
		}
	}
}

/// The stored shape of a result bundle, enough to recompute its signature.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BundleStructure {
	pub bundle_id: String,
	pub intent: Option<String>,
	pub confidence: Option<f64>,
	pub sources: BTreeMap<String, usize>,
	pub token_count: u32,
	pub token_budget: u32,
	#[serde(default)]
	pub content_kinds: Vec<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
}

/// A persisted copy of the live policy table. The payload is opaque to storage.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PolicySnapshot {
	pub snapshot_id: Uuid,
	pub payload: Value,
	#[serde(with = "time::serde::rfc3339")]
	pub saved_at: OffsetDateTime,
}
