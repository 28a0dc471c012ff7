use std::{
	collections::HashMap,
	io::ErrorKind,
	path::{Path, PathBuf},
	sync::{Mutex as StdMutex, MutexGuard},
};

use serde::{Serialize, de::DeserializeOwned};
use time::OffsetDateTime;
use tokio::{
	fs,
	io::AsyncWriteExt,
	sync::{Mutex, OnceCell},
};
use uuid::Uuid;

use crate::{
	Error, Result,
	models::{BundleStructure, InteractionRecord, NewInteraction, PolicySnapshot, SessionRecord},
};

const SESSIONS_FILE: &str = "sessions.jsonl";
const INTERACTIONS_FILE: &str = "interactions.jsonl";
const BUNDLES_FILE: &str = "bundles.jsonl";
const POLICIES_FILE: &str = "policies.json";

// Point lookups by id. Built from the files on first use and kept current by every append.
#[derive(Default)]
struct Index {
	sessions: HashMap<Uuid, SessionRecord>,
	bundles: HashMap<String, BundleStructure>,
}

/// Append-only JSON-lines store rooted at one directory.
///
/// Every file holds one JSON document per line. Lines that fail to parse are skipped with a
/// warning so that one torn write never hides the rest of the history.
///
/// Sessions and bundles are served from an in-memory index, so the store must be the only
/// writer of its directory while it is open.
pub struct JsonlStore {
	root: PathBuf,
	write_lock: Mutex<()>,
	index: OnceCell<StdMutex<Index>>,
}
impl JsonlStore {
	pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
		let root = root.into();

		fs::create_dir_all(&root).await.map_err(|source| Error::Io { path: root.clone(), source })?;

		Ok(Self { root, write_lock: Mutex::new(()), index: OnceCell::new() })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub async fn create_session(
		&self,
		repository: Option<&str>,
		branch: Option<&str>,
		now: OffsetDateTime,
	) -> Result<SessionRecord> {
		let session = SessionRecord {
			session_id: Uuid::new_v4(),
			repository: repository.map(str::to_string),
			branch: branch.map(str::to_string),
			created_at: now,
		};
		let _guard = self.write_lock.lock().await;

		self.write_session(&session).await?;

		Ok(session)
	}

	/// Returns the session with this id, creating it from the given attributes when it is
	/// unknown. An existing session keeps its original attributes.
	pub async fn ensure_session(
		&self,
		session_id: Uuid,
		repository: Option<&str>,
		branch: Option<&str>,
		now: OffsetDateTime,
	) -> Result<SessionRecord> {
		let _guard = self.write_lock.lock().await;

		if let Some(session) = self.session(session_id).await? {
			return Ok(session);
		}

		let session = SessionRecord {
			session_id,
			repository: repository.map(str::to_string),
			branch: branch.map(str::to_string),
			created_at: now,
		};

		self.write_session(&session).await?;

		Ok(session)
	}

	pub async fn session(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
		let index = self.index().await?;

		Ok(index.sessions.get(&session_id).cloned())
	}

	pub async fn create_interaction(
		&self,
		interaction: NewInteraction,
	) -> Result<InteractionRecord> {
		if self.session(interaction.session_id).await?.is_none() {
			return Err(Error::NotFound(format!("session {}", interaction.session_id)));
		}

		let record = interaction.into_record();
		let _guard = self.write_lock.lock().await;

		self.write_line(INTERACTIONS_FILE, &record).await?;

		Ok(record)
	}

	pub async fn interactions_since(
		&self,
		since: OffsetDateTime,
	) -> Result<Vec<InteractionRecord>> {
		let mut records: Vec<InteractionRecord> = self.read_lines(INTERACTIONS_FILE).await?;

		records.retain(|record| record.created_at >= since);
		records.sort_by_key(|record| record.created_at);

		Ok(records)
	}

	pub async fn put_bundle(&self, bundle: &BundleStructure) -> Result<()> {
		let _guard = self.write_lock.lock().await;

		self.write_line(BUNDLES_FILE, bundle).await?;

		let mut index = self.index().await?;

		index.bundles.insert(bundle.bundle_id.clone(), bundle.clone());

		Ok(())
	}

	/// The most recently written structure wins when a bundle id repeats.
	pub async fn find_bundle(&self, bundle_id: &str) -> Result<Option<BundleStructure>> {
		let index = self.index().await?;

		Ok(index.bundles.get(bundle_id).cloned())
	}

	/// Replaces the snapshot through a temporary file and a rename.
	pub async fn save_policy_snapshot(&self, snapshot: &PolicySnapshot) -> Result<()> {
		let _guard = self.write_lock.lock().await;
		let path = self.root.join(POLICIES_FILE);
		let staging = self.root.join(format!("{POLICIES_FILE}.tmp"));
		let payload = serde_json::to_vec_pretty(snapshot)?;

		fs::write(&staging, payload)
			.await
			.map_err(|source| Error::Io { path: staging.clone(), source })?;
		fs::rename(&staging, &path).await.map_err(|source| Error::Io { path, source })?;

		Ok(())
	}

	pub async fn load_policy_snapshot(&self) -> Result<Option<PolicySnapshot>> {
		let path = self.root.join(POLICIES_FILE);
		let raw = match fs::read(&path).await {
			Ok(raw) => raw,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(source) => return Err(Error::Io { path, source }),
		};

		Ok(Some(serde_json::from_slice(&raw)?))
	}

	// Callers hold `write_lock`.
	async fn write_session(&self, session: &SessionRecord) -> Result<()> {
		self.write_line(SESSIONS_FILE, session).await?;

		let mut index = self.index().await?;

		index.sessions.insert(session.session_id, session.clone());

		Ok(())
	}

	async fn index(&self) -> Result<MutexGuard<'_, Index>> {
		let index = self.index.get_or_try_init(|| self.load_index()).await?;

		Ok(index.lock().unwrap_or_else(|err| err.into_inner()))
	}

	async fn load_index(&self) -> Result<StdMutex<Index>> {
		let sessions: Vec<SessionRecord> = self.read_lines(SESSIONS_FILE).await?;
		let bundles: Vec<BundleStructure> = self.read_lines(BUNDLES_FILE).await?;
		let mut index = Index::default();

		index.sessions.extend(sessions.into_iter().map(|session| (session.session_id, session)));
		// Later lines overwrite earlier ones, so the last structure written for an id wins.
		index.bundles.extend(bundles.into_iter().map(|bundle| (bundle.bundle_id.clone(), bundle)));

		Ok(StdMutex::new(index))
	}

	// Callers hold `write_lock`.
	async fn write_line<T>(&self, file: &str, value: &T) -> Result<()>
	where
		T: Serialize,
	{
		let mut line = serde_json::to_vec(value)?;

		line.push(b'\n');

		let path = self.root.join(file);
		let mut handle = fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await
			.map_err(|source| Error::Io { path: path.clone(), source })?;

		handle.write_all(&line).await.map_err(|source| Error::Io { path: path.clone(), source })?;
		handle.flush().await.map_err(|source| Error::Io { path, source })?;

		Ok(())
	}

	async fn read_lines<T>(&self, file: &str) -> Result<Vec<T>>
	where
		T: DeserializeOwned,
	{
		let path = self.root.join(file);
		let raw = match fs::read_to_string(&path).await {
			Ok(raw) => raw,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
			Err(source) => return Err(Error::Io { path, source }),
		};
		let mut values = Vec::new();

		for (index, line) in raw.lines().enumerate() {
			if line.trim().is_empty() {
				continue;
			}

			match serde_json::from_str(line) {
				Ok(value) => values.push(value),
				Err(err) => tracing::warn!(
					file = %path.display(),
					line = index + 1,
					error = %err,
					"Skipping malformed store line."
				),
			}
		}

		Ok(values)
	}
}
