#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("I/O error at {path:?}: {source}")]
	Io { path: std::path::PathBuf, source: std::io::Error },
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error("Not found: {0}")]
	NotFound(String),
}
