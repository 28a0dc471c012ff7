pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Classifier error: {message}")]
	Classifier { message: String },
	#[error("Step {step} timed out after {timeout_ms} ms.")]
	StepTimeout { step: String, timeout_ms: u64 },
	#[error("Step {step} failed: {message}")]
	StepFailed { step: String, message: String },
	#[error("A workflow run is already in progress.")]
	WorkflowBusy,
	#[error("Policy application failed. The previous table stays live: {message}")]
	Application { message: String },
}
impl From<retune_storage::Error> for Error {
	fn from(err: retune_storage::Error) -> Self {
		match err {
			retune_storage::Error::NotFound(message) => Self::InvalidRequest { message },
			other => Self::Storage { message: other.to_string() },
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
