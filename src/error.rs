use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the watcher core: setup errors are returned
/// synchronously from the operation that triggered them, stream/loss
/// errors travel on the error channel and terminate the runtime task, and
/// per-record anomalies never produce an `Err` at all — they are logged
/// and dropped (see `runtime.rs`).
#[derive(Error, Debug)]
pub enum WatcherError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON serialization error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("channel closed, receiver dropped")]
	ChannelSend,

	#[error("invalid path: {path}")]
	InvalidPath { path: String },

	#[error("watcher is not running")]
	NotInitialized,

	#[error("permission denied: {operation} on {path} - {context}")]
	PermissionDenied {
		operation: String,
		path: String,
		context: String,
	},

	/// Root-population walk failure. Fatal for the root being added; does
	/// not affect already-tracked roots.
	#[error("walk of {path} failed during {operation}: {cause}")]
	WalkFailed {
		operation: String,
		path: String,
		cause: String,
	},

	/// Mount lookup failed for a path passed to `add`.
	#[error("could not resolve mount for {path}: {cause}")]
	MountLookup { path: String, cause: String },

	/// A `ProbeInstaller::install` call failed.
	#[error("failed to install probe {symbol} ({kind}): {cause}")]
	ProbeInstall {
		symbol: String,
		kind: String,
		cause: String,
	},

	/// The record stream could not be opened.
	#[error("failed to open record stream: {0}")]
	StreamOpen(String),

	/// An error reported by the record stream itself, forwarded verbatim.
	#[error("record stream error: {0}")]
	StreamError(String),

	/// The perf ring reported dropped records. Downstream is expected to
	/// restart the watcher: the cache may now diverge from reality.
	#[error("events lost {0}")]
	EventsLost(u64),

	#[error(
		"configuration error: {parameter} - {reason} (expected: {expected}, actual: {actual})"
	)]
	ConfigurationError {
		parameter: String,
		reason: String,
		expected: String,
		actual: String,
	},

	#[error("operation timeout: {operation} exceeded {timeout:?}")]
	Timeout { operation: String, timeout: Duration },

	#[error("recovery failed: {operation} after {attempts} attempts over {total_duration:?} - {last_error}")]
	RecoveryFailed {
		operation: String,
		attempts: u32,
		total_duration: Duration,
		last_error: String,
	},
}

/// Retry policy for recoverable setup operations: probe installation and
/// record-stream open.
#[derive(Debug, Clone)]
pub struct ErrorRecoveryConfig {
	pub max_retries: u32,
	pub initial_retry_delay: Duration,
	pub max_retry_delay: Duration,
	pub backoff_multiplier: f64,
	pub exponential_backoff: bool,
}

impl Default for ErrorRecoveryConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			initial_retry_delay: Duration::from_millis(100),
			max_retry_delay: Duration::from_secs(30),
			backoff_multiplier: 2.0,
			exponential_backoff: true,
		}
	}
}

impl ErrorRecoveryConfig {
	pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
		if !self.exponential_backoff {
			return self.initial_retry_delay;
		}

		let delay_ms = self.initial_retry_delay.as_millis() as f64
			* self.backoff_multiplier.powi(attempt as i32);

		let delay = Duration::from_millis(delay_ms as u64);
		std::cmp::min(delay, self.max_retry_delay)
	}
}

impl WatcherError {
	/// Whether retrying the operation that produced this error is likely
	/// to help.
	pub fn is_retryable(&self) -> bool {
		match self {
			WatcherError::Io(io_err) => matches!(
				io_err.kind(),
				std::io::ErrorKind::TimedOut
					| std::io::ErrorKind::ConnectionRefused
					| std::io::ErrorKind::ConnectionAborted
					| std::io::ErrorKind::Interrupted
					| std::io::ErrorKind::WouldBlock
			),
			WatcherError::ProbeInstall { .. } => true,
			WatcherError::StreamOpen(_) => true,
			WatcherError::ChannelSend => true,
			WatcherError::Timeout { .. } => true,
			WatcherError::PermissionDenied { .. } => false,
			WatcherError::InvalidPath { .. } => false,
			WatcherError::ConfigurationError { .. } => false,
			WatcherError::NotInitialized => false,
			WatcherError::RecoveryFailed { .. } => false,
			WatcherError::Json(_) => false,
			WatcherError::WalkFailed { .. } => false,
			WatcherError::MountLookup { .. } => false,
			WatcherError::StreamError(_) => false,
			WatcherError::EventsLost(_) => false,
		}
	}

	/// Error category for logging.
	pub fn category(&self) -> &'static str {
		match self {
			WatcherError::Io(_) => "io",
			WatcherError::Json(_) => "serialization",
			WatcherError::ChannelSend => "channel",
			WatcherError::InvalidPath { .. } => "configuration",
			WatcherError::NotInitialized => "initialization",
			WatcherError::PermissionDenied { .. } => "permission",
			WatcherError::WalkFailed { .. } => "walk",
			WatcherError::MountLookup { .. } => "mount",
			WatcherError::ProbeInstall { .. } => "probe_install",
			WatcherError::StreamOpen(_) => "stream_open",
			WatcherError::StreamError(_) => "stream",
			WatcherError::EventsLost(_) => "loss",
			WatcherError::ConfigurationError { .. } => "configuration",
			WatcherError::Timeout { .. } => "timeout",
			WatcherError::RecoveryFailed { .. } => "recovery",
		}
	}

	pub fn from_permission_denied(operation: &str, path: &str, _io_err: std::io::Error) -> Self {
		WatcherError::PermissionDenied {
			operation: operation.to_string(),
			path: path.to_string(),
			context: "IO operation failed due to insufficient permissions".to_string(),
		}
	}

	pub fn walk_failed(operation: &str, path: &str, cause: &str) -> Self {
		WatcherError::WalkFailed {
			operation: operation.to_string(),
			path: path.to_string(),
			cause: cause.to_string(),
		}
	}

	pub fn configuration_error(
		parameter: &str,
		reason: &str,
		expected: &str,
		actual: &str,
	) -> Self {
		WatcherError::ConfigurationError {
			parameter: parameter.to_string(),
			reason: reason.to_string(),
			expected: expected.to_string(),
			actual: actual.to_string(),
		}
	}

	pub fn timeout(operation: &str, timeout: Duration) -> Self {
		WatcherError::Timeout { operation: operation.to_string(), timeout }
	}
}

pub type Result<T> = std::result::Result<T, WatcherError>;
