use std::path::PathBuf;

use thiserror::Error;

use crate::lineage::cert::Certificate;
use crate::lineage::refs::ResourceRef;

pub type LineageResult<T> = Result<T, LineageError>;

#[derive(Debug, Error)]
pub enum LineageError {
    /// Two refs of the same resource overlap where only one may be tracked.
    #[error("lineage conflict {context}: `{first}` and `{second}` overlap; use only the covering ref")]
    Conflict {
        first: ResourceRef,
        second: ResourceRef,
        context: String,
    },

    /// The transitive closure of a step reaches one ref at two different versions.
    #[error(
        "inconsistent lineage for step `{step_name}`: `{}` was reached as {first} and as {second}",
        .first.resource_ref()
    )]
    Consistency {
        step_name: String,
        first: Certificate,
        second: Certificate,
    },

    #[error("no lineage found for `{0}`")]
    NotFound(ResourceRef),

    #[error("resource `{resource_name}` still has unresolved placeholder {cert}")]
    PlaceHolder {
        resource_name: String,
        cert: Certificate,
    },

    #[error("malformed lineage data{}: {message}", file_suffix(.file))]
    Format {
        file: Option<PathBuf>,
        message: String,
    },

    #[error("invalid lineage json in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lineage io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no lineage was captured for snapshot `{0}`")]
    SnapshotNotFound(String),

    #[error("invalid resource name `{0}`")]
    InvalidResourceName(String),
}

impl LineageError {
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            file: None,
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attaches the file a format error was read from, leaving other errors untouched.
    pub fn in_file(self, path: &std::path::Path) -> Self {
        match self {
            Self::Format { file: None, message } => Self::Format {
                file: Some(path.to_path_buf()),
                message,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "lineage_conflict",
            Self::Consistency { .. } => "lineage_consistency",
            Self::NotFound(_) => "lineage_not_found",
            Self::PlaceHolder { .. } => "lineage_placeholder",
            Self::Format { .. } | Self::Json { .. } => "lineage_format_error",
            Self::Io { .. } => "lineage_io_error",
            Self::SnapshotNotFound(_) => "snapshot_not_found",
            Self::InvalidResourceName(_) => "invalid_resource_name",
        }
    }
}

fn file_suffix(file: &Option<PathBuf>) -> String {
    match file {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}
