use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{LineageError, LineageResult};
use crate::lineage::refs::ResourceRef;

/// A claim about the content of a [`ResourceRef`] at one point in time.
///
/// Equality ignores the comment: hash certificates compare by `(ref, hashval)`,
/// placeholders by `(ref, version, is_output)`. Two placeholders minted for the
/// same pending write therefore compare equal, while a re-run compares unequal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "CertificateRecord", from = "CertificateRecord")]
pub enum Certificate {
    Hash {
        resource_ref: ResourceRef,
        hashval: String,
        comment: String,
    },
    InputPlaceholder {
        resource_ref: ResourceRef,
        version: u64,
        comment: String,
    },
    OutputPlaceholder {
        resource_ref: ResourceRef,
        version: u64,
        comment: String,
    },
}

/// Persisted shape: input and output placeholders share `cert_type`
/// `placeholder` and differ only in `is_output`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "cert_type", rename_all = "snake_case")]
enum CertificateRecord {
    Hash {
        #[serde(rename = "ref")]
        resource_ref: ResourceRef,
        hashval: String,
        #[serde(default)]
        comment: String,
    },
    Placeholder {
        #[serde(rename = "ref")]
        resource_ref: ResourceRef,
        version: u64,
        is_output: bool,
        #[serde(default)]
        comment: String,
    },
}

impl From<Certificate> for CertificateRecord {
    fn from(cert: Certificate) -> Self {
        match cert {
            Certificate::Hash {
                resource_ref,
                hashval,
                comment,
            } => Self::Hash {
                resource_ref,
                hashval,
                comment,
            },
            Certificate::InputPlaceholder {
                resource_ref,
                version,
                comment,
            } => Self::Placeholder {
                resource_ref,
                version,
                is_output: false,
                comment,
            },
            Certificate::OutputPlaceholder {
                resource_ref,
                version,
                comment,
            } => Self::Placeholder {
                resource_ref,
                version,
                is_output: true,
                comment,
            },
        }
    }
}

impl From<CertificateRecord> for Certificate {
    fn from(record: CertificateRecord) -> Self {
        match record {
            CertificateRecord::Hash {
                resource_ref,
                hashval,
                comment,
            } => Self::Hash {
                resource_ref,
                hashval,
                comment,
            },
            CertificateRecord::Placeholder {
                resource_ref,
                version,
                is_output: true,
                comment,
            } => Self::OutputPlaceholder {
                resource_ref,
                version,
                comment,
            },
            CertificateRecord::Placeholder {
                resource_ref,
                version,
                is_output: false,
                comment,
            } => Self::InputPlaceholder {
                resource_ref,
                version,
                comment,
            },
        }
    }
}

impl Certificate {
    pub fn hash(resource_ref: ResourceRef, hashval: impl Into<String>, comment: impl Into<String>) -> Self {
        Self::Hash {
            resource_ref,
            hashval: hashval.into(),
            comment: comment.into(),
        }
    }

    pub fn input_placeholder(resource_ref: ResourceRef, version: u64, comment: impl Into<String>) -> Self {
        Self::InputPlaceholder {
            resource_ref,
            version,
            comment: comment.into(),
        }
    }

    pub fn output_placeholder(resource_ref: ResourceRef, version: u64, comment: impl Into<String>) -> Self {
        Self::OutputPlaceholder {
            resource_ref,
            version,
            comment: comment.into(),
        }
    }

    pub fn resource_ref(&self) -> &ResourceRef {
        match self {
            Self::Hash { resource_ref, .. }
            | Self::InputPlaceholder { resource_ref, .. }
            | Self::OutputPlaceholder { resource_ref, .. } => resource_ref,
        }
    }

    pub fn comment(&self) -> &str {
        match self {
            Self::Hash { comment, .. }
            | Self::InputPlaceholder { comment, .. }
            | Self::OutputPlaceholder { comment, .. } => comment,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        !matches!(self, Self::Hash { .. })
    }

    pub fn placeholder_version(&self) -> Option<u64> {
        match self {
            Self::Hash { .. } => None,
            Self::InputPlaceholder { version, .. } | Self::OutputPlaceholder { version, .. } => {
                Some(*version)
            }
        }
    }

    pub fn hashval(&self) -> Option<&str> {
        match self {
            Self::Hash { hashval, .. } => Some(hashval),
            _ => None,
        }
    }

    /// The hash certificate that confirms this placeholder, keeping ref and comment.
    pub fn resolved(&self, hashval: &str) -> Self {
        Self::hash(self.resource_ref().clone(), hashval, self.comment())
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }

    pub fn from_json(value: &Value) -> LineageResult<Self> {
        Self::deserialize(value).map_err(|err| LineageError::format(format!("certificate: {err}")))
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Hash {
                    resource_ref: left_ref,
                    hashval: left_hash,
                    ..
                },
                Self::Hash {
                    resource_ref: right_ref,
                    hashval: right_hash,
                    ..
                },
            ) => left_ref == right_ref && left_hash == right_hash,
            (
                Self::InputPlaceholder {
                    resource_ref: left_ref,
                    version: left_version,
                    ..
                },
                Self::InputPlaceholder {
                    resource_ref: right_ref,
                    version: right_version,
                    ..
                },
            )
            | (
                Self::OutputPlaceholder {
                    resource_ref: left_ref,
                    version: left_version,
                    ..
                },
                Self::OutputPlaceholder {
                    resource_ref: right_ref,
                    version: right_version,
                    ..
                },
            ) => left_ref == right_ref && left_version == right_version,
            _ => false,
        }
    }
}

impl Eq for Certificate {}

impl Hash for Certificate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource_ref().hash(state);
        match self {
            Self::Hash { hashval, .. } => {
                0u8.hash(state);
                hashval.hash(state);
            }
            Self::InputPlaceholder { version, .. } => {
                1u8.hash(state);
                version.hash(state);
            }
            Self::OutputPlaceholder { version, .. } => {
                2u8.hash(state);
                version.hash(state);
            }
        }
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hash {
                resource_ref,
                hashval,
                ..
            } => write!(f, "{resource_ref}@{hashval}"),
            Self::InputPlaceholder {
                resource_ref,
                version,
                ..
            } => write!(f, "{resource_ref}@input-placeholder-v{version}"),
            Self::OutputPlaceholder {
                resource_ref,
                version,
                ..
            } => write!(f, "{resource_ref}@output-placeholder-v{version}"),
        }
    }
}
