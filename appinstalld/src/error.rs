//! Error taxonomy for the app-installation server.
//!
//! Domain errors are recovered at the protocol boundary and translated into
//! an `ErrorResponse`; [`ServerError::payload`] produces the wire shape.

use std::collections::BTreeMap;

/// Errors raised by the archive codec.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive could not be opened")]
    NoSuchFile,

    #[error("archive metadata could not be read")]
    CorruptFile,

    #[error("archive entry could not be read")]
    Unknown,

    #[error("archive entry could not be written")]
    UnknownWrite,
}

/// Errors raised while locating an app bundle inside an extracted package.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("no .app bundle found in Payload directory")]
    MissingAppBundle,
}

/// Errors raised by the developer disk manager.
#[derive(Debug, thiserror::Error)]
pub enum DeveloperDiskError {
    #[error("no developer disks exist for this operating system")]
    UnsupportedOperatingSystem,

    #[error("no download URL is known for this operating system version")]
    UnknownDownloadURL,

    #[error("downloaded archive did not contain a disk and signature")]
    DownloadedDiskNotFound,

    #[error("developer disk download failed: {0}")]
    Http(String),

    #[error("developer disk io failed")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Errors surfaced to the remote client as an `ErrorResponse`.
///
/// Each variant carries a stable numeric wire code; anything that is not a
/// first-class protocol failure is wrapped into [`ServerError::Underlying`]
/// (or [`ServerError::Unknown`] when no description exists) at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("an unknown error occurred")]
    Unknown { description: Option<String> },

    #[error("could not connect to device")]
    ConnectionFailed,

    #[error("lost connection to client")]
    LostConnection,

    #[error("device not found")]
    DeviceNotFound,

    #[error("failed to write data to device")]
    DeviceWriteFailed,

    #[error("invalid request")]
    InvalidRequest,

    #[error("invalid response")]
    InvalidResponse,

    #[error("invalid app")]
    InvalidApp,

    #[error("installation failed: {0}")]
    InstallationFailed(String),

    #[error("unknown request")]
    UnknownRequest,

    #[error("invalid anisette data")]
    InvalidAnisetteData,

    #[error("provisioning profile not found")]
    ProfileNotFound,

    #[error("failed to remove app")]
    AppDeletionFailed,

    #[error("{description}")]
    Underlying { description: String },
}

/// Wire representation of a failure: a numeric code plus a user-info map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: i64,
    pub user_info: BTreeMap<String, String>,
}

const LOCALIZED_DESCRIPTION: &str = "NSLocalizedDescription";
const LOCALIZED_FAILURE_REASON: &str = "NSLocalizedFailureReason";
const LOCALIZED_RECOVERY_SUGGESTION: &str = "NSLocalizedRecoverySuggestion";

impl ServerError {
    /// Stable numeric code carried in `ErrorResponse`.
    pub fn code(&self) -> i64 {
        match self {
            ServerError::Unknown { .. } => 0,
            ServerError::ConnectionFailed => 1,
            ServerError::LostConnection => 2,
            ServerError::DeviceNotFound => 3,
            ServerError::DeviceWriteFailed => 4,
            ServerError::InvalidRequest => 5,
            ServerError::InvalidResponse => 6,
            ServerError::InvalidApp => 7,
            ServerError::InstallationFailed(_) => 8,
            ServerError::UnknownRequest => 11,
            ServerError::InvalidAnisetteData => 13,
            ServerError::ProfileNotFound => 15,
            ServerError::AppDeletionFailed => 16,
            ServerError::Underlying { .. } => 1000,
        }
    }

    /// Builds the `{code, userInfo}` shape sent to the client.
    pub fn payload(&self) -> ErrorPayload {
        let mut user_info = BTreeMap::new();

        match self {
            ServerError::Unknown {
                description: Some(description),
            } => {
                if is_allocation_failure(description) {
                    // Known interaction with real-time security software on
                    // the host. Surface an actionable message instead of the
                    // raw allocator error.
                    user_info.insert(
                        LOCALIZED_FAILURE_REASON.into(),
                        "Security software blocked the installation.".into(),
                    );
                    user_info.insert(
                        LOCALIZED_RECOVERY_SUGGESTION.into(),
                        "Disable real-time protection on this computer, then try again.".into(),
                    );
                } else {
                    user_info.insert(LOCALIZED_DESCRIPTION.into(), description.clone());
                    user_info.insert(LOCALIZED_FAILURE_REASON.into(), description.clone());
                }
            }
            ServerError::Unknown { description: None } => {}
            ServerError::Underlying { description } => {
                user_info.insert(LOCALIZED_DESCRIPTION.into(), description.clone());
            }
            ServerError::InstallationFailed(reason) => {
                user_info.insert(LOCALIZED_DESCRIPTION.into(), reason.clone());
            }
            _ => {}
        }

        ErrorPayload {
            code: self.code(),
            user_info,
        }
    }
}

fn is_allocation_failure(description: &str) -> bool {
    (description.contains("allocation") && description.contains("failed"))
        || description.contains("too long")
}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => ServerError::LostConnection,
            _ => ServerError::Underlying {
                description: value.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(_: serde_json::Error) -> Self {
        ServerError::InvalidRequest
    }
}

impl From<ArchiveError> for ServerError {
    fn from(value: ArchiveError) -> Self {
        ServerError::Underlying {
            description: value.to_string(),
        }
    }
}

impl From<SignError> for ServerError {
    fn from(value: SignError) -> Self {
        ServerError::Underlying {
            description: value.to_string(),
        }
    }
}

impl From<DeveloperDiskError> for ServerError {
    fn from(value: DeveloperDiskError) -> Self {
        ServerError::Underlying {
            description: value.to_string(),
        }
    }
}
