//! Update collaborators
//!
//! The update scheduler and the `TriggerUpdate` method only see these
//! traits. The default implementations read a local release manifest and
//! report that automatic installation is unavailable.

use async_trait::async_trait;
use manager_ipc::messages::DownloadProgress;
use manager_ipc::transport::ElevatedToken;
use semver::Version;
use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors from checking for or installing updates
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Failed to read update manifest {path}: {source}")]
    ManifestIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid update manifest: {0}")]
    ManifestFormat(#[from] toml::de::Error),

    #[error("Invalid version {version:?}: {source}")]
    Version {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("Automatic installation is not supported on this platform")]
    Unsupported,

    #[error("Update check failed: {0}")]
    Check(String),
}

/// A release newer than the running build
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateInfo {
    pub version: String,
    pub url: String,
}

/// Looks for a newer release
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    /// `Ok(None)` when the running build is current
    async fn check_for_update(&self) -> Result<Option<UpdateInfo>, UpdateError>;
}

/// Downloads, verifies and runs an update on behalf of an elevated session
pub trait UpdateInstaller: Send + Sync {
    /// Start the operation. Progress ends with an item that is complete or
    /// carries an error.
    fn download_verify_and_execute(&self, token: ElevatedToken)
        -> mpsc::Receiver<DownloadProgress>;
}

/// Describes how the running binary was produced
pub trait BuildInfo: Send + Sync {
    fn is_official_build(&self) -> bool;
}

/// Official when compiled with `MANAGER_OFFICIAL_BUILD=1`
#[derive(Debug, Default, Clone, Copy)]
pub struct CompiledBuildInfo;

impl BuildInfo for CompiledBuildInfo {
    fn is_official_build(&self) -> bool {
        option_env!("MANAGER_OFFICIAL_BUILD") == Some("1")
    }
}

/// Checks a TOML release manifest (`version`, `url`) on the local disk
#[derive(Debug, Clone)]
pub struct ManifestUpdateChecker {
    manifest: Option<PathBuf>,
    current_version: String,
}

impl ManifestUpdateChecker {
    /// Compare against the version of this crate
    pub fn new(manifest: Option<PathBuf>) -> Self {
        Self {
            manifest,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Compare against an explicit running version
    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = version.into();
        self
    }
}

fn parse_version(version: &str) -> Result<Version, UpdateError> {
    Version::parse(version.trim_start_matches('v')).map_err(|source| UpdateError::Version {
        version: version.to_string(),
        source,
    })
}

#[async_trait]
impl UpdateChecker for ManifestUpdateChecker {
    async fn check_for_update(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        let path = match &self.manifest {
            Some(path) => path,
            None => {
                debug!("No update manifest configured");
                return Ok(None);
            }
        };

        let content = tokio::fs::read_to_string(path).await.map_err(|source| {
            UpdateError::ManifestIo {
                path: path.clone(),
                source,
            }
        })?;
        let latest: UpdateInfo = toml::from_str(&content)?;

        if parse_version(&latest.version)? > parse_version(&self.current_version)? {
            info!(
                "Release {} is newer than {}",
                latest.version, self.current_version
            );
            Ok(Some(latest))
        } else {
            Ok(None)
        }
    }
}

/// Installer for platforms without automatic installation
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedInstaller;

impl UpdateInstaller for UnsupportedInstaller {
    fn download_verify_and_execute(
        &self,
        token: ElevatedToken,
    ) -> mpsc::Receiver<DownloadProgress> {
        warn!(
            "Update requested by UID={} but installation is unsupported",
            token.uid
        );
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(DownloadProgress::failed(
            "Preparing update",
            UpdateError::Unsupported.to_string(),
        ));
        rx
    }
}
