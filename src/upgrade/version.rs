//! Kubernetes version parsing and upgrade path validation.

use std::fmt;

use semver::Version;
use thiserror::Error;

/// Why a transition between two versions is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    Downgrade,
    MajorSkip,
    MinorSkip { skew: u64, allowed: u64 },
    AlreadyAtTarget,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downgrade => f.write_str("downgrade is not supported"),
            Self::MajorSkip => f.write_str("cross-major version upgrades are not supported"),
            Self::MinorSkip { skew, allowed } => write!(
                f,
                "skipping {skew} minor versions is not supported, at most {allowed} allowed"
            ),
            Self::AlreadyAtTarget => f.write_str("cluster is already at the target version"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    Invalid(String),

    #[error("{current} cannot be upgraded to {target} ({reason})")]
    Unsupported {
        current: String,
        target: String,
        reason: UnsupportedReason,
    },
}

/// Outcome of checking one node against the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeVersion {
    NeedsUpgrade,
    AtTarget,
}

/// Parse a Kubernetes version as found in tags and cluster definitions.
///
/// Accepts an `<orchestrator>:` prefix (`Kubernetes:1.7.9`), a leading `v`
/// and `major.minor` shorthand.
pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let bare = trimmed
        .rsplit_once(':')
        .map_or(trimmed, |(_, version)| version)
        .trim_start_matches('v');

    let padded;
    let candidate = if bare.split('.').count() == 2 && !bare.contains('-') {
        padded = format!("{bare}.0");
        padded.as_str()
    } else {
        bare
    };

    Version::parse(candidate).map_err(|_| VersionError::Invalid(raw.to_string()))
}

/// Validates requested version transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    max_minor_skew: u64,
}

impl Default for VersionGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_MINOR_SKEW)
    }
}

impl VersionGate {
    pub const DEFAULT_MAX_MINOR_SKEW: u64 = 1;

    pub const fn new(max_minor_skew: u64) -> Self {
        Self { max_minor_skew }
    }

    pub const fn max_minor_skew(&self) -> u64 {
        self.max_minor_skew
    }

    pub fn parse_target(&self, target: &str) -> Result<Version, VersionError> {
        parse_version(target)
    }

    /// Check a single node's version against the target.
    pub fn check_node(&self, current: &str, target: &str) -> Result<NodeVersion, VersionError> {
        let from = parse_version(current)?;
        let to = parse_version(target)?;
        let unsupported = |reason| VersionError::Unsupported {
            current: current.to_string(),
            target: target.to_string(),
            reason,
        };

        if to < from {
            return Err(unsupported(UnsupportedReason::Downgrade));
        }
        if to == from {
            return Ok(NodeVersion::AtTarget);
        }
        if to.major != from.major {
            return Err(unsupported(UnsupportedReason::MajorSkip));
        }

        let skew = to.minor - from.minor;
        if skew > self.max_minor_skew {
            return Err(unsupported(UnsupportedReason::MinorSkip {
                skew,
                allowed: self.max_minor_skew,
            }));
        }

        Ok(NodeVersion::NeedsUpgrade)
    }

    /// Cluster-level check. `current` is the lowest version found on any node;
    /// equal versions are only accepted while remediation is pending.
    pub fn validate(
        &self,
        current: &str,
        target: &str,
        pending_remediation: bool,
    ) -> Result<(), VersionError> {
        match self.check_node(current, target)? {
            NodeVersion::NeedsUpgrade => Ok(()),
            NodeVersion::AtTarget if pending_remediation => Ok(()),
            NodeVersion::AtTarget => Err(VersionError::Unsupported {
                current: current.to_string(),
                target: target.to_string(),
                reason: UnsupportedReason::AlreadyAtTarget,
            }),
        }
    }
}
