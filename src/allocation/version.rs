use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::layout::MANIFEST_FILE;
use crate::error::SweepError;
use crate::io::{ArtifactStore, ObjectUri};

/// Experiment version, rendered as the path segment `vMAJOR.MINOR.PATCH`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const INITIAL: SemVer = SemVer::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SweepError::InvalidConfig(format!("'{}' is not a version (expected vX.Y.Z)", s));
        let digits = s.strip_prefix('v').unwrap_or(s);
        let parts: Vec<&str> = digits.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }
        let parse = |part: &str| part.parse::<u32>().map_err(|_| invalid());
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl TryFrom<String> for SemVer {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SemVer> for String {
    fn from(version: SemVer) -> Self {
        version.to_string()
    }
}

/// How to pick the version of a new allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionMode {
    BumpMajor,
    BumpMinor,
    BumpPatch,
    /// Reuse the highest existing version
    #[default]
    Keep,
    Explicit(SemVer),
}

impl FromStr for VersionMode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bumpmajor" => Ok(VersionMode::BumpMajor),
            "bumpminor" => Ok(VersionMode::BumpMinor),
            "bumppatch" => Ok(VersionMode::BumpPatch),
            "keep" => Ok(VersionMode::Keep),
            _ => s.parse().map(VersionMode::Explicit),
        }
    }
}

impl VersionMode {
    /// Pick the version given the versions that already exist
    ///
    /// Without prior versions every mode other than an explicit one starts at `v1.0.0`.
    pub fn resolve(&self, existing: &BTreeSet<SemVer>) -> SemVer {
        if let VersionMode::Explicit(version) = self {
            return *version;
        }
        let Some(latest) = existing.iter().next_back().copied() else {
            return SemVer::INITIAL;
        };
        match self {
            VersionMode::BumpMajor => SemVer::new(latest.major + 1, 0, 0),
            VersionMode::BumpMinor => SemVer::new(latest.major, latest.minor + 1, 0),
            VersionMode::BumpPatch => SemVer::new(latest.major, latest.minor, latest.patch + 1),
            VersionMode::Keep | VersionMode::Explicit(_) => latest,
        }
    }
}

/// Versions of an experiment that hold at least one allocated run
///
/// A run counts once its `manifest.yml` exists at
/// `<experiment_root>/<version>/<timestamp>/manifest.yml`.
pub async fn discover_versions(
    artifacts: &ArtifactStore,
    experiment_root: &ObjectUri,
) -> Result<BTreeSet<SemVer>> {
    let objects = artifacts.list(experiment_root).await?;
    let versions = objects
        .iter()
        .filter_map(|uri| uri.strip_prefix(experiment_root))
        .filter_map(|relative| {
            let segments: Vec<&str> = relative.split('/').collect();
            match segments.as_slice() {
                [version, _timestamp, file] if *file == MANIFEST_FILE => version.parse().ok(),
                _ => None,
            }
        })
        .collect();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::LocalObjectStore;
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn versions(list: &[&str]) -> BTreeSet<SemVer> {
        list.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn test_parse_and_display() {
        let version: SemVer = "v2.10.3".parse().unwrap();
        assert_eq!(version, SemVer::new(2, 10, 3));
        assert_eq!(version.to_string(), "v2.10.3");
        assert_eq!("1.0.0".parse::<SemVer>().unwrap(), SemVer::INITIAL);
        assert!("v1.0".parse::<SemVer>().is_err());
        assert!("vx.0.0".parse::<SemVer>().is_err());
    }

    #[test]
    fn test_first_version() {
        let none = BTreeSet::new();
        for mode in [
            VersionMode::Keep,
            VersionMode::BumpMajor,
            VersionMode::BumpMinor,
            VersionMode::BumpPatch,
        ] {
            assert_eq!(mode.resolve(&none), SemVer::INITIAL);
        }
        assert_eq!(
            VersionMode::Explicit(SemVer::new(0, 3, 0)).resolve(&none),
            SemVer::new(0, 3, 0)
        );
    }

    #[test]
    fn test_bumps_apply_to_highest() {
        let existing = versions(&["v1.0.0", "v1.4.2", "v1.10.0"]);
        assert_eq!(VersionMode::Keep.resolve(&existing), SemVer::new(1, 10, 0));
        assert_eq!(VersionMode::BumpPatch.resolve(&existing), SemVer::new(1, 10, 1));
        assert_eq!(VersionMode::BumpMinor.resolve(&existing), SemVer::new(1, 11, 0));
        assert_eq!(VersionMode::BumpMajor.resolve(&existing), SemVer::new(2, 0, 0));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("bumpminor".parse::<VersionMode>().unwrap(), VersionMode::BumpMinor);
        assert_eq!("KEEP".parse::<VersionMode>().unwrap(), VersionMode::Keep);
        assert_eq!(
            "v3.1.4".parse::<VersionMode>().unwrap(),
            VersionMode::Explicit(SemVer::new(3, 1, 4))
        );
        assert!("sideways".parse::<VersionMode>().is_err());
    }

    #[tokio::test]
    async fn test_discover_versions_requires_manifest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()));
        let artifacts = ArtifactStore::with_cache_dir(store, dir.path().join("cache"));
        let root = ObjectUri::new("bucket", "sweep/task");

        for key in [
            "v1.0.0/ts1/manifest.yml",
            "v1.2.0/ts2/manifest.yml",
            "v1.2.0/ts2/specs.pq",
            "v9.0.0/ts3/specs.pq",
            "notaversion/ts/manifest.yml",
        ] {
            artifacts
                .put_bytes(&root.join(key), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let found = discover_versions(&artifacts, &root).await.unwrap();
        assert_eq!(found, versions(&["v1.0.0", "v1.2.0"]));
    }
}
