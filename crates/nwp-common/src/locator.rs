//! Locations of forecast files: local paths or objects in a bucket.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NwpError, NwpResult};

/// Object store URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scheme {
    /// Google Cloud Storage (`gs://`)
    Gcs,
    /// Amazon S3 or compatible (`s3://`)
    S3,
    /// Process-local in-memory store (`memory://`), used for tests and dry runs
    Memory,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Gcs => "gs",
            Scheme::S3 => "s3",
            Scheme::Memory => "memory",
        }
    }

    fn from_prefix(s: &str) -> Option<(Self, &str)> {
        [Scheme::Gcs, Scheme::S3, Scheme::Memory]
            .into_iter()
            .find_map(|scheme| {
                s.strip_prefix(scheme.as_str())
                    .and_then(|rest| rest.strip_prefix("://"))
                    .map(|rest| (scheme, rest))
            })
    }
}

/// Where a file lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Locator {
    Local(PathBuf),
    Remote {
        scheme: Scheme,
        bucket: String,
        key: String,
    },
}

impl Locator {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Locator::Local(path.into())
    }

    pub fn remote(scheme: Scheme, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Locator::Remote {
            scheme,
            bucket: bucket.into(),
            key: key.into().trim_start_matches('/').to_string(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Locator::Local(_))
    }

    pub fn as_local_path(&self) -> Option<&Path> {
        match self {
            Locator::Local(p) => Some(p),
            Locator::Remote { .. } => None,
        }
    }

    /// Append a relative key/path component.
    pub fn join(&self, rel: &str) -> Self {
        let rel = rel.trim_start_matches('/');
        match self {
            Locator::Local(p) => Locator::Local(p.join(rel)),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => {
                let key = if key.is_empty() {
                    rel.to_string()
                } else {
                    format!("{}/{}", key.trim_end_matches('/'), rel)
                };
                Locator::Remote {
                    scheme: *scheme,
                    bucket: bucket.clone(),
                    key,
                }
            }
        }
    }

    /// The containing directory or key prefix, if any.
    pub fn parent(&self) -> Option<Self> {
        match self {
            Locator::Local(p) => p.parent().map(|p| Locator::Local(p.to_path_buf())),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => key.trim_end_matches('/').rsplit_once('/').map(|(prefix, _)| Locator::Remote {
                scheme: *scheme,
                bucket: bucket.clone(),
                key: prefix.to_string(),
            }),
        }
    }

    /// Last path segment, if any.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Locator::Local(p) => p.file_name().and_then(|n| n.to_str()),
            Locator::Remote { key, .. } => key.rsplit('/').find(|s| !s.is_empty()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Local(p) => write!(f, "{}", p.display()),
            Locator::Remote {
                scheme,
                bucket,
                key,
            } => write!(f, "{}://{}/{}", scheme.as_str(), bucket, key),
        }
    }
}

impl FromStr for Locator {
    type Err = NwpError;

    fn from_str(s: &str) -> NwpResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NwpError::InvalidLocator("empty locator".to_string()));
        }

        match Scheme::from_prefix(s) {
            Some((scheme, rest)) => {
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(NwpError::InvalidLocator(format!("missing bucket in {}", s)));
                }
                Ok(Locator::remote(scheme, bucket, key))
            }
            None if s.contains("://") => Err(NwpError::InvalidLocator(format!(
                "unsupported scheme in {}",
                s
            ))),
            None => Ok(Locator::Local(PathBuf::from(s))),
        }
    }
}

impl TryFrom<String> for Locator {
    type Error = NwpError;

    fn try_from(s: String) -> NwpResult<Self> {
        s.parse()
    }
}

impl From<Locator> for String {
    fn from(l: Locator) -> Self {
        l.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gcs() {
        let loc: Locator = "gs://noaa-gfs/gfs.20240101/00/atmos/gfs.t00z.pgrb2.0p25.f000"
            .parse()
            .unwrap();
        assert_eq!(
            loc,
            Locator::remote(
                Scheme::Gcs,
                "noaa-gfs",
                "gfs.20240101/00/atmos/gfs.t00z.pgrb2.0p25.f000"
            )
        );
        assert_eq!(loc.file_name(), Some("gfs.t00z.pgrb2.0p25.f000"));
    }

    #[test]
    fn test_parse_local_and_display_roundtrip() {
        let loc: Locator = "/tmp/nwp-data/gfs/f000".parse().unwrap();
        assert!(loc.is_local());
        assert_eq!(loc.to_string(), "/tmp/nwp-data/gfs/f000");

        let remote: Locator = "s3://bucket/a/b".parse().unwrap();
        assert_eq!(remote.to_string(), "s3://bucket/a/b");
    }

    #[test]
    fn test_parent() {
        let loc = Locator::remote(Scheme::Gcs, "b", "gfs/0p25/20240101/00/f003");
        assert_eq!(
            loc.parent(),
            Some(Locator::remote(Scheme::Gcs, "b", "gfs/0p25/20240101/00"))
        );
        assert_eq!(Locator::remote(Scheme::Gcs, "b", "top").parent(), None);
        assert_eq!(
            Locator::local("/tmp/nwp/f000").parent(),
            Some(Locator::local("/tmp/nwp"))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("gs:///key".parse::<Locator>().is_err());
        assert!("ftp://host/file".parse::<Locator>().is_err());
        assert!("".parse::<Locator>().is_err());
    }

    #[test]
    fn test_join() {
        let root: Locator = "gs://bucket".parse().unwrap();
        assert_eq!(root.join("out.zarr/.zattrs").to_string(), "gs://bucket/out.zarr/.zattrs");

        let prefix: Locator = "gs://bucket/nwp/".parse().unwrap();
        assert_eq!(prefix.join("/x").to_string(), "gs://bucket/nwp/x");

        let local = Locator::local("/data");
        assert_eq!(local.join("a/b"), Locator::local("/data/a/b"));
    }
}
