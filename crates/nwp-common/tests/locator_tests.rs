//! Tests for Locator parsing as it appears in configuration files.

use std::path::Path;

use nwp_common::{Locator, NwpError, Scheme};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Target {
    destination: Locator,
}

// ============================================================================
// Deserialization
// ============================================================================

#[test]
fn test_locator_from_yaml_remote() {
    let target: Target = serde_yaml::from_str("destination: gs://my-bucket/nwp-data/").unwrap();
    match target.destination {
        Locator::Remote {
            scheme,
            bucket,
            key,
        } => {
            assert_eq!(scheme, Scheme::Gcs);
            assert_eq!(bucket, "my-bucket");
            assert_eq!(key, "nwp-data/");
        }
        other => panic!("expected remote locator, got {:?}", other),
    }
}

#[test]
fn test_locator_from_yaml_local() {
    let target: Target = serde_yaml::from_str("destination: /tmp/nwp-data").unwrap();
    assert_eq!(target.destination.as_local_path(), Some(Path::new("/tmp/nwp-data")));
}

#[test]
fn test_locator_from_yaml_rejects_unknown_scheme() {
    let result: Result<Target, _> = serde_yaml::from_str("destination: azure://c/k");
    assert!(result.is_err());
}

#[test]
fn test_locator_serializes_as_string() {
    let loc = Locator::remote(Scheme::S3, "bucket", "a/b.grib");
    let json = serde_json::to_string(&loc).unwrap();
    assert_eq!(json, "\"s3://bucket/a/b.grib\"");
}

// ============================================================================
// Parse errors
// ============================================================================

#[test]
fn test_parse_error_kind() {
    let err = "memory://".parse::<Locator>().unwrap_err();
    assert!(matches!(err, NwpError::InvalidLocator(_)));
}
