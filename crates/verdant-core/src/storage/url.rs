//! Parse storage URLs into backend configurations.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, RegexGroupMissingSnafu, StorageError};

use super::{LocalConfig, MemoryConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?P<protocol>https?)://(?P<endpoint>[^:/]+):(?P<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Memory,
}

/// Patterns in match order; the first hit wins.
static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::Memory, MEMORY_URL),
        (Backend::S3, S3_PATH),
        (Backend::S3, S3_VIRTUAL),
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Local, FILE_URI),
        (Backend::Local, FILE_PATH),
    ]
    .into_iter()
    .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("static storage URL pattern")))
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let Some((backend, caps)) = MATCHERS
            .iter()
            .find_map(|(backend, regex)| regex.captures(url).map(|caps| (*backend, caps)))
        else {
            return InvalidUrlSnafu { url }.fail();
        };

        match backend {
            Backend::S3 => Self::parse_s3(&caps),
            Backend::Local => Self::parse_local(&caps),
            Backend::Memory => Ok(BackendConfig::Memory(MemoryConfig {
                key: optional_key(&caps),
            })),
        }
    }

    fn parse_s3(caps: &Captures) -> Result<Self, StorageError> {
        let bucket = required(caps, "bucket")?;

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = caps.name("protocol").map_or("https", |p| p.as_str());
                format!("{protocol}://{}:{port}", endpoint.as_str())
            })
        });

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: optional_key(caps),
        }))
    }

    fn parse_local(caps: &Captures) -> Result<Self, StorageError> {
        let path = required(caps, "path")?;
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Ok(BackendConfig::Local(LocalConfig { path }))
    }

    /// Key prefix applied to every path, if the backend has one.
    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

fn required(caps: &Captures, group: &str) -> Result<String, StorageError> {
    caps.name(group)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| RegexGroupMissingSnafu { group }.build())
}

fn optional_key(caps: &Captures) -> Option<Path> {
    caps.name("key")
        .map(|m| m.as_str().trim_matches('/'))
        .filter(|key| !key.is_empty())
        .map(Path::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(url: &str) -> S3Config {
        match BackendConfig::parse_url(url).unwrap() {
            BackendConfig::S3(config) => config,
            other => panic!("expected S3 config, got {other:?}"),
        }
    }

    #[test]
    fn test_s3_url() {
        let config = s3("s3://bronze/sensor_events");
        assert_eq!(config.bucket, "bronze");
        assert_eq!(config.key, Some(Path::from("sensor_events")));
    }

    #[test]
    fn test_s3a_url_without_key() {
        let config = s3("s3a://bronze");
        assert_eq!(config.bucket, "bronze");
        assert_eq!(config.key, None);
    }

    #[test]
    fn test_s3_path_style_url() {
        let config = s3("https://s3.eu-west-1.amazonaws.com/bronze/log");
        assert_eq!(config.bucket, "bronze");
        assert_eq!(config.key, Some(Path::from("log")));
    }

    #[test]
    fn test_minio_endpoint_url() {
        if std::env::var("AWS_ENDPOINT").is_ok() {
            return;
        }
        let config = s3("s3::http://minio:9000/bronze/raw-log");
        assert_eq!(config.bucket, "bronze");
        assert_eq!(config.endpoint, Some("http://minio:9000".to_string()));
        assert_eq!(config.key, Some(Path::from("raw-log")));
    }

    #[test]
    fn test_local_urls() {
        assert_eq!(
            BackendConfig::parse_url("file:///var/lib/verdant").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/var/lib/verdant".to_string()
            })
        );
        assert_eq!(
            BackendConfig::parse_url("/tmp/log").unwrap(),
            BackendConfig::Local(LocalConfig {
                path: "/tmp/log".to_string()
            })
        );
    }

    #[test]
    fn test_memory_url() {
        assert_eq!(
            BackendConfig::parse_url("memory://").unwrap(),
            BackendConfig::Memory(MemoryConfig { key: None })
        );
        assert_eq!(
            BackendConfig::parse_url("memory://log").unwrap(),
            BackendConfig::Memory(MemoryConfig {
                key: Some(Path::from("log"))
            })
        );
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            BackendConfig::parse_url("ftp://nowhere"),
            Err(StorageError::InvalidUrl { .. })
        ));
    }
}
