//! Object storage operator construction.
//!
//! Sources, the archive writer and the archive verifier each get their own
//! `opendal::Operator`, so credentials and clients are never shared between
//! the write path and the verify path.

use cdnarchive_config::{StorageBackend, StorageConfig};
use opendal::Operator;

use crate::error::{PipelineError, Result};

/// Build an operator for `config`.
pub fn build_operator(config: &StorageConfig) -> Result<Operator> {
    let operator = match config.backend {
        StorageBackend::Fs => {
            let fs = config.fs.as_ref().ok_or_else(|| {
                PipelineError::InvalidConfig("fs config required for filesystem backend".into())
            })?;

            let fs_builder = opendal::services::Fs::default().root(&fs.path);
            Operator::new(fs_builder)
                .map_err(|e| {
                    PipelineError::InvalidConfig(format!(
                        "Failed to create filesystem operator: {}",
                        e
                    ))
                })?
                .finish()
        }
        StorageBackend::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                PipelineError::InvalidConfig("s3 config required for S3 backend".into())
            })?;

            let mut s3_builder = opendal::services::S3::default()
                .bucket(&s3.bucket)
                .region(&s3.region);

            if let Some(endpoint) = &s3.endpoint {
                s3_builder = s3_builder.endpoint(endpoint);
            }
            if let (Some(key), Some(secret)) = (&s3.access_key_id, &s3.secret_access_key) {
                s3_builder = s3_builder.access_key_id(key).secret_access_key(secret);
            }

            Operator::new(s3_builder)
                .map_err(|e| {
                    PipelineError::InvalidConfig(format!("Failed to create S3 operator: {}", e))
                })?
                .finish()
        }
        StorageBackend::R2 => {
            let r2 = config.r2.as_ref().ok_or_else(|| {
                PipelineError::InvalidConfig("r2 config required for R2 backend".into())
            })?;

            let endpoint = r2
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("https://{}.r2.cloudflarestorage.com", r2.account_id));

            let r2_builder = opendal::services::S3::default()
                .bucket(&r2.bucket)
                .region("auto")
                .endpoint(&endpoint)
                .access_key_id(&r2.access_key_id)
                .secret_access_key(&r2.secret_access_key);

            Operator::new(r2_builder)
                .map_err(|e| {
                    PipelineError::InvalidConfig(format!("Failed to create R2 operator: {}", e))
                })?
                .finish()
        }
    };

    tracing::debug!(location = %config.describe(), "Storage operator initialized");
    Ok(operator)
}

/// Turn a configured prefix into a directory path opendal can list.
pub(crate) fn dir_path(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnarchive_config::{FsConfig, R2Config};

    #[test]
    fn missing_backend_section_is_rejected() {
        let config = StorageConfig {
            backend: StorageBackend::R2,
            fs: None,
            s3: None,
            r2: None,
        };
        let err = build_operator(&config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn builds_fs_and_r2_operators() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StorageConfig {
            backend: StorageBackend::Fs,
            fs: Some(FsConfig {
                path: dir.path().display().to_string(),
            }),
            s3: None,
            r2: None,
        };
        assert!(build_operator(&fs).is_ok());

        let r2 = StorageConfig {
            backend: StorageBackend::R2,
            fs: None,
            s3: None,
            r2: Some(R2Config {
                bucket: "archive".to_string(),
                account_id: "acct".to_string(),
                access_key_id: "key".to_string(),
                secret_access_key: "secret".to_string(),
                endpoint: None,
            }),
        };
        assert!(build_operator(&r2).is_ok());
    }

    #[test]
    fn dir_paths_are_normalized() {
        assert_eq!(dir_path(""), "/");
        assert_eq!(dir_path("/"), "/");
        assert_eq!(dir_path("logs"), "logs/");
        assert_eq!(dir_path("/logs/web/"), "logs/web/");
    }
}
