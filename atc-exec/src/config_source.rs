//! Task config sources
//!
//! Where a task step's config comes from: inline in the pipeline, a YAML
//! file produced by an earlier step, or the merge of both.

use crate::{ArtifactSource, ExecError, SourceRepository};
use async_trait::async_trait;
use atc_core::TaskConfig;
use std::sync::Arc;

/// Fetches a task config, given the build's artifact sources.
#[async_trait]
pub trait TaskConfigSource: Send + Sync {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, ExecError>;
}

/// A fixed, inline config.
pub struct StaticConfigSource {
    config: TaskConfig,
}

impl StaticConfigSource {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TaskConfigSource for StaticConfigSource {
    async fn fetch_config(&self, _repo: &SourceRepository) -> Result<TaskConfig, ExecError> {
        Ok(self.config.clone())
    }
}

/// A config loaded from `<artifact-source>/<path>` in the repository.
///
/// The first path segment names the artifact source; the remainder is the
/// file to stream out of it. The file is parsed as YAML and validated.
pub struct FileConfigSource {
    path: String,
}

impl FileConfigSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskConfigSource for FileConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, ExecError> {
        let (source_name, file_path) = self
            .path
            .split_once('/')
            .ok_or_else(|| ExecError::UnspecifiedArtifactSource(self.path.clone()))?;

        let source: Arc<dyn ArtifactSource> = repo
            .source_for(source_name)
            .ok_or_else(|| ExecError::UnknownArtifactSource(source_name.to_string()))?;

        let bytes = source.stream_file(file_path).await?;

        let config: TaskConfig = serde_yaml::from_slice(&bytes)
            .map_err(|err| ExecError::MalformedTaskConfig(err.to_string()))?;
        config.validate()?;

        Ok(config)
    }
}

/// `A ⊕ B`: B's fields override A's. A's error short-circuits B.
pub struct MergedConfigSource {
    a: Arc<dyn TaskConfigSource>,
    b: Arc<dyn TaskConfigSource>,
}

impl MergedConfigSource {
    pub fn new(a: Arc<dyn TaskConfigSource>, b: Arc<dyn TaskConfigSource>) -> Self {
        Self { a, b }
    }
}

#[async_trait]
impl TaskConfigSource for MergedConfigSource {
    async fn fetch_config(&self, repo: &SourceRepository) -> Result<TaskConfig, ExecError> {
        let base = self.a.fetch_config(repo).await?;
        let overlay = self.b.fetch_config(repo).await?;
        Ok(base.merge(overlay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArtifactDestination;
    use atc_core::{TaskInputConfig, TaskRunConfig};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn some_config() -> TaskConfig {
        TaskConfig {
            platform: "some-platform".to_string(),
            tags: vec!["some".to_string(), "tags".to_string()],
            image: "some-image".to_string(),
            params: BTreeMap::from([("PARAM".to_string(), "value".to_string())]),
            run: TaskRunConfig {
                path: "ls".to_string(),
                args: vec!["-al".to_string()],
            },
            inputs: vec![TaskInputConfig {
                name: "some-input".to_string(),
                path: Some("some-path".to_string()),
            }],
        }
    }

    /// Artifact source serving fixed file bytes and recording requests.
    #[derive(Default)]
    struct FileServingSource {
        bytes: Vec<u8>,
        requested: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FileServingSource {
        fn serving(bytes: Vec<u8>) -> Self {
            Self {
                bytes,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ArtifactSource for FileServingSource {
        async fn stream_to(&self, _d: &dyn ArtifactDestination) -> Result<(), ExecError> {
            Ok(())
        }

        async fn stream_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
            self.requested.lock().unwrap().push(path.to_string());
            if self.fail {
                return Err(ExecError::FileNotFound(path.to_string()));
            }
            Ok(self.bytes.clone())
        }
    }

    #[tokio::test]
    async fn test_static_source_returns_the_config() {
        let repo = SourceRepository::new();
        let source = StaticConfigSource::new(some_config());

        let fetched = source.fetch_config(&repo).await.unwrap();
        assert_eq!(fetched, some_config());
    }

    #[tokio::test]
    async fn test_file_source_without_a_source_prefix() {
        let repo = SourceRepository::new();
        let source = FileConfigSource::new("foo-bar.yml");

        let err = source.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::UnspecifiedArtifactSource(p) if p == "foo-bar.yml"));
    }

    #[tokio::test]
    async fn test_file_source_with_unknown_artifact_source() {
        let repo = SourceRepository::new();
        let source = FileConfigSource::new("some/build.yml");

        let err = source.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownArtifactSource(s) if s == "some"));
    }

    #[tokio::test]
    async fn test_file_source_fetches_via_first_path_segment() {
        let repo = SourceRepository::new();
        let marshalled = serde_yaml::to_string(&some_config()).unwrap();
        let artifact = Arc::new(FileServingSource::serving(marshalled.into_bytes()));
        repo.register_source("some", artifact.clone());

        let source = FileConfigSource::new("some/path/to/build.yml");
        let fetched = source.fetch_config(&repo).await.unwrap();

        assert_eq!(fetched, some_config());
        assert_eq!(
            artifact.requested.lock().unwrap().clone(),
            vec!["path/to/build.yml".to_string()]
        );
    }

    #[tokio::test]
    async fn test_file_source_rejects_invalid_config() {
        let repo = SourceRepository::new();

        let mut invalid = some_config();
        invalid.platform = String::new();
        invalid.run = TaskRunConfig::default();
        let marshalled = serde_yaml::to_string(&invalid).unwrap();
        repo.register_source(
            "some",
            Arc::new(FileServingSource::serving(marshalled.into_bytes())),
        );

        let source = FileConfigSource::new("some/build.yml");
        let err = source.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::InvalidTaskConfig(_)));
    }

    #[tokio::test]
    async fn test_file_source_rejects_malformed_yaml() {
        let repo = SourceRepository::new();
        repo.register_source(
            "some",
            Arc::new(FileServingSource::serving(b"{{bogus".to_vec())),
        );

        let source = FileConfigSource::new("some/build.yml");
        let err = source.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::MalformedTaskConfig(_)));
    }

    #[tokio::test]
    async fn test_file_source_propagates_stream_errors() {
        let repo = SourceRepository::new();
        repo.register_source(
            "some",
            Arc::new(FileServingSource {
                fail: true,
                ..FileServingSource::default()
            }),
        );

        let source = FileConfigSource::new("some/build.yml");
        let err = source.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_merged_source_overlays_b_on_a() {
        let repo = SourceRepository::new();

        let a = TaskConfig {
            image: "some-image".to_string(),
            params: BTreeMap::from([("PARAM".to_string(), "A".to_string())]),
            ..TaskConfig::default()
        };
        let b = TaskConfig {
            params: BTreeMap::from([("PARAM".to_string(), "B".to_string())]),
            ..TaskConfig::default()
        };

        let merged = MergedConfigSource::new(
            Arc::new(StaticConfigSource::new(a)),
            Arc::new(StaticConfigSource::new(b)),
        );

        let fetched = merged.fetch_config(&repo).await.unwrap();
        assert_eq!(fetched.image, "some-image");
        assert_eq!(fetched.params.get("PARAM").unwrap(), "B");
    }

    #[tokio::test]
    async fn test_merged_source_short_circuits_on_a_error() {
        let repo = SourceRepository::new();

        struct FailingSource;

        #[async_trait]
        impl TaskConfigSource for FailingSource {
            async fn fetch_config(&self, _repo: &SourceRepository) -> Result<TaskConfig, ExecError> {
                Err(ExecError::UnknownArtifactSource("nope".to_string()))
            }
        }

        #[derive(Default)]
        struct CountingSource {
            calls: Mutex<u32>,
        }

        #[async_trait]
        impl TaskConfigSource for CountingSource {
            async fn fetch_config(&self, _repo: &SourceRepository) -> Result<TaskConfig, ExecError> {
                *self.calls.lock().unwrap() += 1;
                Ok(TaskConfig::default())
            }
        }

        let b = Arc::new(CountingSource::default());
        let merged = MergedConfigSource::new(Arc::new(FailingSource), b.clone());

        let err = merged.fetch_config(&repo).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownArtifactSource(_)));
        assert_eq!(*b.calls.lock().unwrap(), 0);
    }
}
