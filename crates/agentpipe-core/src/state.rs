//! `StateStore`: persists and loads `RunState` JSON keyed by `runId`.
//!
//! Writes are atomic: the new content lands in a sibling temp file first, then
//! an OS-level rename replaces the target, so a reader never observes a partial
//! write (the same temp-file-then-rename discipline production file writers use).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::RunState;
use crate::{Error, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, state: &RunState) -> Result<()>;
    async fn load(&self, run_id: Uuid) -> Result<RunState>;
}

/// Writes to `<root>/state/runs/<runId>.json`, matching the on-disk layout.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.root
            .join("state/runs")
            .join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, state: &RunState) -> Result<()> {
        let path = self.path_for(state.run_id);
        let dir = path.parent().ok_or_else(|| {
            Error::Other(format!("state path {} has no parent directory", path.display()))
        })?;
        tokio::fs::create_dir_all(dir).await?;

        let json = serde_json::to_vec_pretty(state)?;
        let temp_path = temp_sibling(&path);
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<RunState> {
        let path = self.path_for(run_id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::RunNotFound(run_id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| format!(".{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| ".state.tmp".to_string());
    path.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Artifacts, PipelineConfig, RunStatus, Settings, Trigger, TriggerSource,
    };

    fn sample_state(run_id: Uuid) -> RunState {
        RunState {
            run_id,
            pipeline_config: PipelineConfig {
                name: "test".into(),
                trigger: TriggerSource {
                    kind: "manual".into(),
                    branches: vec![],
                },
                stages: vec![],
                settings: Settings::default(),
                git: Default::default(),
                pull_request: None,
                looping: Default::default(),
                context_reduction: Default::default(),
                notifications: Default::default(),
            },
            trigger: Trigger {
                kind: "manual".into(),
                commit_sha: "abc123".into(),
                timestamp: chrono::Utc::now(),
            },
            stages: vec![],
            status: RunStatus::Running,
            artifacts: Artifacts {
                initial_commit: "abc123".into(),
                final_commit: None,
                changed_files: vec![],
                total_duration: 0.0,
                pull_request: None,
                handover_dir: "/tmp/handover".into(),
            },
        }
    }

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let state = sample_state(run_id);

        store.save(&state).await.unwrap();
        let loaded = store.load(run_id).await.unwrap();

        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.pipeline_config.name, state.pipeline_config.name);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let run_id = Uuid::new_v4();
        store.save(&sample_state(run_id)).await.unwrap();

        let runs_dir = dir.path().join("state/runs");
        let mut entries = tokio::fs::read_dir(&runs_dir).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec![format!("{run_id}.json")]);
    }

    #[tokio::test]
    async fn loading_unknown_run_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::RunNotFound(_)));
    }
}
