//! `HandoverStore`: per-stage output files plus previous-stage discovery.
//!
//! Mirrors the on-disk layout: `runs/<runId>/stages/<name>/{output.md,output.json}`
//! plus an aggregated `runs/<runId>/HANDOVER.md`.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::model::OutputFiles;
use crate::Result;

/// A previous stage's output, referenced by file path rather than inlined —
/// oversized previous outputs stay out of the next stage's prompt context.
#[derive(Debug, Clone)]
pub struct PreviousStageRef {
    pub stage_name: String,
    pub structured_path: PathBuf,
    pub raw_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutput<'a> {
    pub raw_text: &'a str,
    pub structured: Option<&'a serde_json::Value>,
}

#[async_trait]
pub trait HandoverStore: Send + Sync {
    async fn save(&self, stage_name: &str, output: StageOutput<'_>) -> Result<OutputFiles>;
    async fn previous_stages(&self) -> Result<Vec<PreviousStageRef>>;
    async fn write_summary(&self, pipeline_name: &str, entries: &[(String, String)]) -> Result<PathBuf>;
    fn root_dir(&self) -> PathBuf;
}

pub struct FileHandoverStore {
    runs_root: PathBuf,
    run_id: Uuid,
}

impl FileHandoverStore {
    pub fn new(root: impl Into<PathBuf>, run_id: Uuid) -> Self {
        Self {
            runs_root: root.into(),
            run_id,
        }
    }

    fn run_dir(&self) -> PathBuf {
        self.runs_root.join("runs").join(self.run_id.to_string())
    }

    fn stage_dir(&self, stage_name: &str) -> PathBuf {
        self.run_dir().join("stages").join(stage_name)
    }
}

#[async_trait]
impl HandoverStore for FileHandoverStore {
    async fn save(&self, stage_name: &str, output: StageOutput<'_>) -> Result<OutputFiles> {
        let dir = self.stage_dir(stage_name);
        tokio::fs::create_dir_all(&dir).await?;

        let md_path = dir.join("output.md");
        let json_path = dir.join("output.json");

        tokio::fs::write(&md_path, output.raw_text).await?;
        let structured_json = output
            .structured
            .map(|v| serde_json::to_vec_pretty(v))
            .transpose()?
            .unwrap_or_else(|| b"null".to_vec());
        tokio::fs::write(&json_path, structured_json).await?;

        Ok(OutputFiles {
            structured: json_path.to_string_lossy().into_owned(),
            raw: md_path.to_string_lossy().into_owned(),
        })
    }

    async fn previous_stages(&self) -> Result<Vec<PreviousStageRef>> {
        let stages_dir = self.run_dir().join("stages");
        let mut refs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&stages_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let stage_name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            refs.push(PreviousStageRef {
                stage_name,
                structured_path: dir.join("output.json"),
                raw_path: dir.join("output.md"),
            });
        }
        refs.sort_by(|a, b| a.stage_name.cmp(&b.stage_name));
        Ok(refs)
    }

    async fn write_summary(&self, pipeline_name: &str, entries: &[(String, String)]) -> Result<PathBuf> {
        let mut md = String::new();
        md.push_str(&format!("# Handover — {pipeline_name}\n\n"));
        md.push_str(&format!("_generated {}_\n\n", Utc::now().to_rfc3339()));
        for (stage_name, summary) in entries {
            md.push_str(&format!("## {stage_name}\n\n{summary}\n\n"));
        }

        let path = self.run_dir().join("HANDOVER.md");
        tokio::fs::create_dir_all(self.run_dir()).await?;
        tokio::fs::write(&path, md).await?;
        Ok(path)
    }

    fn root_dir(&self) -> PathBuf {
        self.run_dir()
    }
}
