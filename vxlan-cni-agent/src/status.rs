use std::{
    fmt::Display,
    io,
    path::{Path, PathBuf},
};

use log::warn;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Ready,
    Failed(String),
}

impl Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Ready => write!(f, "ready"),
            AgentStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Readiness file consumed by the node's supervisor (usually a probe).
/// Only changes are written out.
pub struct StatusFile {
    path: PathBuf,
    current: Option<AgentStatus>,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<&AgentStatus> {
        self.current.as_ref()
    }

    pub async fn mark_ready(&mut self) {
        self.set(AgentStatus::Ready).await
    }

    pub async fn mark_failed(&mut self, reason: impl Display) {
        self.set(AgentStatus::Failed(reason.to_string())).await
    }

    pub async fn remove(&mut self) {
        self.current = None;

        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!("Couldn't remove {}! {error}", self.path.display()),
        }
    }

    async fn set(&mut self, status: AgentStatus) {
        if self.current.as_ref() == Some(&status) {
            return;
        }

        match self.write(&status).await {
            Ok(()) => self.current = Some(status),
            Err(error) => warn!("Couldn't write {}! {error}", self.path.display()),
        }
    }

    async fn write(&self, status: &AgentStatus) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, format!("{status}\n")).await?;
        fs::rename(&temp_path, &self.path).await
    }
}
