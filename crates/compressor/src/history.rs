//! Job history persisted as JSON files, one per finished job.

use crate::job::Job;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct JobHistory {
    dir: PathBuf,
}

impl JobHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `job` to `{id}.json`, replacing any earlier snapshot
    pub fn save(&self, job: &Job) -> Result<(), io::Error> {
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_string_pretty(job)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(self.dir.join(format!("{}.json", job.id)), json)
    }

    /// Load every terminal job in the directory.
    ///
    /// Files that fail to parse, and jobs that never finished, are skipped.
    pub fn load(&self) -> Result<Vec<Job>, io::Error> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match load_job(&path) {
                Ok(job) if job.is_terminal() => jobs.push(job),
                Ok(job) => warn!("Ignoring unfinished job {} in history", job.id),
                Err(e) => warn!("Failed to load job from {}: {}", path.display(), e),
            }
        }

        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

fn load_job(path: &Path) -> Result<Job, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, JobState};
    use crate::plan::CompressionTarget;
    use tempfile::TempDir;

    fn finished_job(name: &str, state: JobState) -> Job {
        let mut job = Job::new(
            JobId::new(),
            PathBuf::from(format!("/videos/{}.mov", name)),
            CompressionTarget::target_size(25_000_000),
        );
        job.transition(JobState::Running);
        job.transition(state);
        job
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let history = JobHistory::new(dir.path().join("state"));

        let done = finished_job("a", JobState::Completed);
        let cancelled = finished_job("b", JobState::Cancelled);
        history.save(&done).unwrap();
        history.save(&cancelled).unwrap();

        let loaded = history.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&done));
        assert!(loaded.contains(&cancelled));
    }

    #[test]
    fn test_load_skips_garbage_and_unfinished() {
        let dir = TempDir::new().unwrap();
        let history = JobHistory::new(dir.path());

        history.save(&finished_job("a", JobState::Failed)).unwrap();
        history.save(&finished_job("b", JobState::Running)).unwrap();
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = history.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, JobState::Failed);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let history = JobHistory::new(dir.path().join("never-created"));
        assert!(history.load().unwrap().is_empty());
    }
}
