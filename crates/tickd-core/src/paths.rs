//! Filesystem layout for a tickd instance.
//!
//! ```text
//! <config_dir>/jobs.toml            declarative job file
//! <data_dir>/state/tickd.db         SQLite store
//! <data_dir>/state/events.jsonl     lifecycle event log
//! <data_dir>/state/daemon.json      running-daemon marker
//! <data_dir>/state/runs/<job>/<run>.out|.err
//! ```

use std::path::{Path, PathBuf};

use crate::config::{default_config_dir, default_data_dir, PathsConfig};
use crate::error::{Result, TickdError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub events_file: PathBuf,
    pub db_file: PathBuf,
    pub daemon_state_file: PathBuf,
}

/// Output files for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutputPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Paths {
    /// Resolve the layout from config. `root` wins over the per-kind dirs.
    pub fn resolve(config: &PathsConfig) -> Self {
        let (config_dir, data_dir) = match config.root {
            Some(ref root) => (PathBuf::from(root), PathBuf::from(root)),
            None => (
                PathBuf::from(config.config_dir.clone().unwrap_or_else(default_config_dir)),
                PathBuf::from(config.data_dir.clone().unwrap_or_else(default_data_dir)),
            ),
        };
        Self::from_dirs(config_dir, data_dir)
    }

    /// Use `root` for everything.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self::from_dirs(root.clone(), root)
    }

    fn from_dirs(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let state_dir = data_dir.join("state");
        Self {
            jobs_file: config_dir.join("jobs.toml"),
            config_dir,
            runs_dir: state_dir.join("runs"),
            events_file: state_dir.join("events.jsonl"),
            db_file: state_dir.join("tickd.db"),
            daemon_state_file: state_dir.join("daemon.json"),
            state_dir,
        }
    }

    /// Create every directory in the layout. Idempotent.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.runs_dir)?;
        Ok(())
    }

    /// Deterministic stdout/stderr paths for `(job_id, run_id)`. Creates the
    /// per-job directory. Both ids must be plain file names, so the paths
    /// always stay under `runs_dir`.
    pub fn run_output_paths(&self, job_id: &str, run_id: &str) -> Result<RunOutputPaths> {
        for id in [job_id, run_id] {
            if !is_plain_file_name(id) {
                return Err(TickdError::InvalidPathComponent(id.to_string()));
            }
        }
        let dir = self.runs_dir.join(job_id);
        std::fs::create_dir_all(&dir)?;
        Ok(RunOutputPaths {
            stdout: dir.join(format!("{run_id}.out")),
            stderr: dir.join(format!("{run_id}.err")),
        })
    }
}

/// True when `name` is one normal path component: non-empty, no separators,
/// not `.` or `..`.
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_overrides_split_dirs() {
        let config = PathsConfig {
            root: Some("/tmp/tickd-root".to_string()),
            config_dir: Some("/etc/ignored".to_string()),
            data_dir: Some("/var/ignored".to_string()),
        };
        let paths = Paths::resolve(&config);
        assert_eq!(paths.jobs_file, PathBuf::from("/tmp/tickd-root/jobs.toml"));
        assert_eq!(paths.db_file, PathBuf::from("/tmp/tickd-root/state/tickd.db"));
    }

    #[test]
    fn split_dirs_are_respected() {
        let config = PathsConfig {
            root: None,
            config_dir: Some("/cfg".to_string()),
            data_dir: Some("/data".to_string()),
        };
        let paths = Paths::resolve(&config);
        assert_eq!(paths.jobs_file, PathBuf::from("/cfg/jobs.toml"));
        assert_eq!(paths.events_file, PathBuf::from("/data/state/events.jsonl"));
        assert_eq!(paths.runs_dir, PathBuf::from("/data/state/runs"));
    }

    #[test]
    fn run_output_paths_are_keyed_by_job_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        paths.ensure().unwrap();

        let out = paths.run_output_paths("job-1", "run-9").unwrap();
        assert_eq!(out.stdout, dir.path().join("state/runs/job-1/run-9.out"));
        assert_eq!(out.stderr, dir.path().join("state/runs/job-1/run-9.err"));
        assert!(dir.path().join("state/runs/job-1").is_dir());
    }

    #[test]
    fn run_output_paths_reject_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        paths.ensure().unwrap();

        for bad in ["", ".", "..", "../..", "/tmp/elsewhere", "a/b", "a\\b"] {
            let err = paths.run_output_paths(bad, "run-1").unwrap_err();
            assert_eq!(err.code(), "invalid_path_component", "{bad:?}");
        }
        assert!(paths.run_output_paths("job-1", "../run").is_err());
        assert_eq!(std::fs::read_dir(&paths.runs_dir).unwrap().count(), 0);
    }
}
