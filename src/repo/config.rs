use std::fs;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Settings stored next to the repo data in `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on worker threads.
    pub max_threads: usize,
    /// Default log directive when logging is initialized from the config.
    pub min_log_level: String,
    /// How old a succeeded result of an earlier run may be and still be
    /// reused without running the rule. `None` only reuses results of the
    /// current run, a negative value reuses any age.
    pub target_result_reuse_secs: Option<i64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            max_threads: 8,
            min_log_level: "info".into(),
            target_result_reuse_secs: None,
        }
    }
}

impl RunConfig {
    /// Reads `path`, writing the defaults there first if it doesn't exist.
    pub fn load_or_create(path: &Utf8Path) -> Result<Self, RepoError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let config = RunConfig::default();
                fs::write(path, serde_json::to_string_pretty(&config)?)?;
                Ok(config)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether a result that finished `age_secs` ago may be reused.
    pub fn allows_reuse(&self, age_secs: i64) -> bool {
        match self.target_result_reuse_secs {
            None => false,
            Some(limit) if limit < 0 => true,
            Some(limit) => age_secs <= limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_defaults_are_written_and_partial_files_fill_in() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let path = root.join("config.json");

        let config = RunConfig::load_or_create(&path).unwrap();
        assert_eq!(config, RunConfig::default());
        assert!(path.exists());

        fs::write(&path, r#"{ "max_threads": 2 }"#).unwrap();
        let config = RunConfig::load_or_create(&path).unwrap();
        assert_eq!(config.max_threads, 2);
        assert_eq!(config.min_log_level, "info");

        fs::write(&path, "not json").unwrap();
        assert!(matches!(RunConfig::load_or_create(&path), Err(RepoError::Config(_))));
    }

    #[test]
    fn test_reuse_policy() {
        let mut config = RunConfig::default();
        assert!(!config.allows_reuse(0));

        config.target_result_reuse_secs = Some(-1);
        assert!(config.allows_reuse(1_000_000));

        config.target_result_reuse_secs = Some(60);
        assert!(config.allows_reuse(59));
        assert!(!config.allows_reuse(61));
    }
}
