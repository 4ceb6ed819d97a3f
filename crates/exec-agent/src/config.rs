use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    /// Directory for per-invocation command logs.
    #[serde(default = "default_log_dir")]
    pub(crate) log_dir: PathBuf,
    /// Admission level for per-invocation logs, 0 (emergency) to 7 (debug).
    #[serde(default = "default_log_level")]
    pub(crate) log_level: u8,
    /// Bound of the per-connection response queue.
    #[serde(default = "default_queue_capacity")]
    pub(crate) queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    pub(crate) fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        if config.log_level > 7 {
            anyhow::bail!("log_level must be within 0..=7, got {}", config.log_level);
        }
        if config.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        Ok(config)
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs/invocations")
}

fn default_log_level() -> u8 {
    6
}

fn default_queue_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(contents.as_bytes()).expect("write");
        (dir, path)
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default(Path::new("/no/such/config.toml")).expect("defaults");
        assert_eq!(config.log_level, 6);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let (_dir, path) = write_config("log_level = 7\n");
        let config = Config::load_or_default(&path).expect("load");
        assert_eq!(config.log_level, 7);
        assert_eq!(config.log_dir, PathBuf::from("logs/invocations"));
    }

    #[test]
    fn out_of_range_log_level_is_rejected() {
        let (_dir, path) = write_config("log_level = 9\n");
        let err = Config::load_or_default(&path).unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let (_dir, path) = write_config("queue_capacity = 0\n");
        let err = Config::load_or_default(&path).unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }
}
