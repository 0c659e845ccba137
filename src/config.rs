// src/config.rs

use crate::types::Config;
use anyhow::{Context, Result};
use std::path::Path;

impl Config {
    /// Load one worker's JSON config. A malformed or incomplete file is an
    /// error for this worker only; the supervisor keeps the others running.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {:?}", path))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {:?}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CountingScope;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch1.json");
        std::fs::write(
            &path,
            r#"{
                "name": "ch1",
                "source": "rtsp://cam/stream",
                "gates": [
                    {"name": "door", "lines": [650.0, 0.0, 650.0, 100.0]}
                ]
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.name, "ch1");
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.counting_scope, CountingScope::Shared);
        assert!(config.target.is_none());
        assert!(config.stream.is_none());
        assert!(config.gates[0].tags.is_empty());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"name": "ch1", "gates": []}"#).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.json"));
    }
}
