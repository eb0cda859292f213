//! CLI command implementations

pub mod bench;
pub mod ping;
pub mod serve;

use anyhow::{Context, Result};
use std::path::Path;
use tether_core::MuxConfig;

/// A command line value the command cannot work with
#[derive(Debug, thiserror::Error)]
#[error("Invalid input: {0}")]
pub struct InvalidInput(pub String);

/// Mux settings from `--config`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<MuxConfig> {
    match path {
        Some(path) => MuxConfig::from_json_file(path)
            .with_context(|| format!("loading mux config from {}", path.display())),
        None => Ok(MuxConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "initial_ration": 4096, "max_sessions": 8 }}"#).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.initial_ration, Some(4096));
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.max_fragment_size, MuxConfig::default().max_fragment_size);
    }

    #[test]
    fn test_load_config_defaults_and_errors() {
        assert_eq!(load_config(None).unwrap(), MuxConfig::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "initial_ration": 0 }}"#).unwrap();
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("loading mux config"));

        assert!(load_config(Some(Path::new("/nonexistent/tether.json"))).is_err());
    }
}
