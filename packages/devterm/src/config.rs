use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::{DEFAULT_MAX_TERMINALS, DEFAULT_SHELL, ManagerOptions};

// =============================================================================
// Tunables (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [terminals]
//                    max_terminals = 6
//
//   env var:         DEVTERM_TERMINALS__MAX_TERMINALS=6   (double underscore = nesting)

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub terminals: TerminalsFileConfig,
}

/// Lives under `[terminals]` in config.toml.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalsFileConfig {
    #[serde(default = "default_max_terminals")]
    pub max_terminals: usize,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,
    /// 0 waits for backends indefinitely.
    #[serde(default)]
    pub stop_timeout_secs: u64,
}

impl Default for TerminalsFileConfig {
    fn default() -> Self {
        Self {
            max_terminals: default_max_terminals(),
            shell: default_shell(),
            reconnect_secs: default_reconnect_secs(),
            stop_timeout_secs: 0,
        }
    }
}

fn default_max_terminals() -> usize {
    DEFAULT_MAX_TERMINALS
}
fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}
fn default_reconnect_secs() -> u64 {
    10
}

/// Layers struct defaults → `<data_dir>/config.toml` → `DEVTERM_*` env vars.
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("DEVTERM_").split("__"))
}

/// Runtime view of `[terminals]`.
#[derive(Clone, Debug)]
pub struct TerminalsConfig {
    pub max_terminals: usize,
    pub shell: String,
    pub reconnect: Duration,
    pub stop_timeout: Option<Duration>,
}

impl TerminalsConfig {
    pub fn from_file(fc: &TerminalsFileConfig) -> Self {
        Self {
            max_terminals: fc.max_terminals,
            shell: fc.shell.clone(),
            reconnect: Duration::from_secs(fc.reconnect_secs),
            stop_timeout: if fc.stop_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.stop_timeout_secs))
            },
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            max_terminals: self.max_terminals,
            default_shell: self.shell.clone(),
            stop_timeout: self.stop_timeout,
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DevtermConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl DevtermConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".devterm"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("devterm.db");

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite:{}", self.db_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; Jail serializes the tests that read them.

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|jail| {
            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.terminals.max_terminals, 10);
            assert_eq!(fc.terminals.shell, "/bin/bash");
            assert_eq!(fc.terminals.reconnect_secs, 10);

            let runtime = TerminalsConfig::from_file(&fc.terminals);
            assert_eq!(runtime.stop_timeout, None);
            assert_eq!(runtime.reconnect, Duration::from_secs(10));
            Ok(())
        });
    }

    #[test]
    fn toml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                "[terminals]\nmax_terminals = 4\nstop_timeout_secs = 5\n",
            )?;

            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.terminals.max_terminals, 4);
            assert_eq!(fc.terminals.shell, "/bin/bash");

            let options = TerminalsConfig::from_file(&fc.terminals).manager_options();
            assert_eq!(options.max_terminals, 4);
            assert_eq!(options.stop_timeout, Some(Duration::from_secs(5)));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[terminals]\nshell = \"/bin/zsh\"\n")?;
            jail.set_env("DEVTERM_TERMINALS__SHELL", "/bin/fish");
            jail.set_env("DEVTERM_TERMINALS__MAX_TERMINALS", "3");

            let fc: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(fc.terminals.shell, "/bin/fish");
            assert_eq!(fc.terminals.max_terminals, 3);
            Ok(())
        });
    }

    #[test]
    fn directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevtermConfig::new(Some(dir.path().join("data"))).unwrap();
        assert!(config.data_dir.is_dir());
        assert!(config.db_url().starts_with("sqlite:"));
        assert!(config.db_url().ends_with("devterm.db"));
    }
}
