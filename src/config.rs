use crate::job::Mode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runner: Runner,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub tools: Tools,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Runner {
    /// Wait after the graceful signal before force-killing the process group.
    pub grace_period_ms: u64,
    /// `try_wait` cadence while awaiting exit.
    pub poll_interval_ms: u64,
    /// Lines kept in the live display tail.
    pub display_lines: usize,
}
impl Default for Runner {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
            poll_interval_ms: 50,
            display_lines: 50,
        }
    }
}
impl Runner {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub out_dir: String,
    pub staging_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            out_dir: "outputs".into(),
            staging_dir: ".flux-runner-staging".into(),
        }
    }
}

/// A launcher for the generation tool. `prefix_args` go before the generated flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub prefix_args: Vec<String>,
}

/// Per-mode launcher overrides; unset modes use the stock executable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tools {
    #[serde(default)]
    pub schnell: Option<ToolCommand>,
    #[serde(default)]
    pub dev: Option<ToolCommand>,
    #[serde(default)]
    pub kontext: Option<ToolCommand>,
}
impl Tools {
    pub fn resolve(&self, mode: Mode) -> ToolCommand {
        let configured = match mode {
            Mode::Schnell => &self.schnell,
            Mode::Dev => &self.dev,
            Mode::Kontext => &self.kontext,
        };
        configured.clone().unwrap_or_else(|| ToolCommand {
            program: mode.profile().executable.to_string(),
            prefix_args: Vec::new(),
        })
    }

    pub fn set(&mut self, mode: Mode, tool: ToolCommand) {
        let slot = match mode {
            Mode::Schnell => &mut self.schnell,
            Mode::Dev => &mut self.dev,
            Mode::Kontext => &mut self.kontext,
        };
        *slot = Some(tool);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub print_summary: bool,
    pub write_report_json: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            print_summary: true,
            write_report_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
