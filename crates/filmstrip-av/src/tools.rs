//! Discovery of the ffmpeg and ffprobe executables.
//!
//! [`ToolRegistry::discover`] resolves each tool once, preferring the path
//! from [`ToolsConfig`] and falling back to a `PATH` search. Decoders and the
//! probe then look their executable up by name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use filmstrip_core::config::ToolsConfig;
use filmstrip_core::{Error, Result};

use crate::command::ToolCommand;

/// Tools the registry resolves, with what the engine uses them for.
const KNOWN_TOOLS: &[(&str, &str)] = &[
    ("ffmpeg", "frame decoding"),
    ("ffprobe", "duration probing"),
];

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolved executable.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    pub path: PathBuf,
    /// Per-invocation limit; the process is killed once it elapses.
    pub timeout: Duration,
}

/// One row of [`ToolRegistry::check_all`].
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub purpose: String,
    pub available: bool,
    /// First line of `-version` output.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Resolve every known tool. Tools that cannot be found are left out.
    pub fn discover(tools_config: &ToolsConfig) -> Self {
        let timeout = Duration::from_secs(tools_config.decode_timeout_secs.max(1));
        let mut tools = HashMap::new();

        for &(name, _) in KNOWN_TOOLS {
            let configured = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                "ffprobe" => tools_config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match configured {
                Some(p) if p.is_file() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!(
                        "Configured {name} path {} does not exist; searching PATH",
                        p.display()
                    );
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            match resolved {
                Some(path) => {
                    tracing::debug!(tool = name, path = %path.display(), "Discovered tool");
                    tools.insert(
                        name.to_string(),
                        ToolConfig {
                            name: name.to_string(),
                            path,
                            timeout,
                        },
                    );
                }
                None => tracing::debug!(tool = name, "Tool not found"),
            }
        }

        Self { tools }
    }

    /// Look up a discovered tool, or fail with [`Error::Tool`].
    pub fn require(&self, name: &str) -> Result<&ToolConfig> {
        self.tools.get(name).ok_or_else(|| {
            Error::tool(name, format!("{name} not found; is it installed and in PATH?"))
        })
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Report every known tool, running `-version` on the ones found.
    pub async fn check_all(&self) -> Vec<ToolInfo> {
        let mut infos = Vec::with_capacity(KNOWN_TOOLS.len());
        for &(name, purpose) in KNOWN_TOOLS {
            let tool = self.tools.get(name);
            let version = match tool {
                Some(cfg) => detect_version(cfg).await,
                None => None,
            };
            infos.push(ToolInfo {
                name: name.to_string(),
                purpose: purpose.to_string(),
                available: tool.is_some(),
                version,
                path: tool.map(|cfg| cfg.path.clone()),
            });
        }
        infos
    }
}

async fn detect_version(tool: &ToolConfig) -> Option<String> {
    let mut cmd = ToolCommand::new(tool.path.clone());
    cmd.arg("-version").timeout(VERSION_TIMEOUT);
    match cmd.execute().await {
        Ok(output) => output
            .stdout_text()
            .lines()
            .next()
            .map(|line| line.trim().to_string()),
        Err(e) => {
            tracing::debug!(tool = %tool.name, "Version check failed: {e}");
            None
        }
    }
}
