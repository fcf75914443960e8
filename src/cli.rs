use clap::{Parser, Subcommand};
use filmstrip_core::PriorityWindow;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "filmstrip")]
#[command(author, version, about = "Adaptive thumbnail filmstrip extraction")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Extract (or load) the filmstrip of a media file
    Extract {
        /// Media file or URL
        #[arg(required = true)]
        source: String,

        /// Asset identifier (defaults to the file stem)
        #[arg(long)]
        asset_id: Option<String>,

        /// Clip length in seconds (probed with ffprobe when omitted)
        #[arg(long)]
        duration: Option<f64>,

        /// Frame range to cover densely, as START..END
        #[arg(long, value_parser = parse_window)]
        priority: Option<PriorityWindow>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what the store holds for an asset
    Status {
        #[arg(required = true)]
        asset_id: String,
    },

    /// Remove stored frames
    Clear {
        /// Asset to remove
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        asset_id: Option<String>,

        /// Remove every asset
        #[arg(long)]
        all: bool,
    },

    /// Probe a media file and display information
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

/// Parse `START..END` into a half-open frame window.
pub fn parse_window(value: &str) -> Result<PriorityWindow, String> {
    let (start, end) = value
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got {value:?}"))?;
    let start: u32 = start
        .trim()
        .parse()
        .map_err(|e| format!("invalid start {start:?}: {e}"))?;
    let end: u32 = end
        .trim()
        .parse()
        .map_err(|e| format!("invalid end {end:?}: {e}"))?;
    if end <= start {
        return Err(format!("window {start}..{end} is empty"));
    }
    Ok(PriorityWindow::new(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn window_parses() {
        assert_eq!(parse_window("10..20"), Ok(PriorityWindow::new(10, 20)));
        assert_eq!(parse_window(" 0 .. 5"), Ok(PriorityWindow::new(0, 5)));
    }

    #[test]
    fn bad_windows_are_rejected() {
        assert!(parse_window("10").is_err());
        assert!(parse_window("a..5").is_err());
        assert!(parse_window("5..5").is_err());
        assert!(parse_window("9..2").is_err());
    }

    #[test]
    fn clear_needs_an_asset_or_all() {
        assert!(Cli::try_parse_from(["filmstrip", "clear"]).is_err());
        assert!(Cli::try_parse_from(["filmstrip", "clear", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["filmstrip", "clear", "clip"]).is_ok());
        assert!(Cli::try_parse_from(["filmstrip", "clear", "clip", "--all"]).is_err());
    }
}
