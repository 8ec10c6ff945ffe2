use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "llamapool", version, about = "Reverse proxy and lifecycle manager for local GGUF inference servers")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/llamapool.yaml")]
    pub config: PathBuf,

    /// Address the HTTP front door listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Watch the config file and hot-reload on change.
    #[arg(long)]
    pub watch_config: bool,

    /// Overrides the config file's `minFreeMemoryPercent`.
    #[arg(long)]
    pub min_free_memory_percent: Option<f32>,

    /// Overrides the config file's `logLevel` (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

/// `~/.llamapool`, mirroring the teacher's per-user state directory
/// convention.
pub fn llamapool_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".llamapool"))
        .unwrap_or_else(|| PathBuf::from(".llamapool"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
