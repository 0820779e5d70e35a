use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "session-relayd")]
#[command(about = "Relay daemon bridging local agent sessions to chat platforms")]
pub struct Config {
    /// Configuration root for the registry, settings, thread mappings,
    /// and the RPC socket. Defaults to ~/.session-relay.
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Override the RPC socket path (default: <config-dir>/relay.sock).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Runner executable spawned for user-initiated sessions.
    #[arg(long, default_value = "session-runner")]
    pub runner: PathBuf,

    /// Root directory where the agent writes per-project event logs.
    /// Defaults to ~/.claude/projects.
    #[arg(long)]
    pub log_root: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Lifecycle-scoped locations derived once at startup; nothing reads
/// these paths from process-wide state.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub config_dir: PathBuf,
    pub registry: PathBuf,
    pub settings: PathBuf,
    pub threads: PathBuf,
    pub socket: PathBuf,
    pub log_root: PathBuf,
}

impl Config {
    pub fn paths(&self) -> DaemonPaths {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let config_dir = self
            .config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&home).join(".session-relay"));
        let socket = self
            .socket
            .clone()
            .unwrap_or_else(|| config_dir.join("relay.sock"));
        let log_root = self
            .log_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(&home).join(".claude").join("projects"));
        DaemonPaths {
            registry: config_dir.join("registry.json"),
            settings: config_dir.join("settings.json"),
            threads: config_dir.join("threads.json"),
            socket,
            log_root,
            config_dir,
        }
    }
}
