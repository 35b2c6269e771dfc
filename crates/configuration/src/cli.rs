use crate::settings::Settings;
use clap::Args;
use std::path::PathBuf;

/// Command-line flags that take precedence over `config.toml` and the environment.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Address the server binds to (e.g., "127.0.0.1:3000").
    #[arg(long)]
    pub bind: Option<String>,

    /// User id the client connects as.
    #[arg(long)]
    pub user_id: Option<String>,

    /// Bearer token forwarded on client handshakes.
    #[arg(long)]
    pub token: Option<String>,

    /// Directory for log files; pass an empty string to log to stdout only.
    #[arg(long)]
    pub log_dir: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(bind) = &self.bind {
            settings.server.bind_addr = bind.clone();
        }
        if let Some(user_id) = &self.user_id {
            settings.client.user_id = user_id.clone();
        }
        if let Some(token) = &self.token {
            settings.client.token = Some(token.clone());
        }
        if let Some(dir) = &self.log_dir {
            settings.logging.directory = if dir.is_empty() { None } else { Some(dir.clone()) };
        }
    }
}
