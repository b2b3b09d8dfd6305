use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// WebSocket endpoint of the world server
    #[arg(short = 's', long, env = "WORLD_URL", default_value = "ws://127.0.0.1:3000/ws")]
    pub server: String,

    /// HTTP API base URL (defaults to the one the server announces)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Display name to request on first connect
    #[arg(short, long)]
    pub name: Option<String>,

    /// Avatar URL to use for this session
    #[arg(short, long)]
    pub avatar: Option<String>,

    /// File the auth token is kept in between runs
    #[arg(long, default_value = ".world-token")]
    pub token_file: PathBuf,

    /// Fixed updates per second; inbound messages are applied once per update
    #[arg(short, long, default_value_t = shared::DEFAULT_TICK_RATE)]
    pub tick_rate: u32,

    /// Asset to upload once connected
    #[arg(short, long)]
    pub upload: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_url: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    /// `None` keeps the token in memory only.
    pub token_file: Option<PathBuf>,
    pub tick_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3000/ws".to_string(),
            api_url: None,
            name: None,
            avatar: None,
            token_file: None,
            tick_rate: shared::DEFAULT_TICK_RATE,
        }
    }
}

impl ClientConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

impl From<&Args> for ClientConfig {
    fn from(args: &Args) -> Self {
        Self {
            server_url: args.server.clone(),
            api_url: args.api_url.clone(),
            name: args.name.clone(),
            avatar: args.avatar.clone(),
            token_file: Some(args.token_file.clone()),
            tick_rate: args.tick_rate,
        }
    }
}
