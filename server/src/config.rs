//! Server configuration: command line flags with environment fallbacks.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Fixed updates per second; inbound messages are applied once per update
    #[arg(short, long, default_value_t = shared::DEFAULT_TICK_RATE)]
    pub tick_rate: u32,

    /// Directory holding the world database and uploaded assets
    #[arg(short, long, env = "WORLD", default_value = "world")]
    pub world: PathBuf,

    /// Seconds between persistence sweeps (0 disables periodic saves)
    #[arg(long, env = "SAVE_INTERVAL", default_value = "60")]
    pub save_interval: u64,

    /// Code players enter with `/admin <code>` to become admins
    #[arg(long, env = "ADMIN_CODE")]
    pub admin_code: Option<String>,

    /// Maximum number of connected players
    #[arg(long, env = "PLAYER_LIMIT")]
    pub player_limit: Option<usize>,

    /// Public base URL assets are served from
    #[arg(long, env = "PUBLIC_ASSETS_URL")]
    pub assets_url: Option<String>,

    /// Public base URL of the HTTP API
    #[arg(long, env = "PUBLIC_API_URL")]
    pub api_url: Option<String>,

    /// Largest accepted upload in megabytes
    #[arg(long, env = "PUBLIC_MAX_UPLOAD_SIZE", default_value = "12")]
    pub max_upload_size: u64,

    /// Secret used to sign auth tokens (random per process when unset)
    #[arg(long, env = "JWT_SECRET")]
    pub token_secret: Option<String>,

    /// Voice server URL handed to players
    #[arg(long, env = "LIVEKIT_WS_URL")]
    pub livekit_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tick_rate: u32,
    pub world_dir: PathBuf,
    /// Zero disables periodic saves.
    pub save_interval: Duration,
    pub ping_interval: Duration,
    pub admin_code: Option<String>,
    pub player_limit: Option<usize>,
    /// Derived from the bind address when unset.
    pub assets_url: Option<String>,
    /// Derived from the bind address when unset.
    pub api_url: Option<String>,
    /// In bytes.
    pub max_upload_size: u64,
    pub token_secret: Option<String>,
    pub livekit_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            tick_rate: shared::DEFAULT_TICK_RATE,
            world_dir: PathBuf::from("world"),
            save_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(1),
            admin_code: None,
            player_limit: None,
            assets_url: None,
            api_url: None,
            max_upload_size: 12 * 1024 * 1024,
            token_secret: None,
            livekit_url: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn assets_url(&self) -> String {
        self.assets_url
            .clone()
            .unwrap_or_else(|| format!("{}/assets", self.api_url().trim_end_matches('/')))
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.world_dir.join("assets")
    }

    /// Name of the world, taken from its directory.
    pub fn world_name(&self) -> String {
        self.world_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "world".to_string())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            tick_rate: args.tick_rate,
            world_dir: args.world,
            save_interval: Duration::from_secs(args.save_interval),
            ping_interval: Duration::from_secs(1),
            admin_code: args.admin_code.filter(|code| !code.is_empty()),
            player_limit: args.player_limit.filter(|limit| *limit > 0),
            assets_url: args.assets_url,
            api_url: args.api_url,
            max_upload_size: args.max_upload_size * 1024 * 1024,
            token_secret: args.token_secret,
            livekit_url: args.livekit_url,
        }
    }
}
