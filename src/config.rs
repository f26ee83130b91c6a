use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::Parser;

use crate::hub::DEFAULT_OUTBOUND_CAPACITY;

#[derive(Debug, Clone, Parser)]
#[command(name = "forum-chat", about = "Forum server with real-time direct messages")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "FORUM_CHAT_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    #[arg(long, env = "FORUM_CHAT_DATABASE_URL", default_value = "sqlite://forum.db")]
    pub database_url: String,

    /// Directory served for every path the API does not claim
    #[arg(long, env = "FORUM_CHAT_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// Per-connection outbound queue length; frames beyond it are dropped
    #[arg(
        long,
        env = "FORUM_CHAT_OUTBOUND_BUFFER",
        default_value_t = DEFAULT_OUTBOUND_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub outbound_buffer: usize,

    /// Skip the force_refresh broadcast after each new connection
    #[arg(long, env = "FORUM_CHAT_NO_FORCE_REFRESH")]
    pub no_force_refresh: bool,

    /// Minimum gap between one user's history requests, in milliseconds (0 disables)
    #[arg(long, env = "FORUM_CHAT_HISTORY_THROTTLE_MS", default_value_t = 500)]
    pub history_throttle_ms: u64,

    /// Minimum gap between one user's chat list requests, in milliseconds (0 disables)
    #[arg(long, env = "FORUM_CHAT_USERS_THROTTLE_MS", default_value_t = 200)]
    pub users_throttle_ms: u64,

    #[arg(long, env = "FORUM_CHAT_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "FORUM_CHAT_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn tls(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert.as_ref().zip(self.tls_key.as_ref())
    }

    pub fn history_throttle(&self) -> Duration {
        Duration::from_millis(self.history_throttle_ms)
    }

    pub fn users_throttle(&self) -> Duration {
        Duration::from_millis(self.users_throttle_ms)
    }
}
