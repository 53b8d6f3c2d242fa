use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// CLI arguments for the rendezvous server.
#[derive(Parser, Debug, Clone)]
#[command(name = "trystd")]
#[command(about = "Anonymous two-party chat rendezvous server")]
#[command(version)]
pub struct Args {
    /// TCP port for the WebSocket listener.
    #[arg(long, default_value = "3000", env = "PORT")]
    pub port: u16,
    /// Interface the WebSocket listener binds.
    #[arg(long, default_value = "0.0.0.0", env = "BIND_ADDR")]
    pub bind: IpAddr,
    /// Socket address for the metrics/health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "METRICS_ADDR")]
    pub metrics_addr: SocketAddr,
    /// Secret for signed bearer tokens; enables token minting when set.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,
    /// Queue entries older than this are swept, in milliseconds.
    #[arg(long, default_value = "300000", env = "QUEUE_TIMEOUT_MS")]
    pub queue_timeout_ms: u64,
    /// Maximum entries per queue tier.
    #[arg(long, default_value = "10000", env = "MAX_QUEUE_SIZE")]
    pub max_queue_size: usize,
    /// Maximum connections per IP within a 60 s window.
    #[arg(long, default_value = "20", env = "MAX_CONNECTIONS_PER_IP")]
    pub max_connections_per_ip: usize,
    /// Default IP ban duration, in milliseconds.
    #[arg(long, default_value = "86400000", env = "BAN_DURATION_MS")]
    pub ban_duration_ms: u64,
    /// Interval between liveness pings, in milliseconds.
    #[arg(long, default_value = "30000", env = "HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: u64,
    /// Idle eviction threshold, in milliseconds.
    #[arg(long, default_value = "60000", env = "CONNECTION_TIMEOUT_MS")]
    pub connection_timeout_ms: u64,
    /// Chat messages allowed per user per minute.
    #[arg(long, default_value = "30", env = "RATE_LIMIT_MESSAGES_PER_MINUTE")]
    pub messages_per_minute: u32,
    /// Skips allowed per user per minute.
    #[arg(long, default_value = "10", env = "RATE_LIMIT_SKIPS_PER_MINUTE")]
    pub skips_per_minute: u32,
    /// Reports allowed per user per hour.
    #[arg(long, default_value = "3", env = "RATE_LIMIT_REPORTS_PER_HOUR")]
    pub reports_per_hour: u32,
    /// Maximum inbound frame size in bytes.
    #[arg(long, default_value = "10240", env = "MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Maximum chat message length in characters.
    #[arg(long, default_value = "500", env = "MAX_MESSAGE_LENGTH")]
    pub max_message_length: usize,
    /// Interval between background cleanup sweeps, in milliseconds.
    #[arg(long, default_value = "60000", env = "CLEANUP_INTERVAL_MS")]
    pub cleanup_interval_ms: u64,
    /// Expiry for a half-completed mode-switch handshake, in milliseconds.
    #[arg(long, default_value = "30000", env = "MODE_SWITCH_TIMEOUT_MS")]
    pub mode_switch_timeout_ms: u64,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "MAX_CONNECTIONS")]
    pub max_connections: usize,
    /// Wrap relayed messages with authenticated encryption at rest in memory.
    #[arg(long, default_value = "false", env = "MESSAGE_ENCRYPTION")]
    pub message_encryption: bool,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the WebSocket listener binds.
    pub listen: SocketAddr,
    /// Socket address for the metrics/health endpoint.
    pub metrics_addr: SocketAddr,
    /// Secret for signed bearer tokens, when minting is enabled.
    pub token_secret: Option<String>,
    /// Queue entries older than this are swept.
    pub queue_timeout: Duration,
    /// Maximum entries per queue tier.
    pub max_queue_size: usize,
    /// Maximum connections per IP within a 60 s window.
    pub max_connections_per_ip: usize,
    /// Default IP ban duration.
    pub ban_duration: Duration,
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// Idle eviction threshold.
    pub connection_timeout: Duration,
    /// Chat messages allowed per user per minute.
    pub messages_per_minute: u32,
    /// Skips allowed per user per minute.
    pub skips_per_minute: u32,
    /// Reports allowed per user per hour.
    pub reports_per_hour: u32,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Maximum chat message length in characters.
    pub max_message_length: usize,
    /// Interval between background cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Expiry for a half-completed mode-switch handshake.
    pub mode_switch_timeout: Duration,
    /// Maximum total concurrent connections.
    pub max_connections: usize,
    /// Whether the AEAD message sealer is enabled.
    pub message_encryption: bool,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.max_connections > 1_000_000 {
            return Err("max_connections exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_connections_per_ip == 0 {
            return Err("max_connections_per_ip must be greater than 0".to_string());
        }
        if self.max_connections_per_ip > self.max_connections {
            return Err("max_connections_per_ip cannot exceed max_connections".to_string());
        }

        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        if self.messages_per_minute == 0 {
            return Err("messages_per_minute must be greater than 0".to_string());
        }
        if self.skips_per_minute == 0 {
            return Err("skips_per_minute must be greater than 0".to_string());
        }
        if self.reports_per_hour == 0 {
            return Err("reports_per_hour must be greater than 0".to_string());
        }

        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.max_message_length == 0 {
            return Err("max_message_length must be greater than 0".to_string());
        }
        if self.max_message_length > self.max_message_size {
            return Err("max_message_length cannot exceed max_message_size".to_string());
        }

        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval_ms must be greater than 0".to_string());
        }
        if self.connection_timeout < self.heartbeat_interval {
            return Err("connection_timeout_ms must be at least heartbeat_interval_ms".to_string());
        }
        if self.queue_timeout.is_zero() {
            return Err("queue_timeout_ms must be greater than 0".to_string());
        }
        if self.mode_switch_timeout.is_zero() {
            return Err("mode_switch_timeout_ms must be greater than 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("cleanup_interval_ms must be greater than 0".to_string());
        }
        if self.ban_duration.is_zero() {
            return Err("ban_duration_ms must be greater than 0".to_string());
        }

        if let Some(secret) = &self.token_secret {
            if secret.len() < 32 {
                return Err("token secret must be at least 32 bytes".to_string());
            }
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: SocketAddr::new(args.bind, args.port),
            metrics_addr: args.metrics_addr,
            token_secret: args.token_secret,
            queue_timeout: Duration::from_millis(args.queue_timeout_ms),
            max_queue_size: args.max_queue_size,
            max_connections_per_ip: args.max_connections_per_ip,
            ban_duration: Duration::from_millis(args.ban_duration_ms),
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            connection_timeout: Duration::from_millis(args.connection_timeout_ms),
            messages_per_minute: args.messages_per_minute,
            skips_per_minute: args.skips_per_minute,
            reports_per_hour: args.reports_per_hour,
            max_message_size: args.max_message_size,
            max_message_length: args.max_message_length,
            cleanup_interval: Duration::from_millis(args.cleanup_interval_ms),
            mode_switch_timeout: Duration::from_millis(args.mode_switch_timeout_ms),
            max_connections: args.max_connections,
            message_encryption: args.message_encryption,
        }
    }
}
