// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the drover control plane.
#[derive(Debug, Clone, clap::Args)]
pub struct ControlConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "DROVER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9600, env = "DROVER_PORT")]
    pub port: u16,

    /// HMAC signing key for locally issued tokens (base64url, no padding).
    #[arg(long, env = "DROVER_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Remote identity service base URL for token validation fallback.
    #[arg(long, env = "DROVER_IDENTITY_URL")]
    pub identity_url: Option<String>,

    /// Heartbeat ping interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "DROVER_PING_INTERVAL_MS")]
    pub ping_interval_ms: u64,

    /// Pong timeout in milliseconds (per ping).
    #[arg(long, default_value_t = 10_000, env = "DROVER_PONG_TIMEOUT_MS")]
    pub pong_timeout_ms: u64,

    /// Missed pings before a connection is declared unhealthy.
    #[arg(long, default_value_t = 3, env = "DROVER_MISSED_PING_THRESHOLD")]
    pub missed_ping_threshold: u32,

    /// Connection pool sweep interval in milliseconds.
    #[arg(long, default_value_t = 30_000, env = "DROVER_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// Idle timeout for authenticated connections, in milliseconds.
    #[arg(long, default_value_t = 1_800_000, env = "DROVER_IDLE_TIMEOUT_MS")]
    pub idle_timeout_ms: u64,

    /// Grace period for unauthenticated connections, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "DROVER_AUTH_TIMEOUT_MS")]
    pub auth_timeout_ms: u64,

    /// Token refresh cycle interval in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "DROVER_TOKEN_CYCLE_MS")]
    pub token_cycle_ms: u64,

    /// Refresh tokens expiring within this threshold, in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "DROVER_TOKEN_THRESHOLD_MS")]
    pub token_threshold_ms: u64,

    /// Maximum token refresh attempts before the connection is closed.
    #[arg(long, default_value_t = 3, env = "DROVER_TOKEN_MAX_ATTEMPTS")]
    pub token_max_attempts: u32,

    /// Maximum queued commands per agent.
    #[arg(long, default_value_t = 5, env = "DROVER_MAX_QUEUE_SIZE")]
    pub max_queue_size: usize,

    /// Estimated seconds per queued slot, used for estimated start times.
    #[arg(long, default_value_t = 30, env = "DROVER_QUEUE_STEP_SECS")]
    pub queue_step_secs: u64,

    /// Default command execution timeout in milliseconds.
    #[arg(long, default_value_t = 300_000, env = "DROVER_COMMAND_TIMEOUT_MS")]
    pub command_timeout_ms: u64,

    /// Grace window after an agent disconnect before its queue is failed, in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "DROVER_GRACE_WINDOW_MS")]
    pub grace_window_ms: u64,

    /// Emergency-stop idempotency window in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "DROVER_STOP_WINDOW_MS")]
    pub stop_window_ms: u64,

    /// Force-kill timeout for unacknowledged cancels, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "DROVER_CANCEL_KILL_MS")]
    pub cancel_kill_ms: u64,

    /// Per-subscriber fan-out buffer capacity (frames).
    #[arg(long, default_value_t = 256, env = "DROVER_FANOUT_BUFFER")]
    pub fanout_buffer: usize,

    /// Messages allowed per rate-limit window.
    #[arg(long, default_value_t = 100, env = "DROVER_RATE_LIMIT_MAX")]
    pub rate_limit_max: u32,

    /// Rate-limit window in milliseconds.
    #[arg(long, default_value_t = 60_000, env = "DROVER_RATE_LIMIT_WINDOW_MS")]
    pub rate_limit_window_ms: u64,

    /// Audit append buffer capacity (events).
    #[arg(long, default_value_t = 1024, env = "DROVER_AUDIT_BUFFER")]
    pub audit_buffer: usize,

    /// Wire protocol version to serve.
    #[arg(long, default_value_t = 1, env = "DROVER_PROTOCOL_VERSION")]
    pub protocol_version: u32,
}

/// The only wire protocol version this build speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 1;

impl ControlConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn token_cycle(&self) -> Duration {
        Duration::from_millis(self.token_cycle_ms)
    }

    pub fn token_threshold(&self) -> Duration {
        Duration::from_millis(self.token_threshold_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn stop_window(&self) -> Duration {
        Duration::from_millis(self.stop_window_ms)
    }

    pub fn cancel_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_kill_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Validate cross-field constraints that clap cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("--max-queue-size must be at least 1");
        }
        if self.rate_limit_max == 0 {
            anyhow::bail!("--rate-limit-max must be at least 1");
        }
        if self.pong_timeout_ms >= self.ping_interval_ms {
            anyhow::bail!("--pong-timeout-ms must be shorter than --ping-interval-ms");
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn test_config() -> ControlConfig {
    ControlConfig {
        host: "127.0.0.1".into(),
        port: 0,
        signing_key: None,
        identity_url: None,
        ping_interval_ms: 30_000,
        pong_timeout_ms: 10_000,
        missed_ping_threshold: 3,
        sweep_interval_ms: 30_000,
        idle_timeout_ms: 1_800_000,
        auth_timeout_ms: 60_000,
        token_cycle_ms: 60_000,
        token_threshold_ms: 300_000,
        token_max_attempts: 3,
        max_queue_size: 5,
        queue_step_secs: 30,
        command_timeout_ms: 300_000,
        grace_window_ms: 60_000,
        stop_window_ms: 5_000,
        cancel_kill_ms: 5_000,
        fanout_buffer: 256,
        rate_limit_max: 100,
        rate_limit_window_ms: 60_000,
        audit_buffer: 1024,
        protocol_version: 1,
    }
}
