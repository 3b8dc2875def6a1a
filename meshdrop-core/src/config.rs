//! Protocol tunables. All durations are in milliseconds so the struct maps 1:1 onto a TOML table.

use std::time::Duration;

use serde::Deserialize;

/// Link, heartbeat and transfer constants. Every field has a default; a `[mesh]` table may override any subset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// A `connecting` attempt older than this is force-closed and retried.
    pub connect_timeout_ms: u64,
    /// First reconnect delay, and the value backoff resets to on open.
    pub reconnect_base_ms: u64,
    /// Backoff multiplier per failed attempt (kept below 2).
    pub reconnect_growth: f64,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_ms: u64,
    /// Period of the ping sweep over connected links.
    pub heartbeat_interval_ms: u64,
    /// A connected link with no inbound traffic for longer than this is stale.
    pub heartbeat_timeout_ms: u64,
    /// Plaintext bytes per chunk.
    pub chunk_size: usize,
    /// Max chunks in flight above the last cumulative ack.
    pub window_size: u64,
    /// Receiver acks every `ack_interval` chunks.
    pub ack_interval: u64,
    /// Sender stops producing while a download link buffers more than this.
    pub high_water_bytes: usize,
    /// Delay before a sender closes its download link after the last message.
    pub close_grace_ms: u64,
    /// Delay before a receiver closes its download link after completion.
    pub receiver_close_delay_ms: u64,
    /// An unacknowledged chunk is resent after this long.
    pub chunk_retry_ms: u64,
    /// Resends per chunk before the transfer fails.
    pub max_chunk_retries: u32,
    /// Receiver gives up when no chunk arrives for this long.
    pub receive_timeout_ms: u64,
    /// Display names are truncated to this many characters.
    pub max_name_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            reconnect_base_ms: 1_000,
            reconnect_growth: 1.5,
            reconnect_max_ms: 20_000,
            heartbeat_interval_ms: 2_000,
            heartbeat_timeout_ms: 5_000,
            chunk_size: 16 * 1024,
            window_size: 1024,
            ack_interval: 16,
            high_water_bytes: 8 * 1024 * 1024,
            close_grace_ms: 5_000,
            receiver_close_delay_ms: 1_000,
            chunk_retry_ms: 5_000,
            max_chunk_retries: 5,
            receive_timeout_ms: 30_000,
            max_name_len: 20,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn receiver_close_delay(&self) -> Duration {
        Duration::from_millis(self.receiver_close_delay_ms)
    }

    pub fn chunk_retry(&self) -> Duration {
        Duration::from_millis(self.chunk_retry_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Next reconnect delay after `current`: grown by the factor, capped, never below base.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.reconnect_growth.max(1.0));
        grown.min(self.reconnect_max()).max(self.reconnect_base())
    }

    /// Clamp values that would stall the engine (zero chunk size, zero window, zero ack interval).
    pub fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = Config::default().chunk_size;
        }
        self.window_size = self.window_size.max(1);
        self.ack_interval = self.ack_interval.max(1);
        self.max_name_len = self.max_name_len.max(1);
        self
    }
}
