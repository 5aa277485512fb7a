use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

use crate::constants::{CONNECT_TIMEOUT_SECS, UPSTREAM_TIMEOUT_SECS, USER_AGENT};

/// Shared pooled client for model traffic. The total timeout doubles as the
/// per-request hard deadline, covering every read of a streaming body.
pub static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| build_client(UPSTREAM_TIMEOUT_SECS));

/// Short-deadline client for token refreshes and control-plane calls.
pub static SHARED_CLIENT_SHORT: Lazy<Client> = Lazy::new(|| build_client(60));

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT.as_str())
        .build()
        .expect("Failed to create HTTP client")
}
