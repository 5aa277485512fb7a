use once_cell::sync::Lazy;

pub static USER_AGENT: Lazy<String> =
    Lazy::new(|| format!("switchyard/{}", env!("CARGO_PKG_VERSION")));

// Access tokens are refreshed once they are within this margin of expiry.
pub const TOKEN_REFRESH_SAFETY_MS: i64 = 60_000;

// Hard deadline for any single upstream HTTP call, including streaming reads.
pub const UPSTREAM_TIMEOUT_SECS: u64 = 600;
pub const CONNECT_TIMEOUT_SECS: u64 = 20;

// Cached model quotas older than this trigger a background refresh.
pub const QUOTA_CACHE_TTL_SECS: i64 = 300;

// Retry matrix bounds.
pub const MAX_QUOTA_SWAPS: u32 = 5;
pub const MAX_PROJECT_RETRIES: u32 = 1;

// onboardUser long-running operation polling.
pub const ONBOARD_POLL_ATTEMPTS: u32 = 5;
pub const ONBOARD_POLL_INTERVAL_SECS: u64 = 2;

// Shared-pool capacity contributed by each enabled shared account.
pub const POOL_QUOTA_PER_ACCOUNT: f64 = 2.0;

// Upper bound on concurrent background quota refreshes.
pub const QUOTA_REFRESH_WORKERS: usize = 4;

// Kiro upstream rejects tool specifications with a blank description.
pub const KIRO_EMPTY_TOOL_DESCRIPTION: &str = "No description provided";

/// Several logical model names can draw from one upstream quota counter.
/// The shared-pool key and the availability check use the group, not the
/// raw model name.
pub fn quota_group_for_model(model: &str) -> &str {
    if model.starts_with("gemini-3-pro") {
        "gemini-3-pro"
    } else if model.starts_with("gemini-2.5-pro") {
        "gemini-2.5-pro"
    } else if model.starts_with("claude") {
        "claude"
    } else {
        model
    }
}

/// Models with an elevated 503 rate on the unary `generateContent` method.
/// These are always fetched over SSE and re-aggregated locally.
pub fn force_sse_for_model(model: &str) -> bool {
    model.starts_with("gemini-3-pro") || model.starts_with("claude")
}
