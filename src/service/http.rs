//! HTTP client factory.
//!
//! One client, one identity. The engine warms caches for the operator's own
//! domains; there is no reason to impersonate a browser's TLS/HTTP
//! fingerprint or rotate identity, and every reason to let upstream
//! operators see exactly what's hitting them and why.

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

pub const USER_AGENT: &str = "CacheWarmerBot/1.0 (+https://example.com/bot)";

pub fn create_client(request_timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(request_timeout)
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_default_timeout() {
        let client = create_client(Duration::from_secs(30));
        assert!(client.is_ok());
    }
}
