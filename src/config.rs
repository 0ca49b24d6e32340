use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub api_base_url: String,
    pub access_token: Option<String>,
    pub query_stale_time: Duration,
    pub notification_display: Duration,
    pub ws_send_buffer: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let bind_addr = var("ISSUELOCK_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".into());
        let api_base_url = var("ISSUELOCK_API_URL")
            .or_else(|| var("ISSUELOCK_AWS_API_URL"))
            .filter(|url| !url.trim().is_empty())
            .context("ISSUELOCK_API_URL or ISSUELOCK_AWS_API_URL must be set")?;
        let access_token = var("ISSUELOCK_ACCESS_TOKEN").filter(|t| !t.trim().is_empty());
        let query_stale_time_ms: u64 = var("QUERY_STALE_TIME_MS")
            .unwrap_or_else(|| "0".into())
            .parse()
            .context("QUERY_STALE_TIME_MS must be a number")?;
        let notification_display_ms: u64 = var("NOTIFICATION_DISPLAY_MS")
            .unwrap_or_else(|| "6000".into())
            .parse()
            .context("NOTIFICATION_DISPLAY_MS must be a number")?;
        let ws_send_buffer = var("WS_SEND_BUFFER")
            .unwrap_or_else(|| "64".into())
            .parse()
            .context("WS_SEND_BUFFER must be a number")?;

        Ok(Self {
            bind_addr,
            api_base_url,
            access_token,
            query_stale_time: Duration::from_millis(query_stale_time_ms),
            notification_display: Duration::from_millis(notification_display_ms),
            ws_send_buffer,
        })
    }
}
