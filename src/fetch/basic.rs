use super::client::HttpClient;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Plain `reqwest` client with generous timeouts; trip archives run to hundreds of MB.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Self {
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600));
        Self(build_or_default(builder))
    }
}

fn build_or_default(builder: reqwest::ClientBuilder) -> reqwest::Client {
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, falling back to default without timeouts");
        reqwest::Client::default()
    })
}

impl Default for BasicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_builder_falls_back() {
        let builder = reqwest::Client::builder().user_agent("bad\nagent");
        let client = build_or_default(builder);
        assert!(client.get("https://data.cityofnewyork.us").build().is_ok());
    }
}
