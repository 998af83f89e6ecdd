//! HTTP download of remote crash and trip extracts.

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

/// Environment variable holding an optional NYC Open Data app token.
pub const APP_TOKEN_ENV: &str = "NYC_OPEN_DATA_APP_TOKEN";

/// Downloads `url` and returns the response body without copying it.
///
/// # Errors
///
/// Returns an error if the URL is malformed, the request fails, or the server
/// answers with a non-success status.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    let body = resp.bytes().await?;
    debug!(url, bytes = body.len(), "Download complete");
    Ok(body)
}

/// Returns `true` if `source` should be downloaded rather than opened.
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote() {
        assert!(is_remote("https://data.cityofnewyork.us/api/views/h9gi-nx95/rows.csv"));
        assert!(is_remote("http://localhost/trips.zip"));
        assert!(!is_remote("data/trips.csv"));
        assert!(!is_remote("httpdata/trips.csv"));
    }
}
