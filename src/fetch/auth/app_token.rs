use crate::fetch::client::HttpClient;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that sends an API token as an HTTP header.
///
/// NYC Open Data (Socrata) throttles anonymous bulk exports of the collision
/// table; a registered app token lifts the limit. `header_name` defaults to
/// `X-App-Token`.
pub struct AppToken<C> {
    pub inner: C,
    pub header_name: HeaderName,
    pub token: HeaderValue,
}

impl<C> AppToken<C> {
    /// Wraps `inner` with a Socrata `X-App-Token` header.
    ///
    /// Returns `None` if `token` contains bytes that are not valid in a header.
    pub fn socrata(inner: C, token: &str) -> Option<Self> {
        Some(Self {
            inner,
            header_name: HeaderName::from_static("x-app-token"),
            token: HeaderValue::from_str(token).ok()?,
        })
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for AppToken<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.token.clone());
        self.inner.execute(req).await
    }
}
