//! Authentication wrappers for [`HttpClient`](super::HttpClient).

mod app_token;

pub use app_token::AppToken;
