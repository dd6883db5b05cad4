use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk snapshot of an authenticated portal session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSessionDto {
    /// Unix seconds.
    pub saved_at: i64,
    /// Portal the cookies belong to; a snapshot is never replayed against another one.
    pub base_url: String,
    pub csrf_token: String,
    /// `name=value` pairs as sent in the `Cookie` header.
    pub cookies: Vec<String>,
}

impl fmt::Debug for CachedSessionDto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|cookie| cookie.split('=').next().unwrap_or_default()).collect();
        f.debug_struct("CachedSessionDto")
            .field("saved_at", &self.saved_at)
            .field("base_url", &self.base_url)
            .field("csrf_token", &"***")
            .field("cookies", &names)
            .finish()
    }
}
