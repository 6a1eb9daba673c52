//! Pay-once access grants.
//!
//! In `pay_once` mode a successful payment also mints an `acc_` token that
//! unlocks the same route without paying again until it expires. The token
//! travels back either as `X-SCP-Access-Token` or as the `scp_access` cookie.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use dashmap::DashMap;
use scp::UnixTimestamp;
use scp::ids;
use scp::proto::{ACCESS_COOKIE, ACCESS_TOKEN_HEADER, AccessGrant};
use scp::timestamp::Clock;

const PAY_ONCE: &str = "pay_once";

#[derive(Debug, Clone)]
struct Grant {
    path: String,
    expires_at: UnixTimestamp,
}

/// Live pay-once grants by token.
#[derive(Debug)]
pub struct AccessGrants {
    grants: DashMap<String, Grant>,
    ttl_secs: u64,
    clock: Arc<dyn Clock>,
}

impl AccessGrants {
    /// Grants valid for `ttl_secs` after issue.
    #[must_use]
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: DashMap::new(),
            ttl_secs,
            clock,
        }
    }

    /// Mints a grant for `path`.
    pub fn issue(&self, path: &str) -> AccessGrant {
        let token = ids::access_token();
        let expires_at = self.clock.now() + self.ttl_secs;
        self.grants.insert(
            token.clone(),
            Grant {
                path: path.to_owned(),
                expires_at,
            },
        );
        AccessGrant {
            mode: PAY_ONCE.to_owned(),
            token,
            expires_at,
        }
    }

    /// `Set-Cookie` value carrying a grant's token.
    #[must_use]
    pub fn cookie(&self, grant: &AccessGrant) -> String {
        format!(
            "{ACCESS_COOKIE}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
            grant.token, self.ttl_secs
        )
    }

    /// The grant behind `token` if it is live and scoped to `path`.
    /// Expired grants are dropped on sight.
    #[must_use]
    pub fn check(&self, token: &str, path: &str) -> Option<AccessGrant> {
        let grant = self.grants.get(token).map(|g| g.clone())?;
        if grant.expires_at <= self.clock.now() {
            self.grants.remove(token);
            return None;
        }
        (grant.path == path).then(|| AccessGrant {
            mode: PAY_ONCE.to_owned(),
            token: token.to_owned(),
            expires_at: grant.expires_at,
        })
    }

    /// Live and not yet swept grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Whether no grant is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Access token from the header, falling back to the cookie.
#[must_use]
pub fn presented_token(headers: &HeaderMap) -> Option<String> {
    let header = headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = header {
        return Some(token.to_owned());
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == ACCESS_COOKIE)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use scp::timestamp::ManualClock;

    #[test]
    fn grants_are_scoped_and_expire() {
        let clock = ManualClock::new(1_000);
        let grants = AccessGrants::new(3_600, Arc::new(clock.clone()));
        let grant = grants.issue("/v1/data");
        assert!(grant.token.starts_with("acc_"));
        assert_eq!(grant.expires_at.as_secs(), 4_600);
        assert_eq!(grant.mode, "pay_once");

        assert_eq!(grants.check(&grant.token, "/v1/data"), Some(grant.clone()));
        assert!(grants.check(&grant.token, "/v1/premium").is_none());
        assert!(grants.check("acc_unknown", "/v1/data").is_none());

        clock.advance(3_600);
        assert!(grants.check(&grant.token, "/v1/data").is_none());
        assert!(grants.is_empty());
    }

    #[test]
    fn cookie_attributes() {
        let grants = AccessGrants::new(86_400, Arc::new(ManualClock::new(0)));
        let grant = grants.issue("/v1/data");
        assert_eq!(
            grants.cookie(&grant),
            format!("scp_access={}; Max-Age=86400; Path=/; HttpOnly; SameSite=Lax", grant.token)
        );
    }

    #[test]
    fn token_from_header_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; scp_access=acc_cookie"));
        assert_eq!(presented_token(&headers).as_deref(), Some("acc_cookie"));

        headers.insert(ACCESS_TOKEN_HEADER, HeaderValue::from_static(" acc_header "));
        assert_eq!(presented_token(&headers).as_deref(), Some("acc_header"));

        assert!(presented_token(&HeaderMap::new()).is_none());
    }
}
