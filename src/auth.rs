use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::session::Session;
use crate::supabase::{check_status, parse_base_url};

const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub anon_key: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            anon_key: String::new(),
            user_agent: format!("parkfeed/{}", crate::VERSION),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Email/password authentication against the backend's auth API.
pub struct Client {
    cfg: Config,
    base_url: Url,
    http: HttpClient,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.base_url.trim().is_empty() {
            bail!("auth: backend url is required");
        }
        if cfg.anon_key.trim().is_empty() {
            bail!("auth: anon key is required");
        }
        if cfg.user_agent.trim().is_empty() {
            bail!("auth: user agent is required");
        }
        let base_url = parse_base_url(&cfg.base_url)?;
        let http = HttpClient::builder()
            .timeout(cfg.timeout)
            .build()
            .context("auth: build http client")?;
        Ok(Self {
            cfg,
            base_url,
            http,
        })
    }

    pub fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            bail!("auth: email and password are required");
        }
        let payload = self
            .token_request("password", json!({ "email": email, "password": password }))
            .context("auth: sign in")?;
        payload.into_session(None)
    }

    /// Exchanges the session's refresh token for a new access token.
    pub fn refresh(&self, session: &Session) -> Result<Session> {
        if session.refresh_token.is_empty() {
            bail!("auth: session has no refresh token");
        }
        let payload = self
            .token_request(
                "refresh_token",
                json!({ "refresh_token": session.refresh_token }),
            )
            .context("auth: refresh")?;
        payload.into_session(Some(session))
    }

    pub fn sign_out(&self, session: &Session) -> Result<()> {
        let url = self.base_url.join("auth/v1/logout")?;
        let resp = self
            .http
            .post(url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header("apikey", self.cfg.anon_key.clone())
            .header(AUTHORIZATION, format!("Bearer {}", session.access_token))
            .send()
            .context("auth: sign out request")?;
        check_status(resp).context("auth: sign out")?;
        Ok(())
    }

    fn token_request(&self, grant_type: &str, body: serde_json::Value) -> Result<TokenResponse> {
        let mut url = self.base_url.join("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);
        let resp = self
            .http
            .post(url)
            .header(USER_AGENT, self.cfg.user_agent.clone())
            .header(CONTENT_TYPE, "application/json")
            .header("apikey", self.cfg.anon_key.clone())
            .json(&body)
            .send()
            .context("auth: token request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<TokenError>(&body) {
                bail!("auth: token request failed ({}): {}", status, err);
            }
            bail!("auth: token request failed ({}): {}", status, body);
        }
        let payload: TokenResponse = resp.json().context("auth: decode token response")?;
        if payload.access_token.is_empty() {
            bail!("auth: missing access token");
        }
        Ok(payload)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    user: Option<UserResponse>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    username: Option<String>,
}

impl TokenResponse {
    /// Builds a session from the response. Fields the response leaves out are
    /// carried over from `previous`.
    fn into_session(self, previous: Option<&Session>) -> Result<Session> {
        let now = Utc::now();
        let expires_at = expiry_after(now, self.expires_in)
            .or_else(|| expiry_after(now, DEFAULT_EXPIRES_IN))
            .unwrap_or(now);

        let refresh_token = if !self.refresh_token.is_empty() {
            self.refresh_token
        } else if let Some(previous) = previous {
            previous.refresh_token.clone()
        } else {
            bail!("auth: missing refresh token");
        };

        let (user_id, email, username) = match (self.user, previous) {
            (Some(user), _) => {
                let email = user.email.unwrap_or_default();
                let username = user
                    .user_metadata
                    .unwrap_or_default()
                    .username
                    .filter(|name| !name.trim().is_empty())
                    .or_else(|| previous.map(|p| p.username.clone()))
                    .unwrap_or_else(|| email_local_part(&email));
                (user.id, email, username)
            }
            (None, Some(previous)) => (
                previous.user_id.clone(),
                previous.email.clone(),
                previous.username.clone(),
            ),
            (None, None) => bail!("auth: token response missing user"),
        };
        if user_id.is_empty() {
            bail!("auth: token response missing user id");
        }

        Ok(Session {
            user_id,
            email,
            username,
            access_token: self.access_token,
            refresh_token,
            expires_at,
        })
    }
}

/// `None` for a zero or out-of-range lifetime.
fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> Option<DateTime<Utc>> {
    if expires_in == 0 {
        return None;
    }
    let seconds = i64::try_from(expires_in).ok()?;
    now.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
}

fn email_local_part(email: &str) -> String {
    email.split('@').next().unwrap_or_default().to_string()
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "error_description")]
    description: String,
    #[serde(default)]
    msg: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = if self.description.is_empty() {
            &self.msg
        } else {
            &self.description
        };
        match (self.error.is_empty(), description.is_empty()) {
            (true, true) => write!(f, "unknown token error"),
            (false, true) => write!(f, "{}", self.error),
            (true, false) => write!(f, "{}", description),
            (false, false) => write!(f, "{} ({})", self.error, description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supabase::testserver::serve;

    fn client(base: &str) -> Client {
        Client::new(Config {
            base_url: base.to_string(),
            anon_key: "anon".to_string(),
            ..Config::default()
        })
        .unwrap()
    }

    const SIGN_IN: &str = r#"{
      "access_token":"jwt-1","token_type":"bearer","expires_in":3600,
      "refresh_token":"r-1",
      "user":{"id":"u1","email":"asha@example.com","user_metadata":{}}
    }"#;

    #[test]
    fn sign_in_posts_password_grant() {
        let (base, seen) = serve(vec![(200, SIGN_IN)]);
        let session = client(&base).sign_in("asha@example.com", "secret").unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.username, "asha");
        assert_eq!(session.access_token, "jwt-1");
        assert_eq!(session.refresh_token, "r-1");
        assert!(session.expires_at > Utc::now());

        let req = seen.recv().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "/auth/v1/token?grant_type=password");
        assert_eq!(req.apikey.as_deref(), Some("anon"));
        assert!(req.body.contains("\"email\":\"asha@example.com\""));
    }

    #[test]
    fn sign_in_reports_backend_error() {
        let (base, _seen) = serve(vec![(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        )]);
        let err = client(&base).sign_in("asha@example.com", "nope").unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid login credentials"));
    }

    #[test]
    fn blank_credentials_make_no_request() {
        let c = Client::new(Config {
            base_url: "http://127.0.0.1:9/".into(),
            anon_key: "anon".into(),
            ..Config::default()
        })
        .unwrap();
        assert!(c.sign_in("  ", "secret").is_err());
        assert!(c.sign_in("a@b.c", "").is_err());
    }

    #[test]
    fn refresh_keeps_identity_and_old_refresh_token() {
        let (base, seen) = serve(vec![(200, r#"{"access_token":"jwt-2","expires_in":60}"#)]);
        let current = Session {
            user_id: "u1".into(),
            email: "asha@example.com".into(),
            username: "asha_k".into(),
            access_token: "jwt-1".into(),
            refresh_token: "r-1".into(),
            expires_at: Utc::now(),
        };
        let next = client(&base).refresh(&current).unwrap();
        assert_eq!(next.access_token, "jwt-2");
        assert_eq!(next.refresh_token, "r-1");
        assert_eq!(next.username, "asha_k");

        let req = seen.recv().unwrap();
        assert_eq!(req.url, "/auth/v1/token?grant_type=refresh_token");
        assert!(req.body.contains("\"refresh_token\":\"r-1\""));
    }

    #[test]
    fn absurd_expiry_falls_back_to_default_lifetime() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"jwt","refresh_token":"r","expires_in":18446744073709551615,
                "user":{"id":"u1","email":"asha@example.com"}}"#,
        )
        .unwrap();
        let before = Utc::now();
        let session = response.into_session(None).unwrap();
        let lifetime = session.expires_at - before;
        assert!(lifetime >= chrono::Duration::seconds(3590));
        assert!(lifetime <= chrono::Duration::seconds(3610));
    }

    #[test]
    fn sign_out_sends_bearer_token() {
        let (base, seen) = serve(vec![(204, "")]);
        let session = Session {
            user_id: "u1".into(),
            email: String::new(),
            username: "asha".into(),
            access_token: "jwt-1".into(),
            refresh_token: "r-1".into(),
            expires_at: Utc::now(),
        };
        client(&base).sign_out(&session).unwrap();
        let req = seen.recv().unwrap();
        assert_eq!(req.url, "/auth/v1/logout");
        assert_eq!(req.authorization.as_deref(), Some("Bearer jwt-1"));
    }

    #[test]
    fn missing_config_is_rejected() {
        assert!(Client::new(Config::default()).is_err());
    }
}
