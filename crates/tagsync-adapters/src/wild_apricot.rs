//! HTTP client for a Wild Apricot style membership directory.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tagsync_core::{MemberId, MemberRecord};
use tagsync_storage::{FetchError, HttpClientConfig, HttpFetcher, RequestAuth, TokenBucketConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{DirectoryClient, DirectoryError};

/// Tokens this close to expiry are refreshed before use.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone)]
pub struct DirectoryClientConfig {
    pub api_base_url: String,
    pub auth_url: String,
    pub account_id: i64,
    pub api_key: String,
    pub http_timeout: Duration,
    pub async_poll_attempts: u32,
    pub async_poll_delay: Duration,
    pub rate_limit: Option<TokenBucketConfig>,
    pub user_agent: Option<String>,
}

impl fmt::Debug for DirectoryClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryClientConfig")
            .field("api_base_url", &self.api_base_url)
            .field("auth_url", &self.auth_url)
            .field("account_id", &self.account_id)
            .field("api_key", &"<redacted>")
            .field("http_timeout", &self.http_timeout)
            .field("async_poll_attempts", &self.async_poll_attempts)
            .field("async_poll_delay", &self.async_poll_delay)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// One response from the contacts endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactsPage {
    Ready(Vec<MemberRecord>),
    /// Results are still being prepared; poll `result_url` (or the same url).
    Pending { result_url: Option<String> },
}

#[derive(Debug, Deserialize)]
struct ContactsEnvelope {
    #[serde(rename = "Contacts", default)]
    contacts: Option<Vec<MemberRecord>>,
    #[serde(rename = "ResultUrl", default)]
    result_url: Option<String>,
    #[serde(rename = "State", default)]
    state: Option<String>,
}

pub fn parse_contacts_page(body: &[u8], url: &str) -> Result<ContactsPage, DirectoryError> {
    let envelope: ContactsEnvelope = serde_json::from_slice(body).map_err(|source| DirectoryError::Decode {
        url: url.to_string(),
        source,
    })?;
    match envelope {
        ContactsEnvelope {
            contacts: Some(contacts),
            ..
        } => Ok(ContactsPage::Ready(contacts)),
        ContactsEnvelope {
            result_url: None,
            state: None,
            ..
        } => Err(DirectoryError::Decode {
            url: url.to_string(),
            source: serde::de::Error::missing_field("Contacts"),
        }),
        ContactsEnvelope { result_url, .. } => Ok(ContactsPage::Pending { result_url }),
    }
}

pub fn parse_contact(body: &[u8], url: &str) -> Result<MemberRecord, DirectoryError> {
    serde_json::from_slice(body).map_err(|source| DirectoryError::Decode {
        url: url.to_string(),
        source,
    })
}

fn parse_token(body: &[u8], url: &str, now: DateTime<Utc>) -> Result<AccessToken, DirectoryError> {
    let response: TokenResponse = serde_json::from_slice(body).map_err(|source| DirectoryError::Decode {
        url: url.to_string(),
        source,
    })?;
    let lifetime = response.expires_in.clamp(0, 86_400);
    Ok(AccessToken {
        value: response.access_token,
        expires_at: now + chrono::Duration::seconds(lifetime),
    })
}

fn contacts_url(base: &str, account_id: i64, filter: &str) -> Result<Url, DirectoryError> {
    let endpoint = format!("{}/accounts/{account_id}/contacts", base.trim_end_matches('/'));
    let mut params = vec![("$async", "false")];
    if !filter.trim().is_empty() {
        params.push(("$filter", filter));
    }
    Url::parse_with_params(&endpoint, &params).map_err(|e| DirectoryError::InvalidUrl(format!("{endpoint}: {e}")))
}

fn contact_url(base: &str, account_id: i64, member_id: MemberId) -> Result<Url, DirectoryError> {
    let endpoint = format!("{}/accounts/{account_id}/contacts/{member_id}", base.trim_end_matches('/'));
    Url::parse(&endpoint).map_err(|e| DirectoryError::InvalidUrl(format!("{endpoint}: {e}")))
}

fn map_fetch_error(err: FetchError) -> DirectoryError {
    match err.status() {
        Some(status @ (401 | 403)) => DirectoryError::Unauthorized { status },
        _ => DirectoryError::Fetch(err),
    }
}

#[derive(Debug)]
pub struct HttpDirectoryClient {
    config: DirectoryClientConfig,
    http: HttpFetcher,
    token: Mutex<Option<AccessToken>>,
}

impl HttpDirectoryClient {
    pub fn new(config: DirectoryClientConfig) -> anyhow::Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(DirectoryError::MissingCredential("DIRECTORY_API_KEY").into());
        }
        Url::parse(&config.api_base_url)
            .with_context(|| format!("parsing directory api_base_url {}", config.api_base_url))?;
        Url::parse(&config.auth_url).with_context(|| format!("parsing directory auth_url {}", config.auth_url))?;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            token_bucket: config.rate_limit,
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, DirectoryError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value.clone());
        }

        let auth = RequestAuth::Basic {
            username: "APIKEY".to_string(),
            password: self.config.api_key.clone(),
        };
        let response = self
            .http
            .post_form(
                &self.config.auth_url,
                &auth,
                &[("grant_type", "client_credentials"), ("scope", "auto")],
            )
            .await
            .map_err(map_fetch_error)?;
        let token = parse_token(&response.body, &self.config.auth_url, Utc::now())?;
        info!(expires_at = %token.expires_at, "directory access token refreshed");

        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn authorized_get(&self, url: &str) -> Result<Vec<u8>, DirectoryError> {
        let token = self.access_token().await?;
        match self.http.get(url, &RequestAuth::Bearer(token)).await {
            Ok(response) => Ok(response.body),
            Err(err) => {
                let mapped = map_fetch_error(err);
                if matches!(mapped, DirectoryError::Unauthorized { .. }) {
                    // Force a fresh token on the next call.
                    self.token.lock().await.take();
                }
                Err(mapped)
            }
        }
    }

    async fn poll_async_result(&self, mut url: String) -> Result<Vec<MemberRecord>, DirectoryError> {
        let attempts = self.config.async_poll_attempts.max(1);
        for attempt in 1..=attempts {
            tokio::time::sleep(self.config.async_poll_delay).await;
            let body = self.authorized_get(&url).await?;
            match parse_contacts_page(&body, &url)? {
                ContactsPage::Ready(contacts) => {
                    debug!(attempt, contacts = contacts.len(), "async contacts result ready");
                    return Ok(contacts);
                }
                ContactsPage::Pending { result_url } => {
                    debug!(attempt, "async contacts result still pending");
                    if let Some(next) = result_url {
                        url = next;
                    }
                }
            }
        }
        warn!(attempts, "async contacts result never became ready");
        Err(DirectoryError::AsyncResultNotReady { url, attempts })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn list_active_members(&self, filter: &str) -> Result<Vec<MemberRecord>, DirectoryError> {
        let url = contacts_url(&self.config.api_base_url, self.config.account_id, filter)?;
        let body = self.authorized_get(url.as_str()).await?;
        match parse_contacts_page(&body, url.as_str())? {
            ContactsPage::Ready(contacts) => Ok(contacts),
            ContactsPage::Pending { result_url } => {
                let poll_url = result_url.unwrap_or_else(|| url.to_string());
                self.poll_async_result(poll_url).await
            }
        }
    }

    async fn get_member(&self, member_id: MemberId) -> Result<Option<MemberRecord>, DirectoryError> {
        let url = contact_url(&self.config.api_base_url, self.config.account_id, member_id)?;
        match self.authorized_get(url.as_str()).await {
            Ok(body) => parse_contact(&body, url.as_str()).map(Some),
            Err(DirectoryError::Fetch(err)) if err.status() == Some(404) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> DirectoryClientConfig {
        DirectoryClientConfig {
            api_base_url: "https://api.example.org/v2.2/".to_string(),
            auth_url: "https://oauth.example.org/auth/token".to_string(),
            account_id: 12345,
            api_key: "super-secret".to_string(),
            http_timeout: Duration::from_secs(30),
            async_poll_attempts: 10,
            async_poll_delay: Duration::from_secs(5),
            rate_limit: None,
            user_agent: None,
        }
    }

    #[test]
    fn contacts_page_ready_and_pending_shapes() {
        let ready = parse_contacts_page(
            br#"{"Contacts":[{"Id":1,"FieldValues":[{"FieldName":"Tag ID","Value":"1001"}]}]}"#,
            "u",
        )
        .unwrap();
        match ready {
            ContactsPage::Ready(contacts) => {
                assert_eq!(contacts.len(), 1);
                assert_eq!(contacts[0].id, 1);
            }
            other => panic!("unexpected page {other:?}"),
        }

        let pending = parse_contacts_page(
            br#"{"ResultId":"abc","ResultUrl":"https://api.example.org/results/abc","State":"Waiting"}"#,
            "u",
        )
        .unwrap();
        assert_eq!(
            pending,
            ContactsPage::Pending {
                result_url: Some("https://api.example.org/results/abc".to_string())
            }
        );

        let still_processing = parse_contacts_page(br#"{"State":"Processing"}"#, "u").unwrap();
        assert_eq!(still_processing, ContactsPage::Pending { result_url: None });
    }

    #[test]
    fn contacts_page_without_contacts_or_result_is_a_decode_error() {
        assert!(matches!(
            parse_contacts_page(br#"{"Other":true}"#, "u"),
            Err(DirectoryError::Decode { .. })
        ));
        assert!(matches!(
            parse_contacts_page(b"<html>", "u"),
            Err(DirectoryError::Decode { .. })
        ));
    }

    #[test]
    fn token_freshness_respects_refresh_margin() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let token = parse_token(br#"{"access_token":"abc","token_type":"Bearer","expires_in":1800}"#, "u", now).unwrap();
        assert_eq!(token.value, "abc");
        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + chrono::Duration::seconds(1700)));
        assert!(!token.is_fresh(now + chrono::Duration::seconds(1750)));
        assert!(!format!("{token:?}").contains("abc"));
    }

    #[test]
    fn urls_carry_account_member_and_encoded_filter() {
        let url = contacts_url("https://api.example.org/v2.2/", 12345, "'Membership status' eq 'Active'").unwrap();
        assert_eq!(url.path(), "/v2.2/accounts/12345/contacts");
        let filter = url
            .query_pairs()
            .find(|(k, _)| k == "$filter")
            .map(|(_, v)| v.into_owned());
        assert_eq!(filter.as_deref(), Some("'Membership status' eq 'Active'"));

        let unfiltered = contacts_url("https://api.example.org/v2.2", 1, " ").unwrap();
        assert!(unfiltered.query_pairs().all(|(k, _)| k != "$filter"));

        let single = contact_url("https://api.example.org/v2.2", 12345, 42).unwrap();
        assert_eq!(single.path(), "/v2.2/accounts/12345/contacts/42");
    }

    #[test]
    fn auth_failures_are_classified() {
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 401,
            url: "u".into(),
        });
        assert!(matches!(err, DirectoryError::Unauthorized { status: 401 }));
        let err = map_fetch_error(FetchError::HttpStatus {
            status: 500,
            url: "u".into(),
        });
        assert!(matches!(err, DirectoryError::Fetch(_)));
    }

    #[test]
    fn client_requires_api_key_and_redacts_it() {
        assert!(!format!("{:?}", config()).contains("super-secret"));

        let mut missing = config();
        missing.api_key = String::new();
        let err = HttpDirectoryClient::new(missing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DirectoryError>(),
            Some(DirectoryError::MissingCredential("DIRECTORY_API_KEY"))
        ));

        assert!(HttpDirectoryClient::new(config()).is_ok());
    }
}
