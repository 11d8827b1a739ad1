use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;

use crate::calendar::CalendarError;
use crate::config::OAuthConfig;

pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

type GoogleClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

/// The fields of a Google service-account key file that the token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CalendarError> {
        let path = path.as_ref();
        let credentials_error = |message: String| CalendarError::Credentials {
            path: path.display().to_string(),
            message,
        };
        let content = std::fs::read_to_string(path).map_err(|e| credentials_error(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| credentials_error(e.to_string()))
    }
}

/// OAuth tokens carried in the session cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the expiry is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthToken {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| exp.saturating_sub(EXPIRY_SKEW_SECS) <= now)
    }

    fn from_response<T: TokenResponse>(response: &T, previous_refresh: Option<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(previous_refresh),
            expires_at: response
                .expires_in()
                .map(|d| now.saturating_add(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect())
                .unwrap_or_else(|| vec![CALENDAR_SCOPE.to_string()]),
        }
    }
}

/// Three-legged OAuth against Google's endpoints.
#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    client_id: String,
    client_secret: String,
    redirect_url: String,
    auth_url: String,
    token_url: String,
}

impl GoogleOAuth {
    pub fn new(client_id: String, client_secret: String, redirect_url: String) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_url,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
        }
    }

    /// `None` unless client id, secret and redirect url are all set.
    pub fn from_config(config: &OAuthConfig) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        Some(Self::new(
            config.client_id.clone()?,
            config.client_secret.clone()?,
            config.redirect_url.clone()?,
        ))
    }

    pub fn with_endpoints(mut self, auth_url: impl Into<String>, token_url: impl Into<String>) -> Self {
        self.auth_url = auth_url.into();
        self.token_url = token_url.into();
        self
    }

    fn client(&self) -> Result<GoogleClient, CalendarError> {
        let invalid = |e: oauth2::url::ParseError| CalendarError::Auth(format!("invalid OAuth URL: {}", e));
        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(AuthUrl::new(self.auth_url.clone()).map_err(invalid)?)
            .set_token_uri(TokenUrl::new(self.token_url.clone()).map_err(invalid)?)
            .set_redirect_uri(RedirectUrl::new(self.redirect_url.clone()).map_err(invalid)?))
    }

    /// Authorization URL and the random state it carries.
    pub fn authorize_url(&self) -> Result<(String, String), CalendarError> {
        let (url, state) = self
            .client()?
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(CALENDAR_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("include_granted_scopes", "true")
            .add_extra_param("prompt", "consent")
            .url();
        Ok((url.to_string(), state.secret().clone()))
    }

    pub async fn exchange_code(&self, http: &reqwest::Client, code: &str) -> Result<OAuthToken, CalendarError> {
        let response = self
            .client()?
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(http)
            .await
            .map_err(|e| CalendarError::Auth(format!("code exchange failed: {}", e)))?;
        Ok(OAuthToken::from_response(&response, None))
    }

    pub async fn refresh(&self, http: &reqwest::Client, refresh_token: &str) -> Result<OAuthToken, CalendarError> {
        let response = self
            .client()?
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(http)
            .await
            .map_err(|e| CalendarError::Auth(format!("token refresh failed: {}", e)))?;
        Ok(OAuthToken::from_response(&response, Some(refresh_token.to_string())))
    }
}

/// How calendar requests authenticate.
#[derive(Debug, Clone)]
pub enum Credentials {
    ServiceAccount(ServiceAccountKey),
    OAuth {
        token: OAuthToken,
        /// Needed to refresh an expired access token.
        client: Option<GoogleOAuth>,
    },
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
}

impl CachedToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |exp| exp.saturating_sub(EXPIRY_SKEW_SECS) > now)
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct AssertionTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Hands out access tokens, fetching or refreshing them as needed.
pub struct TokenSource {
    credentials: Credentials,
    http: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        let cache = match &credentials {
            Credentials::OAuth { token, .. } => Some(CachedToken {
                access_token: token.access_token.clone(),
                refresh_token: token.refresh_token.clone(),
                expires_at: token.expires_at,
            }),
            Credentials::ServiceAccount(_) => None,
        };
        Self {
            credentials,
            http,
            cache: Mutex::new(cache),
        }
    }

    pub fn service_account<P: AsRef<Path>>(path: P, http: reqwest::Client) -> Result<Self, CalendarError> {
        let key = ServiceAccountKey::from_file(path)?;
        log::info!("Calendar: using service account {}", key.client_email);
        Ok(Self::new(Credentials::ServiceAccount(key), http))
    }

    pub async fn access_token(&self) -> Result<String, CalendarError> {
        let now = Utc::now().timestamp();
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(now)) {
            return Ok(cached.access_token.clone());
        }

        let fresh = match &self.credentials {
            Credentials::ServiceAccount(key) => self.service_account_token(key, now).await?,
            Credentials::OAuth { client, .. } => {
                let refresh_token = cache.as_ref().and_then(|c| c.refresh_token.clone());
                match (client, refresh_token) {
                    (Some(client), Some(refresh_token)) => {
                        log::info!("Calendar: refreshing expired OAuth access token");
                        let token = client.refresh(&self.http, &refresh_token).await?;
                        CachedToken {
                            access_token: token.access_token,
                            refresh_token: token.refresh_token,
                            expires_at: token.expires_at,
                        }
                    }
                    _ => {
                        return Err(CalendarError::Auth(
                            "access token expired and cannot be refreshed; sign in again".into(),
                        ))
                    }
                }
            }
        };

        let access_token = fresh.access_token.clone();
        *cache = Some(fresh);
        Ok(access_token)
    }

    async fn service_account_token(&self, key: &ServiceAccountKey, now: i64) -> Result<CachedToken, CalendarError> {
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: CALENDAR_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| CalendarError::Auth(format!("invalid service account key: {}", e)))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| CalendarError::Auth(format!("failed to sign assertion: {}", e)))?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CalendarError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let token: AssertionTokenResponse = response.json().await?;
        log::debug!("Calendar: obtained service account token");
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_token: None,
            expires_at: Some(now.saturating_add(token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS))),
        })
    }
}
