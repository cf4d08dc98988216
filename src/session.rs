//! Authentication against the Agua IOT cloud.
//!
//! A [`SessionManager`] owns the bearer token of one account. Every
//! authenticated call goes through [`SessionManager::call`], which logs in on
//! first use, refreshes the token once it is past its `exp` claim and retries a
//! call exactly once after a `401`. Refreshes are serialized on the session
//! lock, so concurrent callers hitting an expired token trigger one refresh.

use crate::api::{
    self, AppSignupRequest, LoginRequest, LoginResponse, RefreshRequest, RefreshResponse,
};
use crate::config::ClientConfig;
use crate::transport::{Clock, HttpRequest, HttpResponse, Method, Transport};
use crate::{Error, Result};
use base64::prelude::*;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

const STATUS_OK: u16 = 200;
const STATUS_CREATED: u16 = 201;
const STATUS_UNAUTHORIZED: u16 = 401;

#[derive(Default)]
struct Session {
    token: Option<String>,
    /// `exp` claim of `token` in epoch seconds.
    token_expires: Option<i64>,
    refresh_token: Option<String>,
    /// Bumped whenever `token` changes.
    generation: u64,
}

pub struct SessionManager {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    session: Mutex<Session>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("api_url", &self.config.api_url)
            .field("email", &self.config.email)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            transport,
            clock,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Absolute URL of an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url())
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("Accept".to_string(), api::HEADER_ACCEPT.to_string()),
            ("Content-Type".to_string(), api::HEADER_CONTENT_TYPE.to_string()),
            ("Origin".to_string(), api::HEADER_ORIGIN.to_string()),
            (
                "id_brand".to_string(),
                self.config
                    .brand_id
                    .clone()
                    .unwrap_or_else(|| api::DEFAULT_BRAND_ID.to_string()),
            ),
            ("customer_code".to_string(), self.config.customer_code.clone()),
        ];
        if let Some(brand) = &self.config.brand {
            headers.push(("brand".to_string(), brand.clone()));
        }
        headers
    }

    async fn post<P: Serialize>(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
        payload: &P,
    ) -> Result<HttpResponse> {
        self.transport
            .send(HttpRequest {
                method: Method::Post,
                url: url.to_string(),
                headers,
                body: Some(to_body(payload)?),
            })
            .await
    }

    /// Registers the app identity. Required once before [`login`](Self::login).
    pub async fn register_app_id(&self) -> Result<()> {
        let url = self.url(api::API_PATH_APP_SIGNUP);
        let payload = AppSignupRequest::new(&self.config.unique_id);
        debug!("POST Register app - URL: {url} DATA: {payload:?}");
        let response = self.post(&url, self.headers(), &payload).await?;
        debug!(
            "RESPONSE Register app - CODE: {} DATA: {}",
            response.status, response.body
        );
        if response.status != STATUS_CREATED {
            error!(
                "Failed to register app id. Code: {}, Response: {}",
                response.status, response.body
            );
            return Err(Error::Unauthorized(format!(
                "Failed to register app id at {url}"
            )));
        }
        Ok(())
    }

    /// Logs in with the configured email and password.
    pub async fn login(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.login_locked(&mut session).await
    }

    /// Rotates the token, falling back to a new login if the cloud refuses.
    pub async fn refresh(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.refresh_locked(&mut session).await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.lock().await.token.is_some()
    }

    async fn login_locked(&self, session: &mut Session) -> Result<()> {
        let mut url = self.url(api::API_PATH_LOGIN);
        let mut headers = self.headers();
        headers.push(("local".to_string(), "true".to_string()));
        headers.push(("Authorization".to_string(), self.config.unique_id.clone()));
        if let Some(login_api_url) = &self.config.login_api_url {
            headers.extend([
                (
                    "applicationversion".to_string(),
                    self.config.application_version.clone(),
                ),
                (
                    "url".to_string(),
                    api::API_PATH_LOGIN.trim_start_matches('/').to_string(),
                ),
                ("userid".to_string(), "null".to_string()),
                ("aguaid".to_string(), "null".to_string()),
            ]);
            url = login_api_url.clone();
        }

        let payload = LoginRequest {
            email: &self.config.email,
            password: &self.config.password,
        };
        debug!("POST Login - URL: {url} DATA: ***");
        let response = self.post(&url, headers, &payload).await?;
        debug!("RESPONSE Login - CODE: {}", response.status);
        if response.status != STATUS_OK {
            error!(
                "Failed to login. Code: {}, Response: {}",
                response.status, response.body
            );
            return Err(Error::Unauthorized(format!(
                "Failed to login at {url}, please check credentials"
            )));
        }

        let tokens: LoginResponse = response.json(&url)?;
        session.token_expires = token_expiry(&tokens.token, &url)?;
        session.token = Some(tokens.token);
        session.refresh_token = Some(tokens.refresh_token);
        session.generation += 1;
        Ok(())
    }

    async fn refresh_locked(&self, session: &mut Session) -> Result<()> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            return self.login_locked(session).await;
        };
        let url = self.url(api::API_PATH_REFRESH_TOKEN);
        debug!("POST Refresh token - URL: {url} DATA: ***");
        let response = self
            .post(
                &url,
                self.headers(),
                &RefreshRequest {
                    refresh_token: &refresh_token,
                },
            )
            .await?;
        debug!("RESPONSE Refresh token - CODE: {}", response.status);
        if response.status != STATUS_CREATED {
            warn!(
                "Refresh auth token failed with status {}, forcing new login...",
                response.status
            );
            return self.login_locked(session).await;
        }

        let refreshed: RefreshResponse = response.json(&url)?;
        session.token_expires = token_expiry(&refreshed.token, &url)?;
        session.token = Some(refreshed.token);
        session.generation += 1;
        Ok(())
    }

    /// Current token, logging in or refreshing first when needed.
    async fn valid_token(&self) -> Result<(String, u64)> {
        let mut session = self.session.lock().await;
        if session.token.is_none() {
            self.login_locked(&mut session).await?;
        } else if let Some(expires) = session
            .token_expires
            .filter(|expires| self.clock.now() > *expires)
        {
            debug!("Token expired at {expires}, refreshing");
            self.refresh_locked(&mut session).await?;
        }
        current_token(&session)
    }

    /// Refreshes after a `401`, unless another caller already replaced the
    /// token the rejected request was sent with.
    async fn token_after_unauthorized(&self, rejected: u64) -> Result<String> {
        let mut session = self.session.lock().await;
        if session.generation == rejected {
            self.refresh_locked(&mut session).await?;
        }
        current_token(&session).map(|(token, _)| token)
    }

    async fn send_authenticated(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
        token: String,
    ) -> Result<HttpResponse> {
        let mut headers = self.headers();
        headers.push(("local".to_string(), "false".to_string()));
        headers.push(("Authorization".to_string(), token));
        debug!("{method} {url} - DATA: {body}");
        let response = self
            .transport
            .send(HttpRequest {
                method,
                url: url.to_string(),
                headers,
                body: (method == Method::Post).then(|| body.clone()),
            })
            .await?;
        debug!(
            "RESPONSE {url} - CODE: {} DATA: {}",
            response.status, response.body
        );
        Ok(response)
    }

    /// Sends an authenticated request to `path` and parses the `200` answer.
    ///
    /// A `401` triggers one token refresh and one retry; a second `401` is an
    /// [`Error::Unauthorized`]. Any other non-`200` status is an
    /// [`Error::Protocol`] naming the URL.
    pub async fn call<P, T>(&self, method: Method, path: &str, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let body = to_body(payload)?;
        let (token, generation) = self.valid_token().await?;
        let mut response = self.send_authenticated(method, &url, &body, token).await?;
        if response.status == STATUS_UNAUTHORIZED {
            debug!("Unauthorized answer from {url}, refreshing token");
            let token = self.token_after_unauthorized(generation).await?;
            response = self.send_authenticated(method, &url, &body, token).await?;
            if response.status == STATUS_UNAUTHORIZED {
                return Err(Error::Unauthorized(format!(
                    "{url} still unauthorized after token refresh"
                )));
            }
        }
        if response.status != STATUS_OK {
            error!(
                "Webcall failed. Code: {}, Response: {}",
                response.status, response.body
            );
            return Err(Error::Protocol(format!(
                "Webcall to {url} failed with status {}",
                response.status
            )));
        }
        response.json(&url)
    }
}

fn to_body<P: Serialize + ?Sized>(payload: &P) -> Result<serde_json::Value> {
    serde_json::to_value(payload)
        .map_err(|err| Error::Protocol(format!("Cannot encode request body: {err}")))
}

fn current_token(session: &Session) -> Result<(String, u64)> {
    session
        .token
        .clone()
        .map(|token| (token, session.generation))
        .ok_or_else(|| Error::Unauthorized("No session token".into()))
}

/// Reads the `exp` claim of a JWT without verifying its signature.
///
/// A token without `exp` never expires proactively.
fn token_expiry(token: &str, url: &str) -> Result<Option<i64>> {
    let invalid = |what: &str| Error::Protocol(format!("Invalid token from {url}: {what}"));
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| invalid("not a JWT"))?;
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| invalid("payload encoding"))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| invalid("payload JSON"))?;
    Ok(claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))))
}
