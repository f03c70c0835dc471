#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sharehub_contracts::identity::{AuthProviderKind, ProfilePatch};
use sharehub_contracts::UnixTimeMs;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use crate::error_reporter::ErrorReporter;
use crate::identity_provider::{
    AuthEvent, AvatarUpload, IdentityProvider, ProfileRecord, ProviderError, RemoteSession,
    SignUpMetadata, AUTH_EVENT_CHANNEL_CAPACITY,
};

pub const HTTP_TIMEOUT_MS_DEFAULT: u64 = 15_000;
pub const AVATAR_BUCKET: &str = "avatars";

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub anon_key: String,
    pub timeout_ms: u64,
}

impl HttpProviderConfig {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            anon_key: anon_key.into(),
            timeout_ms: HTTP_TIMEOUT_MS_DEFAULT,
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    agent: ureq::Agent,
    base: Url,
    anon_key: String,
}

/// Identity provider backed by a hosted auth + REST + object storage service.
///
/// Requests are blocking `ureq` calls moved onto tokio's blocking pool.
pub struct HttpIdentityProvider {
    endpoint: Endpoint,
    session: Mutex<Option<RemoteSession>>,
    events: broadcast::Sender<AuthEvent>,
    reporter: Option<ErrorReporter>,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpIdentityProvider")
            .field("base", &self.endpoint.base.as_str())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
struct UserMetadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppMetadata {
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: UserMetadata,
    #[serde(default)]
    app_metadata: AppMetadata,
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    #[serde(default)]
    access_token: Option<String>,
    user: UserPayload,
}

fn remote_session(user: UserPayload, access_token: Option<String>) -> RemoteSession {
    let provider = match user.app_metadata.provider.as_deref() {
        Some("google") => AuthProviderKind::Google,
        _ => AuthProviderKind::Email,
    };
    let meta = user.user_metadata;
    RemoteSession {
        user_id: user.id,
        email: user.email.unwrap_or_default(),
        access_token,
        name: meta.name.or(meta.full_name),
        avatar: meta.avatar_url.or(meta.picture),
        provider,
    }
}

/// Sign-up answers with `{access_token, user}` when the session starts right away,
/// or with the bare user when the account still needs confirming.
fn parse_sign_up_body(body: Value) -> Result<RemoteSession, ProviderError> {
    if body.get("user").is_some() {
        let payload: TokenPayload = serde_json::from_value(body).map_err(bad_body)?;
        return Ok(remote_session(payload.user, payload.access_token));
    }
    let user: UserPayload = serde_json::from_value(body).map_err(bad_body)?;
    Ok(remote_session(user, None))
}

fn bad_body(err: serde_json::Error) -> ProviderError {
    ProviderError::Transport(format!("unreadable response body: {err}"))
}

/// Maps a non-2xx answer onto the provider error the session layer understands.
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let field = |name: &str| parsed.get(name).and_then(Value::as_str).map(str::to_string);
    let code = field("error").or_else(|| field("error_code")).unwrap_or_default();
    let message = field("error_description")
        .or_else(|| field("msg"))
        .or_else(|| field("message"))
        .unwrap_or_else(|| body.trim().chars().take(200).collect());
    let lower = message.to_ascii_lowercase();
    match status {
        400 if code == "invalid_grant" || lower.contains("invalid login credentials") => {
            ProviderError::InvalidCredentials
        }
        _ if code == "user_already_exists"
            || code == "email_exists"
            || lower.contains("already registered") =>
        {
            ProviderError::UserAlreadyExists
        }
        _ if code == "weak_password" => ProviderError::WeakPassword(message),
        404 => ProviderError::NotFound,
        _ => ProviderError::Rejected { status, message },
    }
}

fn provider_error_from_ureq(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            classify_status(status, &body)
        }
        ureq::Error::Transport(transport) => ProviderError::Transport(transport.to_string()),
    }
}

fn normalized_base(raw: &str) -> Result<Url, ProviderError> {
    let mut base = Url::parse(raw.trim())
        .map_err(|err| ProviderError::Unavailable(format!("invalid backend url: {err}")))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(ProviderError::Unavailable(format!(
            "unsupported backend url scheme: {}",
            base.scheme()
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn avatar_object_name(upload: &AvatarUpload, now: UnixTimeMs) -> String {
    let extension = upload
        .file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());
    format!("{}.{extension}", now.0)
}

impl Endpoint {
    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        self.base
            .join(path)
            .map_err(|err| ProviderError::Unavailable(format!("invalid endpoint {path}: {err}")))
    }

    fn request(&self, method: &str, url: &Url, bearer: Option<&str>) -> ureq::Request {
        let token = bearer.unwrap_or(&self.anon_key);
        self.agent
            .request(method, url.as_str())
            .set("apikey", &self.anon_key)
            .set("authorization", &format!("Bearer {token}"))
            .set("accept", "application/json")
    }
}

async fn blocking<T, F>(call: F) -> Result<T, ProviderError>
where
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| ProviderError::Unavailable(format!("request task failed: {err}")))?
}

impl HttpIdentityProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        if config.anon_key.trim().is_empty() {
            return Err(ProviderError::Unavailable(
                "backend anon key is empty".to_string(),
            ));
        }
        let base = normalized_base(&config.base_url)?;
        let timeout = Duration::from_millis(config.timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(&crate::error_reporter::default_user_agent())
            .build();
        let (events, _) = broadcast::channel(AUTH_EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            endpoint: Endpoint {
                agent,
                base,
                anon_key: config.anon_key,
            },
            session: Mutex::new(None),
            events,
            reporter: None,
        })
    }

    /// Transport failures are additionally recorded as network errors.
    pub fn with_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn public_avatar_url(&self, object_path: &str) -> Result<String, ProviderError> {
        self.endpoint
            .url(&format!("storage/v1/object/public/{AVATAR_BUCKET}/{object_path}"))
            .map(String::from)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<RemoteSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn access_token(&self) -> Option<String> {
        self.lock_session()
            .as_ref()
            .and_then(|s| s.access_token.clone())
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.events.send(event);
    }

    fn observe(&self, url: &Url, result: Result<Value, ProviderError>) -> Result<Value, ProviderError> {
        if let (Err(err @ ProviderError::Transport(_)), Some(reporter)) = (&result, &self.reporter) {
            reporter.report_network_error(url.as_str(), err);
        }
        result
    }

    async fn call(
        &self,
        method: &'static str,
        url: Url,
        bearer: Option<String>,
        body: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let endpoint = self.endpoint.clone();
        let target = url.clone();
        debug!(method, url = %url, "backend request");
        let result = blocking(move || {
            let request = endpoint.request(method, &target, bearer.as_deref());
            let response = match body {
                Some(body) => request.send_json(body),
                None => request.call(),
            }
            .map_err(provider_error_from_ureq)?;
            let text = response
                .into_string()
                .map_err(|err| ProviderError::Transport(format!("response read failed: {err}")))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(bad_body)
        })
        .await;
        self.observe(&url, result)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn label(&self) -> &'static str {
        "hosted"
    }

    async fn get_session(&self) -> Result<Option<RemoteSession>, ProviderError> {
        let Some(token) = self.access_token() else {
            return Ok(None);
        };
        let url = self.endpoint.url("auth/v1/user")?;
        match self.call("GET", url, Some(token.clone()), None).await {
            Ok(body) => {
                let user: UserPayload = serde_json::from_value(body).map_err(bad_body)?;
                let session = remote_session(user, Some(token));
                *self.lock_session() = Some(session.clone());
                Ok(Some(session))
            }
            Err(ProviderError::Rejected { status: 401, .. }) => {
                warn!("stored access token rejected; session dropped");
                *self.lock_session() = None;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn get_user_profile(
        &self,
        user_id: &str,
    ) -> Result<Option<ProfileRecord>, ProviderError> {
        let mut url = self.endpoint.url("rest/v1/profiles")?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{user_id}"))
            .append_pair("select", "*");
        let body = self.call("GET", url, self.access_token(), None).await?;
        let rows: Vec<ProfileRecord> = serde_json::from_value(body).map_err(bad_body)?;
        Ok(rows.into_iter().next())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteSession, ProviderError> {
        let mut url = self.endpoint.url("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let body = json!({ "email": email.trim(), "password": password });
        let response = self.call("POST", url, None, Some(body)).await?;
        let payload: TokenPayload = serde_json::from_value(response).map_err(bad_body)?;
        let session = remote_session(payload.user, payload.access_token);
        *self.lock_session() = Some(session.clone());
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<RemoteSession, ProviderError> {
        let url = self.endpoint.url("auth/v1/signup")?;
        let body = json!({
            "email": email.trim(),
            "password": password,
            "data": { "name": metadata.name },
        });
        let response = self.call("POST", url, None, Some(body)).await?;
        let session = parse_sign_up_body(response)?;
        if session.access_token.is_some() {
            *self.lock_session() = Some(session.clone());
            self.emit(AuthEvent::SignedIn(session.clone()));
        }
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let token = self.lock_session().take().and_then(|s| s.access_token);
        self.emit(AuthEvent::SignedOut);
        let Some(token) = token else {
            return Ok(());
        };
        let url = self.endpoint.url("auth/v1/logout")?;
        self.call("POST", url, Some(token), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn update_profile(
        &self,
        user_id: &str,
        patch: &ProfilePatch,
    ) -> Result<(), ProviderError> {
        let mut url = self.endpoint.url("rest/v1/profiles")?;
        url.query_pairs_mut()
            .append_pair("id", &format!("eq.{user_id}"));
        let mut body = serde_json::Map::new();
        if let Some(name) = &patch.name {
            body.insert("name".to_string(), Value::String(name.clone()));
        }
        if let Some(avatar) = &patch.avatar {
            body.insert("avatar_url".to_string(), Value::String(avatar.clone()));
        }
        self.call("PATCH", url, self.access_token(), Some(Value::Object(body)))
            .await
            .map(|_| ())
    }

    async fn upload_avatar(
        &self,
        user_id: &str,
        upload: &AvatarUpload,
    ) -> Result<String, ProviderError> {
        let object_path = format!("{user_id}/{}", avatar_object_name(upload, UnixTimeMs::now()));
        let url = self
            .endpoint
            .url(&format!("storage/v1/object/{AVATAR_BUCKET}/{object_path}"))?;
        let endpoint = self.endpoint.clone();
        let bearer = self.access_token();
        let content_type = upload.content_type.clone();
        let bytes = upload.bytes.clone();
        let target = url.clone();
        let result = blocking(move || {
            endpoint
                .request("POST", &target, bearer.as_deref())
                .set("content-type", &content_type)
                .set("x-upsert", "true")
                .send_bytes(&bytes)
                .map(|_| Value::Null)
                .map_err(provider_error_from_ureq)
        })
        .await;
        self.observe(&url, result)?;
        self.public_avatar_url(&object_path)
    }
}
