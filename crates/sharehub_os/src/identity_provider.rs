#![forbid(unsafe_code)]

use async_trait::async_trait;
use sharehub_contracts::identity::{AuthProviderKind, ProfilePatch};
use tokio::sync::broadcast;

pub const AUTH_EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("user already exists with this email")]
    UserAlreadyExists,
    #[error("password rejected by provider: {0}")]
    WeakPassword(String),
    #[error("record not found")]
    NotFound,
    #[error("provider rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// What the remote provider knows about the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub user_id: String,
    pub email: String,
    pub access_token: Option<String>,
    /// Display name from account metadata, if the provider keeps one.
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub provider: AuthProviderKind,
}

/// Row of the provider's profile table.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProfileRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(RemoteSession),
    UserUpdated(RemoteSession),
    SignedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUpMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AvatarUpload {
    pub fn is_image(&self) -> bool {
        self.content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("image/")
    }
}

/// Remote identity/session service treated as the source of truth for who is signed in.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short label used when tagging error reports.
    fn label(&self) -> &'static str;

    async fn get_session(&self) -> Result<Option<RemoteSession>, ProviderError>;

    async fn get_user_profile(&self, user_id: &str)
        -> Result<Option<ProfileRecord>, ProviderError>;

    /// Sign-in state changes, in the order the provider observed them.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteSession, ProviderError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<RemoteSession, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    async fn update_profile(&self, user_id: &str, patch: &ProfilePatch)
        -> Result<(), ProviderError>;

    /// Stores the file and returns a publicly resolvable URL for it.
    async fn upload_avatar(
        &self,
        user_id: &str,
        upload: &AvatarUpload,
    ) -> Result<String, ProviderError>;
}

/// Client library for the federated (remote identity provider) sign-in prompt.
#[async_trait]
pub trait FederatedSignIn: Send + Sync {
    fn is_loaded(&self) -> bool;

    /// Shows the provider's prompt. The credential comes back separately through
    /// `SessionBootstrapper::accept_federated_credential`.
    async fn prompt(&self) -> Result<(), ProviderError>;
}
