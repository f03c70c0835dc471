#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sharehub_contracts::identity::{AuthProviderKind, ProfilePatch};
use tokio::sync::broadcast;

use crate::identity_provider::{
    AuthEvent, AvatarUpload, IdentityProvider, ProfileRecord, ProviderError, RemoteSession,
    SignUpMetadata, AUTH_EVENT_CHANNEL_CAPACITY,
};

const SALT_LEN: usize = 16;
pub const LOCAL_AVATAR_BASE_URL: &str = "memory://avatars";

#[derive(Debug, Clone)]
struct LocalAccount {
    user_id: String,
    email: String,
    salt: [u8; SALT_LEN],
    password_digest: [u8; 32],
}

#[derive(Debug, Default)]
struct LocalState {
    // keyed by lower-cased email
    accounts: BTreeMap<String, LocalAccount>,
    profiles: BTreeMap<String, ProfileRecord>,
    avatars: BTreeMap<String, Vec<u8>>,
    current: Option<RemoteSession>,
}

/// In-process account repository for offline use and tests. Owned by whoever builds
/// the client core; nothing here is process-global.
#[derive(Debug)]
pub struct LocalAccountRepository {
    state: Mutex<LocalState>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for LocalAccountRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn password_digest(salt: &[u8; SALT_LEN], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl LocalAccountRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(AUTH_EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(LocalState::default()),
            events,
        }
    }

    pub fn account_count(&self) -> usize {
        self.lock().accounts.len()
    }

    /// Bytes stored for a URL previously returned by `upload_avatar`.
    pub fn avatar_bytes(&self, url: &str) -> Option<Vec<u8>> {
        self.lock().avatars.get(url).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    fn session_for(account: &LocalAccount, profile: Option<&ProfileRecord>) -> RemoteSession {
        RemoteSession {
            user_id: account.user_id.clone(),
            email: account.email.clone(),
            access_token: None,
            name: profile.and_then(|p| p.name.clone()),
            avatar: profile.and_then(|p| p.avatar_url.clone()),
            provider: AuthProviderKind::Email,
        }
    }
}

#[async_trait]
impl IdentityProvider for LocalAccountRepository {
    fn label(&self) -> &'static str {
        "local"
    }

    async fn get_session(&self) -> Result<Option<RemoteSession>, ProviderError> {
        Ok(self.lock().current.clone())
    }

    async fn get_user_profile(
        &self,
        user_id: &str,
    ) -> Result<Option<ProfileRecord>, ProviderError> {
        Ok(self.lock().profiles.get(user_id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<RemoteSession, ProviderError> {
        let session = {
            let mut state = self.lock();
            let account = state
                .accounts
                .get(&normalize_email(email))
                .cloned()
                .ok_or(ProviderError::InvalidCredentials)?;
            if password_digest(&account.salt, password) != account.password_digest {
                return Err(ProviderError::InvalidCredentials);
            }
            let session = Self::session_for(&account, state.profiles.get(&account.user_id));
            state.current = Some(session.clone());
            session
        };
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<RemoteSession, ProviderError> {
        let session = {
            let mut state = self.lock();
            let key = normalize_email(email);
            if state.accounts.contains_key(&key) {
                return Err(ProviderError::UserAlreadyExists);
            }
            let mut salt = [0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            let account = LocalAccount {
                user_id: format!("email_{}", uuid::Uuid::new_v4().simple()),
                email: email.trim().to_string(),
                salt,
                password_digest: password_digest(&salt, password),
            };
            let profile = ProfileRecord {
                id: account.user_id.clone(),
                name: Some(metadata.name),
                email: Some(account.email.clone()),
                avatar_url: None,
            };
            let session = Self::session_for(&account, Some(&profile));
            state.profiles.insert(account.user_id.clone(), profile);
            state.accounts.insert(key, account);
            state.current = Some(session.clone());
            session
        };
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.lock().current = None;
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: &str,
        patch: &ProfilePatch,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        let profile = state
            .profiles
            .get_mut(user_id)
            .ok_or(ProviderError::NotFound)?;
        if let Some(name) = &patch.name {
            profile.name = Some(name.clone());
        }
        if let Some(avatar) = &patch.avatar {
            profile.avatar_url = Some(avatar.clone());
        }
        Ok(())
    }

    async fn upload_avatar(
        &self,
        user_id: &str,
        upload: &AvatarUpload,
    ) -> Result<String, ProviderError> {
        let mut state = self.lock();
        if !state.profiles.contains_key(user_id) {
            return Err(ProviderError::NotFound);
        }
        let digest = Sha256::digest(&upload.bytes);
        let extension = upload
            .file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string());
        let url = format!(
            "{LOCAL_AVATAR_BASE_URL}/{user_id}/{}.{extension}",
            &hex(&digest)[..16]
        );
        state.avatars.insert(url.clone(), upload.bytes.clone());
        Ok(url)
    }
}
