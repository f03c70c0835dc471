#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use sharehub_contracts::identity::{
    fallback_display_name, AuthProviderKind, ProfilePatch, SessionIdentity,
};
use sharehub_contracts::{ContractViolation, Validate};
use sharehub_storage::{BoundedStore, StorageFault};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::configured_client_id;
use crate::credential::{decode_federated_credential, CredentialError};
use crate::error_reporter::ErrorReporter;
use crate::identity_provider::{
    AuthEvent, AvatarUpload, FederatedSignIn, IdentityProvider, ProviderError, RemoteSession,
    SignUpMetadata,
};

pub const SESSION_USER_KEY: &str = "user";
pub const MIN_PASSWORD_LEN: usize = 6;
pub const AVATAR_MAX_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("remote sign-in is not configured: set SHAREHUB_GOOGLE_CLIENT_ID")]
    ProviderNotConfigured,
    #[error("remote sign-in client is not loaded")]
    ProviderUnavailable,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("user already exists with this email")]
    UserAlreadyExists,
    #[error("password must be at least {min_len} characters")]
    WeakPassword { min_len: usize },
    #[error("no user signed in")]
    NotAuthenticated,
    #[error("file is not an image: {content_type}")]
    InvalidFileType { content_type: String },
    #[error("image is {size} bytes; limit is {limit}")]
    FileTooLarge { size: usize, limit: usize },
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ContractViolation),
    #[error("federated credential rejected: {0}")]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredentials => AuthError::InvalidCredentials,
            ProviderError::UserAlreadyExists => AuthError::UserAlreadyExists,
            ProviderError::WeakPassword(_) => AuthError::WeakPassword {
                min_len: MIN_PASSWORD_LEN,
            },
            other => AuthError::Provider(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Authenticated,
    /// Restored from the local cache without a fresh remote confirmation.
    AuthenticatedCached,
    Anonymous,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::AuthenticatedCached => "authenticated_cached",
            SessionPhase::Anonymous => "anonymous",
        }
    }
}

/// What the UI layer reads: the current identity and whether work is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub identity: Option<SessionIdentity>,
    pub loading: bool,
    /// Bumped on every publish.
    pub revision: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub google_client_id: Option<String>,
}

#[derive(Debug)]
struct SessionCore {
    // Bumped when an event or local operation arrives; stale lookups compare against it.
    epoch: u64,
    phase: SessionPhase,
    identity: Option<SessionIdentity>,
    pending_ops: usize,
    revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheAction {
    Keep,
    Write,
    Remove,
}

struct Shared {
    config: SessionConfig,
    provider: Arc<dyn IdentityProvider>,
    federated: RwLock<Option<Arc<dyn FederatedSignIn>>>,
    store: Arc<BoundedStore>,
    reporter: ErrorReporter,
    core: Mutex<SessionCore>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

/// Resolves who is signed in at startup and keeps that answer current as sign-in
/// events arrive. The remote provider is authoritative; the `user` cache entry is a
/// mirror used when the provider cannot answer.
pub struct SessionBootstrapper {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBootstrapper")
            .field("provider", &self.shared.provider.label())
            .field("snapshot", &*self.shared.snapshot_tx.borrow())
            .finish_non_exhaustive()
    }
}

struct LoadingGuard<'a> {
    shared: &'a Shared,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut core = self.shared.core();
        core.pending_ops = core.pending_ops.saturating_sub(1);
        self.shared.publish(&mut core);
    }
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, core: &mut SessionCore) {
        core.revision += 1;
        self.snapshot_tx.send_replace(SessionSnapshot {
            phase: core.phase,
            identity: core.identity.clone(),
            loading: core.pending_ops > 0 || core.phase == SessionPhase::Uninitialized,
            revision: core.revision,
        });
    }

    fn begin_op(&self) -> LoadingGuard<'_> {
        let mut core = self.core();
        core.pending_ops += 1;
        self.publish(&mut core);
        LoadingGuard { shared: self }
    }

    fn current_epoch(&self) -> u64 {
        self.core().epoch
    }

    fn advance_epoch(&self) -> u64 {
        let mut core = self.core();
        core.epoch += 1;
        core.epoch
    }

    /// Applies a state change. With `expected_epoch` the change is dropped when a
    /// newer event arrived meanwhile; without it the change is itself a new event.
    fn commit(
        &self,
        expected_epoch: Option<u64>,
        phase: SessionPhase,
        identity: Option<SessionIdentity>,
        cache: CacheAction,
    ) -> bool {
        let fault = {
            let mut core = self.core();
            match expected_epoch {
                Some(expected) if core.epoch != expected => {
                    debug!(
                        expected,
                        current = core.epoch,
                        phase = phase.as_str(),
                        "stale session result discarded"
                    );
                    return false;
                }
                Some(_) => {}
                None => core.epoch += 1,
            }
            let fault = self.sync_cache(identity.as_ref(), cache);
            core.phase = phase;
            core.identity = identity;
            self.publish(&mut core);
            info!(
                phase = phase.as_str(),
                user_id = core.identity.as_ref().map(|i| i.id.as_str()).unwrap_or("-"),
                "session state changed"
            );
            fault
        };
        if let Some((operation, fault)) = fault {
            self.reporter.report_storage_error(operation, &fault);
        }
        true
    }

    fn sync_cache(
        &self,
        identity: Option<&SessionIdentity>,
        cache: CacheAction,
    ) -> Option<(&'static str, StorageFault)> {
        let (operation, ok) = match (cache, identity) {
            (CacheAction::Keep, _) => return None,
            (CacheAction::Write, Some(identity)) => {
                ("set_item", self.store.set_item(SESSION_USER_KEY, identity))
            }
            (CacheAction::Write, None) | (CacheAction::Remove, _) => {
                ("remove_item", self.store.remove_item(SESSION_USER_KEY))
            }
        };
        if ok {
            return None;
        }
        match self.store.take_last_fault() {
            Some(fault) => Some((operation, fault)),
            None => {
                warn!(operation, "session cache update failed without a recorded fault");
                None
            }
        }
    }

    async fn resolve_identity(
        &self,
        session: &RemoteSession,
    ) -> Result<SessionIdentity, ContractViolation> {
        let profile = match self.provider.get_user_profile(&session.user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(user_id = %session.user_id, error = %err, "profile fetch failed; using session fields");
                self.reporter
                    .report_auth_error(self.provider.label(), &AuthError::from(err));
                None
            }
        };
        let non_blank = |v: &Option<String>| v.as_ref().filter(|s| !s.trim().is_empty()).cloned();
        let name = profile
            .as_ref()
            .and_then(|p| non_blank(&p.name))
            .or_else(|| non_blank(&session.name))
            .unwrap_or_else(|| fallback_display_name(&session.email));
        let avatar = profile
            .as_ref()
            .and_then(|p| non_blank(&p.avatar_url))
            .or_else(|| non_blank(&session.avatar));
        SessionIdentity::v1(
            session.user_id.clone(),
            name,
            session.email.clone(),
            avatar,
            session.provider,
        )
    }

    async fn apply_event(&self, event: AuthEvent) {
        let epoch = self.advance_epoch();
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::UserUpdated(session) => {
                match self.resolve_identity(&session).await {
                    Ok(identity) => {
                        self.commit(
                            Some(epoch),
                            SessionPhase::Authenticated,
                            Some(identity),
                            CacheAction::Write,
                        );
                    }
                    Err(violation) => {
                        warn!(user_id = %session.user_id, error = %violation, "unusable identity in auth event");
                        self.reporter.report_auth_error(
                            self.provider.label(),
                            &AuthError::InvalidInput(violation),
                        );
                        // This arrival already outdated the startup lookup, so
                        // startup's cache fallback is finished here instead.
                        if self.core().phase == SessionPhase::Uninitialized {
                            self.restore_cached(epoch);
                        }
                    }
                }
            }
            AuthEvent::SignedOut => {
                self.commit(
                    Some(epoch),
                    SessionPhase::Anonymous,
                    None,
                    CacheAction::Remove,
                );
            }
        }
    }

    fn restore_cached(&self, epoch: u64) {
        // Only faults raised by the read below are attributed to the cache.
        self.store.take_last_fault();
        if let Some(identity) = self.store.get_record::<SessionIdentity>(SESSION_USER_KEY) {
            self.commit(
                Some(epoch),
                SessionPhase::AuthenticatedCached,
                Some(identity),
                CacheAction::Keep,
            );
            return;
        }
        match self.store.take_last_fault() {
            Some(fault @ (StorageFault::Corrupt { .. } | StorageFault::InvalidRecord { .. })) => {
                self.reporter.report_storage_error("get_item", &fault);
                self.commit(Some(epoch), SessionPhase::Anonymous, None, CacheAction::Remove);
            }
            Some(fault) => {
                self.reporter.report_storage_error("get_item", &fault);
                self.commit(Some(epoch), SessionPhase::Anonymous, None, CacheAction::Keep);
            }
            None => {
                self.commit(Some(epoch), SessionPhase::Anonymous, None, CacheAction::Keep);
            }
        }
    }

    fn fail(&self, label: &str, err: AuthError) -> AuthError {
        self.reporter.report_auth_error(label, &err);
        err
    }
}

async fn listen(shared: Arc<Shared>, mut events: broadcast::Receiver<AuthEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => shared.apply_event(event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("auth event stream closed");
                break;
            }
        }
    }
}

impl SessionBootstrapper {
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<BoundedStore>,
        reporter: ErrorReporter,
    ) -> Self {
        let core = SessionCore {
            epoch: 0,
            phase: SessionPhase::Uninitialized,
            identity: None,
            pending_ops: 0,
            revision: 0,
        };
        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            phase: core.phase,
            identity: None,
            loading: true,
            revision: 0,
        });
        Self {
            shared: Arc::new(Shared {
                config,
                provider,
                federated: RwLock::new(None),
                store,
                reporter,
                core: Mutex::new(core),
                snapshot_tx,
            }),
            listener: Mutex::new(None),
        }
    }

    /// Attaches the federated sign-in client once its library has loaded.
    pub fn attach_federated(&self, client: Arc<dyn FederatedSignIn>) {
        match self.shared.federated.write() {
            Ok(mut slot) => *slot = Some(client),
            Err(poisoned) => *poisoned.into_inner() = Some(client),
        }
    }

    pub fn current(&self) -> SessionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Subscribes to provider events, then resolves the startup session. Calling it
    /// again after the first start only returns the current snapshot.
    pub async fn start(&self) -> SessionSnapshot {
        {
            let mut listener = self
                .listener
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if listener.is_some() {
                return self.current();
            }
            let events = self.shared.provider.subscribe();
            *listener = Some(tokio::spawn(listen(Arc::clone(&self.shared), events)));
        }

        let shared = &self.shared;
        let epoch = shared.current_epoch();
        let session = match shared.provider.get_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "remote session lookup failed; trying cache");
                shared.reporter.report_auth_error(shared.provider.label(), &AuthError::from(err));
                None
            }
        };
        match session {
            Some(session) => match shared.resolve_identity(&session).await {
                Ok(identity) => {
                    shared.commit(
                        Some(epoch),
                        SessionPhase::Authenticated,
                        Some(identity),
                        CacheAction::Write,
                    );
                }
                Err(violation) => {
                    shared.reporter.report_auth_error(
                        shared.provider.label(),
                        &AuthError::InvalidInput(violation),
                    );
                    shared.restore_cached(epoch);
                }
            },
            None => shared.restore_cached(epoch),
        }
        self.current()
    }

    /// Stops following provider events. The published snapshot stays as it was.
    pub fn shutdown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Opens the federated prompt. The identity arrives later through
    /// `accept_federated_credential`.
    pub async fn sign_in_with_remote_provider(&self) -> Result<(), AuthError> {
        let label = AuthProviderKind::Google.as_str();
        let shared = &self.shared;
        if configured_client_id(shared.config.google_client_id.as_deref()).is_none() {
            return Err(shared.fail(label, AuthError::ProviderNotConfigured));
        }
        let client = match shared.federated.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let client = match client {
            Some(client) if client.is_loaded() => client,
            _ => return Err(shared.fail(label, AuthError::ProviderUnavailable)),
        };
        let _loading = shared.begin_op();
        client
            .prompt()
            .await
            .map_err(|err| shared.fail(label, err.into()))
    }

    pub async fn accept_federated_credential(
        &self,
        credential: &str,
    ) -> Result<SessionIdentity, AuthError> {
        let shared = &self.shared;
        let identity = decode_federated_credential(credential)
            .map_err(|err| shared.fail(AuthProviderKind::Google.as_str(), err.into()))?;
        shared.commit(
            None,
            SessionPhase::Authenticated,
            Some(identity.clone()),
            CacheAction::Write,
        );
        Ok(identity)
    }

    /// Checks the credentials with the provider. On success the identity is
    /// published by the provider's sign-in event, not by this call.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let shared = &self.shared;
        let label = AuthProviderKind::Email.as_str();
        let _loading = shared.begin_op();
        shared
            .provider
            .sign_in(email, password)
            .await
            .map(|_| ())
            .map_err(|err| shared.fail(label, err.into()))
    }

    pub async fn sign_up_with_password(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<SessionIdentity, AuthError> {
        let shared = &self.shared;
        let label = AuthProviderKind::Email.as_str();
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(shared.fail(
                label,
                AuthError::WeakPassword {
                    min_len: MIN_PASSWORD_LEN,
                },
            ));
        }
        let name = name.trim();
        let metadata = SignUpMetadata {
            name: if name.is_empty() {
                fallback_display_name(email.trim())
            } else {
                name.to_string()
            },
        };
        let _loading = shared.begin_op();
        let session = shared
            .provider
            .sign_up(email, password, metadata.clone())
            .await
            .map_err(|err| shared.fail(label, err.into()))?;
        let identity = SessionIdentity::v1(
            session.user_id,
            metadata.name,
            session.email,
            session.avatar,
            AuthProviderKind::Email,
        )
        .map_err(|violation| shared.fail(label, violation.into()))?;
        shared.commit(
            None,
            SessionPhase::Authenticated,
            Some(identity.clone()),
            CacheAction::Write,
        );
        Ok(identity)
    }

    /// Clears the local identity and cache unconditionally, then tells the provider.
    /// A provider failure is reported and logged only.
    pub async fn sign_out(&self) {
        let shared = &self.shared;
        shared.commit(None, SessionPhase::Anonymous, None, CacheAction::Remove);
        let _loading = shared.begin_op();
        if let Err(err) = shared.provider.sign_out().await {
            warn!(error = %err, "remote sign-out failed; local session already cleared");
            shared
                .reporter
                .report_auth_error(shared.provider.label(), &AuthError::from(err));
        }
    }

    /// Writes the patch remotely first; the local identity and cache change only
    /// after that write succeeds.
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<SessionIdentity, AuthError> {
        let shared = &self.shared;
        let label = shared.provider.label();
        let Some(identity) = self.current().identity else {
            return Err(shared.fail(label, AuthError::NotAuthenticated));
        };
        patch
            .validate()
            .map_err(|violation| shared.fail(label, violation.into()))?;
        let _loading = shared.begin_op();
        shared
            .provider
            .update_profile(&identity.id, &patch)
            .await
            .map_err(|err| shared.fail(label, err.into()))?;

        let (updated, fault) = {
            let mut core = shared.core();
            let patched = match core.identity.as_ref() {
                Some(current) if current.id == identity.id => {
                    current.with_patch(&patch).map_err(AuthError::from)
                }
                _ => Err(AuthError::NotAuthenticated),
            };
            let updated = match patched {
                Ok(updated) => updated,
                Err(err) => {
                    drop(core);
                    return Err(shared.fail(label, err));
                }
            };
            core.epoch += 1;
            let fault = shared.sync_cache(Some(&updated), CacheAction::Write);
            core.identity = Some(updated.clone());
            shared.publish(&mut core);
            (updated, fault)
        };
        if let Some((operation, fault)) = fault {
            shared.reporter.report_storage_error(operation, &fault);
        }
        Ok(updated)
    }

    pub async fn upload_avatar(&self, upload: AvatarUpload) -> Result<String, AuthError> {
        let shared = &self.shared;
        let label = shared.provider.label();
        let Some(identity) = self.current().identity else {
            return Err(shared.fail(label, AuthError::NotAuthenticated));
        };
        if !upload.is_image() {
            return Err(shared.fail(
                label,
                AuthError::InvalidFileType {
                    content_type: upload.content_type.clone(),
                },
            ));
        }
        if upload.bytes.len() > AVATAR_MAX_BYTES {
            return Err(shared.fail(
                label,
                AuthError::FileTooLarge {
                    size: upload.bytes.len(),
                    limit: AVATAR_MAX_BYTES,
                },
            ));
        }
        let _loading = shared.begin_op();
        shared
            .provider
            .upload_avatar(&identity.id, &upload)
            .await
            .map_err(|err| shared.fail(label, err.into()))
    }
}

impl Drop for SessionBootstrapper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
