#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sharehub_contracts::error_log::error_contexts;
use sharehub_contracts::identity::{AuthProviderKind, ProfilePatch, SessionIdentity};
use sharehub_os::error_reporter::ErrorReporter;
use sharehub_os::identity_provider::{
    AuthEvent, AvatarUpload, FederatedSignIn, IdentityProvider, ProfileRecord, ProviderError,
    RemoteSession, SignUpMetadata,
};
use sharehub_os::local_provider::LocalAccountRepository;
use sharehub_os::session::{
    AuthError, SessionBootstrapper, SessionConfig, SessionPhase, SessionSnapshot,
    AVATAR_MAX_BYTES, SESSION_USER_KEY,
};
use sharehub_storage::{BoundedStore, MemoryBackend};
use tokio::sync::{broadcast, Notify};

struct ScriptedProvider {
    session: Mutex<Result<Option<RemoteSession>, ProviderError>>,
    profile: Mutex<Result<Option<ProfileRecord>, ProviderError>>,
    sign_out: Mutex<Result<(), ProviderError>>,
    update: Mutex<Result<(), ProviderError>>,
    // When set, get_session signals `entered` and waits for `release`.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
    // Same handshake for get_user_profile.
    profile_gate: Option<(Arc<Notify>, Arc<Notify>)>,
    events: broadcast::Sender<AuthEvent>,
    sign_up_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(Ok(None)),
            profile: Mutex::new(Ok(None)),
            sign_out: Mutex::new(Ok(())),
            update: Mutex::new(Ok(())),
            gate: None,
            profile_gate: None,
            events,
            sign_up_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    fn label(&self) -> &'static str {
        "scripted"
    }

    async fn get_session(&self) -> Result<Option<RemoteSession>, ProviderError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        self.session.lock().unwrap().clone()
    }

    async fn get_user_profile(&self, _user_id: &str) -> Result<Option<ProfileRecord>, ProviderError> {
        if let Some((entered, release)) = &self.profile_gate {
            entered.notify_one();
            release.notified().await;
        }
        self.profile.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> Result<RemoteSession, ProviderError> {
        Err(ProviderError::InvalidCredentials)
    }

    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _metadata: SignUpMetadata,
    ) -> Result<RemoteSession, ProviderError> {
        self.sign_up_calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::UserAlreadyExists)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.sign_out.lock().unwrap().clone()
    }

    async fn update_profile(&self, _user_id: &str, _patch: &ProfilePatch) -> Result<(), ProviderError> {
        self.update.lock().unwrap().clone()
    }

    async fn upload_avatar(&self, user_id: &str, upload: &AvatarUpload) -> Result<String, ProviderError> {
        Ok(format!("https://cdn.example/avatars/{user_id}/{}", upload.file_name))
    }
}

struct FakeFederated {
    loaded: bool,
    prompts: AtomicUsize,
}

#[async_trait]
impl FederatedSignIn for FakeFederated {
    fn is_loaded(&self) -> bool {
        self.loaded
    }

    async fn prompt(&self) -> Result<(), ProviderError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    store: Arc<BoundedStore>,
    reporter: ErrorReporter,
    session: Arc<SessionBootstrapper>,
}

fn harness(provider: Arc<dyn IdentityProvider>, client_id: Option<&str>) -> Harness {
    let store = Arc::new(BoundedStore::new(MemoryBackend::new()));
    let reporter = ErrorReporter::new(Arc::clone(&store));
    let session = Arc::new(SessionBootstrapper::new(
        SessionConfig {
            google_client_id: client_id.map(str::to_string),
        },
        provider,
        Arc::clone(&store),
        reporter.clone(),
    ));
    Harness {
        store,
        reporter,
        session,
    }
}

fn ann(provider: AuthProviderKind) -> SessionIdentity {
    SessionIdentity::v1(
        "u1".to_string(),
        "Ann".to_string(),
        "a@x.com".to_string(),
        None,
        provider,
    )
    .unwrap()
}

fn remote_ann() -> RemoteSession {
    RemoteSession {
        user_id: "u1".to_string(),
        email: "ann@x.com".to_string(),
        access_token: Some("tok".to_string()),
        name: None,
        avatar: None,
        provider: AuthProviderKind::Email,
    }
}

fn remote_bob() -> RemoteSession {
    RemoteSession {
        user_id: "u2".to_string(),
        email: "bob@x.com".to_string(),
        access_token: Some("tok-2".to_string()),
        name: Some("Bob".to_string()),
        avatar: None,
        provider: AuthProviderKind::Email,
    }
}

fn gates() -> (Arc<Notify>, Arc<Notify>) {
    (Arc::new(Notify::new()), Arc::new(Notify::new()))
}

fn cached_user(h: &Harness) -> Option<SessionIdentity> {
    h.store.get_record::<SessionIdentity>(SESSION_USER_KEY)
}

async fn wait_for_phase(h: &Harness, phase: SessionPhase) -> SessionSnapshot {
    let mut rx = h.session.subscribe();
    let snapshot = rx.wait_for(|s| s.phase == phase).await.unwrap().clone();
    snapshot
}

#[tokio::test]
async fn at_session_db_01_rejected_lookup_restores_cached_identity_exactly() {
    let provider = ScriptedProvider::new();
    *provider.session.lock().unwrap() = Err(ProviderError::Transport("offline".to_string()));
    let h = harness(Arc::new(provider), None);
    let cached = ann(AuthProviderKind::Email);
    assert!(h.store.set_item(SESSION_USER_KEY, &cached));

    let snapshot = h.session.start().await;
    assert_eq!(snapshot.phase, SessionPhase::AuthenticatedCached);
    assert_eq!(snapshot.identity, Some(cached));
    assert!(!snapshot.loading);
}

#[tokio::test]
async fn at_session_db_02_corrupt_cache_is_anonymous_and_dropped() {
    let backend = MemoryBackend::new();
    backend.raw_set("sharehub_user", "{not json");
    let store = Arc::new(BoundedStore::new(backend.clone()));
    let reporter = ErrorReporter::new(Arc::clone(&store));
    let session = SessionBootstrapper::new(
        SessionConfig::default(),
        Arc::new(ScriptedProvider::new()),
        Arc::clone(&store),
        reporter.clone(),
    );

    let snapshot = session.start().await;
    assert_eq!(snapshot.phase, SessionPhase::Anonymous);
    assert!(backend.raw_get("sharehub_user").is_none());
    assert!(reporter
        .stored_errors()
        .iter()
        .any(|r| r.context.as_deref() == Some(error_contexts::STORAGE_OPERATION)));
}

#[tokio::test]
async fn at_session_db_03_sign_out_clears_even_when_remote_fails() {
    let provider = ScriptedProvider::new();
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    *provider.sign_out.lock().unwrap() = Err(ProviderError::Transport("offline".to_string()));
    let h = harness(Arc::new(provider), None);
    assert_eq!(h.session.start().await.phase, SessionPhase::Authenticated);
    assert!(cached_user(&h).is_some());

    h.session.sign_out().await;
    let snapshot = h.session.current();
    assert_eq!(snapshot.phase, SessionPhase::Anonymous);
    assert!(snapshot.identity.is_none());
    assert!(cached_user(&h).is_none());
    assert!(h
        .reporter
        .stored_errors()
        .iter()
        .any(|r| r.message.contains("offline")));
}

#[tokio::test]
async fn at_session_db_04_short_password_is_weak_before_any_remote_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let h = harness(provider.clone(), None);
    h.session.start().await;

    let err = h
        .session
        .sign_up_with_password("ann@x.com", "abcde", "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::WeakPassword { min_len: 6 }));
    assert_eq!(provider.sign_up_calls.load(Ordering::SeqCst), 0);
    assert!(h.session.current().identity.is_none());
    assert!(cached_user(&h).is_none());

    let auth_records = h
        .reporter
        .stored_errors()
        .into_iter()
        .filter(|r| r.context.as_deref() == Some(error_contexts::AUTHENTICATION))
        .count();
    assert_eq!(auth_records, 1);
}

#[tokio::test]
async fn at_session_db_05_duplicate_sign_up_maps_to_user_already_exists() {
    let provider = Arc::new(ScriptedProvider::new());
    let h = harness(provider.clone(), None);
    h.session.start().await;
    let err = h
        .session
        .sign_up_with_password("ann@x.com", "secret1", "Ann")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::UserAlreadyExists));
    assert_eq!(provider.sign_up_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_session_db_06_failed_remote_update_changes_nothing_locally() {
    let provider = Arc::new(ScriptedProvider::new());
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    *provider.update.lock().unwrap() = Err(ProviderError::Rejected {
        status: 500,
        message: "db down".to_string(),
    });
    let h = harness(provider.clone(), None);
    h.session.start().await;
    let before = h.session.current().identity;
    let cache_before = cached_user(&h);

    let err = h
        .session
        .update_profile(ProfilePatch::name("Annie"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Provider(ProviderError::Rejected { status: 500, .. })));
    assert_eq!(h.session.current().identity, before);
    assert_eq!(cached_user(&h), cache_before);

    *provider.update.lock().unwrap() = Ok(());
    let updated = h
        .session
        .update_profile(ProfilePatch::name("Annie"))
        .await
        .unwrap();
    assert_eq!(updated.name, "Annie");
    assert_eq!(h.session.current().identity, Some(updated.clone()));
    assert_eq!(cached_user(&h), Some(updated));
}

#[tokio::test]
async fn at_session_db_07_update_without_identity_is_not_authenticated() {
    let h = harness(Arc::new(ScriptedProvider::new()), None);
    h.session.start().await;
    let err = h
        .session
        .update_profile(ProfilePatch::name("Annie"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));
}

#[tokio::test]
async fn at_session_db_08_late_lookup_loses_to_newer_sign_out_event() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut provider = ScriptedProvider::new();
    provider.gate = Some((entered.clone(), release.clone()));
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    let events = provider.events.clone();
    let h = harness(Arc::new(provider), None);

    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    entered.notified().await;

    events.send(AuthEvent::SignedOut).unwrap();
    wait_for_phase(&h, SessionPhase::Anonymous).await;

    release.notify_one();
    let snapshot = start.await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::Anonymous);
    assert!(snapshot.identity.is_none());
    assert!(cached_user(&h).is_none());
}

#[tokio::test]
async fn at_session_db_09_profile_fetch_failure_falls_back_to_session_fields() {
    let provider = ScriptedProvider::new();
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    *provider.profile.lock().unwrap() = Err(ProviderError::Transport("timeout".to_string()));
    let h = harness(Arc::new(provider), None);

    let snapshot = h.session.start().await;
    assert_eq!(snapshot.phase, SessionPhase::Authenticated);
    let identity = snapshot.identity.unwrap();
    assert_eq!(identity.name, "ann");
    assert_eq!(identity.email, "ann@x.com");
    assert_eq!(cached_user(&h), Some(identity));
}

#[tokio::test]
async fn at_session_db_10_profile_row_wins_over_session_fields() {
    let provider = ScriptedProvider::new();
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    *provider.profile.lock().unwrap() = Ok(Some(ProfileRecord {
        id: "u1".to_string(),
        name: Some("Ann Lee".to_string()),
        email: None,
        avatar_url: Some("https://cdn.example/a.png".to_string()),
    }));
    let h = harness(Arc::new(provider), None);
    let identity = h.session.start().await.identity.unwrap();
    assert_eq!(identity.name, "Ann Lee");
    assert_eq!(identity.avatar.as_deref(), Some("https://cdn.example/a.png"));
}

#[tokio::test]
async fn at_session_db_11_avatar_upload_checks() {
    let h = harness(Arc::new(ScriptedProvider::new()), None);
    h.session.start().await;
    let image = |bytes: usize| AvatarUpload {
        file_name: "me.png".to_string(),
        content_type: "image/png".to_string(),
        bytes: vec![0; bytes],
    };

    let err = h.session.upload_avatar(image(10)).await.unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));

    let cached = ann(AuthProviderKind::Google);
    let h = harness(Arc::new(ScriptedProvider::new()), None);
    assert!(h.store.set_item(SESSION_USER_KEY, &cached));
    assert_eq!(h.session.start().await.phase, SessionPhase::AuthenticatedCached);

    let mut text = image(10);
    text.content_type = "text/plain".to_string();
    assert!(matches!(
        h.session.upload_avatar(text).await.unwrap_err(),
        AuthError::InvalidFileType { .. }
    ));
    assert!(matches!(
        h.session.upload_avatar(image(AVATAR_MAX_BYTES + 1)).await.unwrap_err(),
        AuthError::FileTooLarge { .. }
    ));
    let url = h.session.upload_avatar(image(AVATAR_MAX_BYTES)).await.unwrap();
    assert_eq!(url, "https://cdn.example/avatars/u1/me.png");
}

#[tokio::test]
async fn at_session_db_12_remote_sign_in_requires_config_and_loaded_client() {
    let h = harness(Arc::new(ScriptedProvider::new()), None);
    assert!(matches!(
        h.session.sign_in_with_remote_provider().await.unwrap_err(),
        AuthError::ProviderNotConfigured
    ));

    let h = harness(Arc::new(ScriptedProvider::new()), Some("123.apps.example"));
    assert!(matches!(
        h.session.sign_in_with_remote_provider().await.unwrap_err(),
        AuthError::ProviderUnavailable
    ));
    h.session.attach_federated(Arc::new(FakeFederated {
        loaded: false,
        prompts: AtomicUsize::new(0),
    }));
    assert!(matches!(
        h.session.sign_in_with_remote_provider().await.unwrap_err(),
        AuthError::ProviderUnavailable
    ));

    let client = Arc::new(FakeFederated {
        loaded: true,
        prompts: AtomicUsize::new(0),
    });
    h.session.attach_federated(client.clone());
    h.session.sign_in_with_remote_provider().await.unwrap();
    assert_eq!(client.prompts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_session_db_13_password_sign_in_arrives_through_event_stream() {
    let repo = Arc::new(LocalAccountRepository::new());
    repo.sign_up(
        "ann@x.com",
        "secret1",
        SignUpMetadata {
            name: "Ann".to_string(),
        },
    )
    .await
    .unwrap();
    repo.sign_out().await.unwrap();
    let h = harness(repo, None);
    assert_eq!(h.session.start().await.phase, SessionPhase::Anonymous);

    let err = h
        .session
        .sign_in_with_password("ann@x.com", "wrong-pass")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials));

    h.session
        .sign_in_with_password("ann@x.com", "secret1")
        .await
        .unwrap();
    let snapshot = wait_for_phase(&h, SessionPhase::Authenticated).await;
    let identity = snapshot.identity.unwrap();
    assert_eq!(identity.name, "Ann");
    assert_eq!(cached_user(&h), Some(identity));
}

#[tokio::test]
async fn at_session_db_14_shutdown_stops_following_events() {
    let provider = ScriptedProvider::new();
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    let events = provider.events.clone();
    let h = harness(Arc::new(provider), None);
    assert_eq!(h.session.start().await.phase, SessionPhase::Authenticated);

    h.session.shutdown();
    tokio::task::yield_now().await;
    let _ = events.send(AuthEvent::SignedOut);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(h.session.current().phase, SessionPhase::Authenticated);
}

#[tokio::test]
async fn at_session_db_15_unusable_event_identity_still_finishes_bootstrap() {
    let (entered, release) = gates();
    let mut provider = ScriptedProvider::new();
    provider.gate = Some((entered.clone(), release.clone()));
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    let events = provider.events.clone();
    let h = harness(Arc::new(provider), None);
    let cached = ann(AuthProviderKind::Email);
    assert!(h.store.set_item(SESSION_USER_KEY, &cached));

    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    entered.notified().await;

    let mut no_email = remote_ann();
    no_email.email = String::new();
    events.send(AuthEvent::SignedIn(no_email)).unwrap();
    let resolved = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        wait_for_phase(&h, SessionPhase::AuthenticatedCached),
    )
    .await
    .expect("bootstrap never left uninitialized");
    assert_eq!(resolved.identity, Some(cached.clone()));

    release.notify_one();
    let snapshot = start.await.unwrap();
    assert_eq!(snapshot.phase, SessionPhase::AuthenticatedCached);
    assert_eq!(snapshot.identity, Some(cached.clone()));
    assert!(!snapshot.loading);
    assert_eq!(cached_user(&h), Some(cached));
    assert!(h
        .reporter
        .stored_errors()
        .iter()
        .any(|r| r.context.as_deref() == Some(error_contexts::AUTHENTICATION)));
}

#[tokio::test]
async fn at_session_db_16_late_lookup_loses_to_newer_sign_in_event() {
    let (entered, release) = gates();
    let mut provider = ScriptedProvider::new();
    provider.gate = Some((entered.clone(), release.clone()));
    *provider.session.lock().unwrap() = Ok(Some(remote_ann()));
    let events = provider.events.clone();
    let h = harness(Arc::new(provider), None);

    let session = Arc::clone(&h.session);
    let start = tokio::spawn(async move { session.start().await });
    entered.notified().await;

    events.send(AuthEvent::SignedIn(remote_bob())).unwrap();
    let signed_in = wait_for_phase(&h, SessionPhase::Authenticated).await;
    assert_eq!(signed_in.identity.map(|i| i.id), Some("u2".to_string()));

    release.notify_one();
    let snapshot = start.await.unwrap();
    let identity = snapshot.identity.unwrap();
    assert_eq!(identity.id, "u2");
    assert_eq!(identity.name, "Bob");
    assert_eq!(cached_user(&h), Some(identity));
}

#[tokio::test]
async fn at_session_db_17_local_sign_out_beats_in_flight_event_resolution() {
    let (entered, release) = gates();
    let mut provider = ScriptedProvider::new();
    provider.profile_gate = Some((entered.clone(), release.clone()));
    let events = provider.events.clone();
    let h = harness(Arc::new(provider), None);
    assert_eq!(h.session.start().await.phase, SessionPhase::Anonymous);

    events.send(AuthEvent::UserUpdated(remote_ann())).unwrap();
    entered.notified().await;

    h.session.sign_out().await;
    assert_eq!(h.session.current().phase, SessionPhase::Anonymous);

    release.notify_one();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let snapshot = h.session.current();
    assert_eq!(snapshot.phase, SessionPhase::Anonymous);
    assert!(snapshot.identity.is_none());
    assert!(cached_user(&h).is_none());
}
