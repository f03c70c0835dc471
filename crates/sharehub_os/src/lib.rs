#![forbid(unsafe_code)]

pub mod config;
pub mod credential;
pub mod error_reporter;
pub mod http_provider;
pub mod identity_provider;
pub mod local_provider;
pub mod runtime;
pub mod session;
pub mod traps;

pub use config::SharehubConfig;
pub use error_reporter::ErrorReporter;
pub use identity_provider::{AuthEvent, IdentityProvider, ProviderError};
pub use runtime::ClientCore;
pub use session::{AuthError, SessionBootstrapper, SessionPhase, SessionSnapshot};
