#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_email, validate_text, validate_token, validate_url};
use crate::{ContractViolation, Validate};

pub const IDENTITY_ID_MAX_LEN: usize = 128;
pub const IDENTITY_NAME_MAX_LEN: usize = 128;

/// Which sign-in path produced an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProviderKind {
    /// Federated sign-in through the remote identity provider.
    Google,
    /// Email + password account.
    Email,
}

impl AuthProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthProviderKind::Google => "google",
            AuthProviderKind::Email => "email",
        }
    }
}

/// The signed-in user as the rest of the application sees it.
///
/// Serialized verbatim under the `user` storage key, so the field names are part of
/// the persisted layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub provider: AuthProviderKind,
}

impl SessionIdentity {
    pub fn v1(
        id: String,
        name: String,
        email: String,
        avatar: Option<String>,
        provider: AuthProviderKind,
    ) -> Result<Self, ContractViolation> {
        let identity = Self {
            id,
            name,
            email,
            avatar,
            provider,
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Returns a patched copy; `self` is left untouched so a failed remote write can
    /// be abandoned without rolling anything back.
    pub fn with_patch(&self, patch: &ProfilePatch) -> Result<Self, ContractViolation> {
        patch.validate()?;
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(avatar) = &patch.avatar {
            next.avatar = Some(avatar.clone());
        }
        next.validate()?;
        Ok(next)
    }
}

impl Validate for SessionIdentity {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("session_identity.id", &self.id, IDENTITY_ID_MAX_LEN)?;
        validate_text(
            "session_identity.name",
            &self.name,
            IDENTITY_NAME_MAX_LEN,
        )?;
        validate_email("session_identity.email", &self.email)?;
        if let Some(avatar) = &self.avatar {
            validate_url("session_identity.avatar", avatar)?;
        }
        Ok(())
    }
}

/// Fields a profile update may change. `id`, `email` and `provider` are fixed for the
/// lifetime of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ProfilePatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            avatar: None,
        }
    }

    pub fn avatar(url: impl Into<String>) -> Self {
        Self {
            name: None,
            avatar: Some(url.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.avatar.is_none()
    }
}

impl Validate for ProfilePatch {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "profile_patch",
                reason: "must change at least one field",
            });
        }
        if let Some(name) = &self.name {
            validate_text("profile_patch.name", name, IDENTITY_NAME_MAX_LEN)?;
        }
        if let Some(avatar) = &self.avatar {
            validate_url("profile_patch.avatar", avatar)?;
        }
        Ok(())
    }
}

/// Display name used when the profile record is unavailable: the part of the email
/// before `@`.
pub fn fallback_display_name(email: &str) -> String {
    match email.split_once('@') {
        Some((local, _)) if !local.trim().is_empty() => local.to_string(),
        _ => email.to_string(),
    }
}
