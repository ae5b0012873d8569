//! Current signed-in user.

use std::sync::RwLock;

/// Resolves the authenticated user every scoped operation runs as.
pub trait SessionProvider: Send + Sync {
    /// The signed-in user's id, or `None` when signed out.
    fn current_user_id(&self) -> Option<String>;
}

/// In-process session holding a single user id.
#[derive(Debug, Default)]
pub struct StaticSession {
    user_id: RwLock<Option<String>>,
}

impl StaticSession {
    /// Creates a session signed in as `user_id`.
    #[must_use]
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    /// Creates a signed-out session.
    #[must_use]
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Switches the signed-in user.
    pub fn sign_in(&self, user_id: impl Into<String>) {
        let mut guard = self
            .user_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(user_id.into());
    }

    /// Clears the signed-in user.
    pub fn sign_out(&self) {
        let mut guard = self
            .user_id
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = None;
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
