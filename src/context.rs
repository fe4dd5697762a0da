//! Shared handles every session works through

use crate::error::{Result, SyncError};
use crate::store::Store;
use crate::transport::Transport;
use crate::types::{SyncConfig, User};
use std::sync::Arc;

/// Source of the currently signed-in user
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;
}

/// Fixed identity, or none at all
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user: Option<User>,
}

impl StaticIdentity {
    pub fn new(user: User) -> Self {
        Self { user: Some(user) }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<User> {
        self.user.clone()
    }
}

/// Store, transport and identity bundled with the configuration.
/// Cheap to clone; clones share the same handles.
#[derive(Clone)]
pub struct SyncContext {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    config: SyncConfig,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            identity,
            config,
        }
    }

    /// Same handles acting as another user
    pub fn with_identity(&self, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Signed-in user, or [`SyncError::NotSignedIn`]
    pub fn current_user(&self) -> Result<User> {
        self.identity.current_user().ok_or(SyncError::NotSignedIn)
    }
}
