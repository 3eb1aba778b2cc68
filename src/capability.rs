use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::repository::{RepositoryState, Session, StoreError};
use crate::retry::RetryPolicy;

/// Identity
///
/// The resolved caller of one request. Produced by the context injector from the
/// request credentials and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Anonymous,
    Authenticated { subject_id: Uuid },
}

impl Identity {
    pub fn role(&self) -> Role {
        match self {
            Identity::Anonymous => Role::Anon,
            Identity::Authenticated { .. } => Role::Authenticated,
        }
    }

    pub fn subject_id(&self) -> Option<Uuid> {
        match self {
            Identity::Anonymous => None,
            Identity::Authenticated { subject_id } => Some(*subject_id),
        }
    }
}

/// Role
///
/// The policy role an identity acts under. The names double as the database roles
/// a storage session switches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anon,
    Authenticated,
}

impl Role {
    pub fn db_role(self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.db_role())
    }
}

/// Capability
///
/// The per-request, role-scoped handle to the storage layer. It binds the request's
/// `Identity` to the repository and is the only way business logic reaches storage.
///
/// * Built exactly once per request by `context::inject_capability`; the
///   constructor is crate-private and there is no setter for the identity.
/// * Never cached or shared between requests. The `Capability` extractor removes
///   it from the request extensions, so a request hands it to one call chain.
/// * Storage sessions opened through it are scoped: each holds one pooled
///   connection and releases it when dropped, whether the operation succeeded,
///   failed or was cancelled.
// `Clone` is required by `http::Extensions::insert`; nothing else clones it.
#[derive(Clone)]
pub struct Capability {
    identity: Identity,
    repo: RepositoryState,
    retry: RetryPolicy,
}

impl Capability {
    pub(crate) fn bind(identity: Identity, repo: RepositoryState, retry: RetryPolicy) -> Self {
        Self {
            identity,
            repo,
            retry,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// open
    ///
    /// Acquires a pooled connection and starts a storage session scoped to this
    /// handle's identity. Every row the session touches is checked by the storage
    /// layer's policies for that identity.
    pub async fn open(&self) -> Result<Box<dyn Session>, StoreError> {
        self.repo.open(&self.identity).await
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("identity", &self.identity)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
