//! Hosted backend access.
//!
//! The storefront keeps no state of its own: accounts, sessions, content,
//! ratings and watchlists all live behind the backend-as-a-service. Components
//! depend on the three traits below, `BackendClient` implements all of them
//! over HTTP.

mod client;
mod error;
mod models;
mod query;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

pub use client::{needs_refresh, BackendClient, AUTO_REFRESH_TICK, REFRESH_THRESHOLD_SECS};
pub use error::BackendError;
pub use models::{
    AuthChange, AuthEvent, AuthSession, AuthUser, QueryResult, SessionTokens, SignUpRequest,
    SignUpResponse,
};
pub use query::{value_as_param, Filter, Order, Query};

/// Auth issuer operations and the auth-event stream.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError>;

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Fetches the user behind the current session, `None` when signed out.
    async fn get_user(&self) -> Result<Option<AuthUser>, BackendError>;

    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError>;

    /// Installs a session from tokens received out of band (confirmation redirect).
    async fn set_session(&self, tokens: &SessionTokens) -> Result<AuthSession, BackendError>;

    async fn refresh_session(&self) -> Result<AuthSession, BackendError>;

    /// Subscribes to auth changes. Every sign-in, sign-out and token refresh
    /// is published here.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}

/// Row-level access to the relational store.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn select(&self, query: &Query) -> Result<QueryResult, BackendError>;

    async fn insert(&self, table: &str, row: Value) -> Result<(), BackendError>;

    /// Applies `patch` to every row matching the query filters.
    async fn update(&self, query: &Query, patch: Value) -> Result<(), BackendError>;
}

/// Server-side functions hosted next to the store.
#[async_trait]
pub trait FunctionBackend: Send + Sync {
    async fn invoke(&self, function: &str, body: Value) -> Result<Value, BackendError>;
}

/// Names of the remote functions the storefront calls.
pub mod functions {
    pub const SEARCH_CONTENT: &str = "search-content";
    pub const UPDATE_PROGRESS: &str = "update-progress";
    pub const MANAGE_WATCHLIST: &str = "manage-watchlist";
}
