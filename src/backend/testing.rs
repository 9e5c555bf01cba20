//! In-memory backend used by unit tests.
//!
//! Implements all three backend traits, records every call and lets tests
//! script function results or hold function calls until released.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Notify, Semaphore};
use uuid::Uuid;

use super::{
    AuthBackend, AuthChange, AuthEvent, AuthSession, AuthUser, BackendError, DataBackend,
    FunctionBackend, Query, QueryResult, SessionTokens, SignUpRequest, SignUpResponse,
};

pub(crate) fn sample_user(email: &str) -> AuthUser {
    AuthUser {
        id: Uuid::new_v4(),
        email: Some(email.to_string()),
        email_confirmed_at: Some(Utc::now()),
        user_metadata: Map::new(),
    }
}

pub(crate) fn sample_session(email: &str) -> AuthSession {
    session_for(sample_user(email))
}

fn session_for(user: AuthUser) -> AuthSession {
    AuthSession {
        access_token: format!("access-{}", user.id),
        refresh_token: format!("refresh-{}", user.id),
        token_type: "bearer".to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        user,
    }
}

#[derive(Default)]
struct FakeState {
    session: Option<AuthSession>,
    accounts: HashMap<String, (String, AuthUser)>,
    tables: HashMap<String, Vec<Value>>,
    auth_calls: Vec<String>,
    invocations: Vec<(String, Value)>,
    inserts: Vec<(String, Value)>,
    scripted: HashMap<String, VecDeque<Result<Value, BackendError>>>,
    auto_confirm: bool,
    fail_sign_out: bool,
    fail_get_user: bool,
    fail_inserts: bool,
    fail_tables: Vec<String>,
}

pub(crate) struct FakeBackend {
    state: Mutex<FakeState>,
    event_tx: broadcast::Sender<AuthChange>,
    invoked: Notify,
    inserted: Notify,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            event_tx,
            invoked: Notify::new(),
            inserted: Notify::new(),
            gate: Mutex::new(None),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_account(&self, email: &str, password: &str) -> AuthUser {
        let user = sample_user(email);
        self.state()
            .accounts
            .insert(email.to_string(), (password.to_string(), user.clone()));
        user
    }

    /// Starts the fake already signed in as `email`.
    pub fn sign_in_as(&self, email: &str) -> AuthSession {
        let session = sample_session(email);
        self.state().session = Some(session.clone());
        session
    }

    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.state().auto_confirm = auto_confirm;
    }

    pub fn fail_sign_out(&self) {
        self.state().fail_sign_out = true;
    }

    pub fn fail_get_user(&self) {
        self.state().fail_get_user = true;
    }

    pub fn fail_inserts(&self) {
        self.state().fail_inserts = true;
    }

    pub fn fail_table(&self, table: &str) {
        self.state().fail_tables.push(table.to_string());
    }

    pub fn put_rows(&self, table: &str, rows: Vec<Value>) {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn script_function(&self, function: &str, result: Result<Value, BackendError>) {
        self.state()
            .scripted
            .entry(function.to_string())
            .or_default()
            .push_back(result);
    }

    /// Function calls block until `release_functions` hands out permits.
    pub fn hold_functions(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_functions(&self, count: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(count);
        }
    }

    pub fn emit(&self, change: AuthChange) {
        let _ = self.event_tx.send(change);
    }

    pub fn auth_calls(&self) -> Vec<String> {
        self.state().auth_calls.clone()
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.state().invocations.clone()
    }

    pub fn invocations_of(&self, function: &str) -> Vec<Value> {
        self.state()
            .invocations
            .iter()
            .filter(|(name, _)| name == function)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn inserts(&self) -> Vec<(String, Value)> {
        self.state().inserts.clone()
    }

    pub async fn wait_for_invocations(&self, count: usize) {
        loop {
            let notified = self.invoked.notified();
            if self.state().invocations.len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_inserts(&self, count: usize) {
        loop {
            let notified = self.inserted.notified();
            if self.state().inserts.len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn publish(&self, event: AuthEvent, session: Option<AuthSession>) {
        let _ = self.event_tx.send(AuthChange { event, session });
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        // Nulls sort last in either direction.
        (Some(Value::Null) | None, _) => Ordering::Greater,
        (_, Some(Value::Null) | None) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl AuthBackend for FakeBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let session = {
            let mut state = self.state();
            state.auth_calls.push(format!("sign_in:{}", email));
            let user = match state.accounts.get(email) {
                Some((stored, user)) if stored == password => user.clone(),
                _ => return Err(BackendError::InvalidCredentials),
            };
            let session = session_for(user);
            state.session = Some(session.clone());
            session
        };
        self.publish(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, BackendError> {
        let (user, auto_confirm) = {
            let mut state = self.state();
            state.auth_calls.push(format!(
                "sign_up:{}:{}:{}",
                request.email, request.full_name, request.email_redirect_to
            ));
            if state.accounts.contains_key(&request.email) {
                return Err(BackendError::DuplicateAccount);
            }
            let mut user = sample_user(&request.email);
            user.user_metadata
                .insert("full_name".to_string(), json!(request.full_name));
            if !state.auto_confirm {
                user.email_confirmed_at = None;
            }
            state.accounts.insert(
                request.email.clone(),
                (request.password.clone(), user.clone()),
            );
            (user, state.auto_confirm)
        };

        if !auto_confirm {
            return Ok(SignUpResponse {
                user: Some(user),
                session: None,
            });
        }
        let session = session_for(user.clone());
        self.state().session = Some(session.clone());
        self.publish(AuthEvent::SignedIn, Some(session.clone()));
        Ok(SignUpResponse {
            user: Some(user),
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let failed = {
            let mut state = self.state();
            state.auth_calls.push("sign_out".to_string());
            state.session = None;
            state.fail_sign_out
        };
        self.publish(AuthEvent::SignedOut, None);
        if failed {
            return Err(BackendError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    async fn get_user(&self) -> Result<Option<AuthUser>, BackendError> {
        let state = self.state();
        if state.fail_get_user {
            return Err(BackendError::Network("timed out".to_string()));
        }
        Ok(state.session.as_ref().map(|s| s.user.clone()))
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
        Ok(self.state().session.clone())
    }

    async fn set_session(&self, tokens: &SessionTokens) -> Result<AuthSession, BackendError> {
        let mut session = sample_session("callback@example.com");
        session.access_token = tokens.access_token.clone();
        session.refresh_token = tokens.refresh_token.clone();
        self.state().session = Some(session.clone());
        self.publish(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<AuthSession, BackendError> {
        let session = self
            .state()
            .session
            .clone()
            .ok_or(BackendError::NotAuthenticated)?;
        self.publish(AuthEvent::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.event_tx.subscribe()
    }
}

#[async_trait]
impl DataBackend for FakeBackend {
    async fn select(&self, query: &Query) -> Result<QueryResult, BackendError> {
        let state = self.state();
        if state.fail_tables.iter().any(|t| t == query.table_name()) {
            return Err(BackendError::Api {
                status: 500,
                message: format!("{} unavailable", query.table_name()),
            });
        }
        let mut rows: Vec<Value> = state
            .tables
            .get(query.table_name())
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters().iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for order in query.ordering().iter().rev() {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        let total = query.wants_count().then_some(rows.len() as u64);
        let offset = query.offset().unwrap_or(0);
        let rows = rows
            .into_iter()
            .skip(offset)
            .take(query.row_limit().unwrap_or(usize::MAX))
            .collect();
        Ok(QueryResult { rows, total })
    }

    async fn insert(&self, table: &str, row: Value) -> Result<(), BackendError> {
        let result = {
            let mut state = self.state();
            state.inserts.push((table.to_string(), row.clone()));
            if state.fail_inserts {
                Err(BackendError::Api {
                    status: 403,
                    message: "new row violates row-level security policy".to_string(),
                })
            } else {
                state.tables.entry(table.to_string()).or_default().push(row);
                Ok(())
            }
        };
        self.inserted.notify_waiters();
        result
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<(), BackendError> {
        let mut state = self.state();
        if let Some(rows) = state.tables.get_mut(query.table_name()) {
            for row in rows
                .iter_mut()
                .filter(|row| query.filters().iter().all(|f| f.matches(row)))
            {
                if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FunctionBackend for FakeBackend {
    async fn invoke(&self, function: &str, body: Value) -> Result<Value, BackendError> {
        let scripted = {
            let mut state = self.state();
            state.invocations.push((function.to_string(), body));
            state
                .scripted
                .get_mut(function)
                .and_then(|queue| queue.pop_front())
        };
        self.invoked.notify_waiters();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        scripted.unwrap_or_else(|| Ok(json!({ "success": true })))
    }
}
