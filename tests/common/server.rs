//! Mock backend lifecycle management
//!
//! Serves the auth issuer (`/auth/v1`), the table API (`/rest/v1`) and the
//! remote functions (`/functions/v1`) from in-memory state. Each test gets an
//! isolated server on a random port.

use super::constants::*;
use super::fixtures::create_test_tables;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use lumajoyaron_client::backend::{value_as_param, BackendClient, Filter};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Sign-up request as received by the issuer
#[derive(Debug, Clone, PartialEq)]
pub struct SignUpRecord {
    pub email: String,
    pub full_name: String,
    pub redirect_to: String,
}

/// One remote function invocation
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub body: Value,
    /// Account behind the bearer token, `None` for anonymous calls
    pub user_email: Option<String>,
}

#[derive(Debug, Clone)]
struct MockUser {
    id: Uuid,
    email: String,
    password: String,
    full_name: String,
    confirmed: bool,
}

impl MockUser {
    fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "email": self.email,
            "email_confirmed_at": self.confirmed.then_some("2024-01-01T00:00:00Z"),
            "user_metadata": { "full_name": self.full_name },
        })
    }
}

#[derive(Default)]
struct MockState {
    users: HashMap<String, MockUser>,
    /// Token to account email
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    auto_confirm: bool,
    tables: HashMap<String, Vec<Value>>,
    next_row_id: i64,
    signups: Vec<SignUpRecord>,
    function_calls: Vec<(String, FunctionCall)>,
    failing_functions: HashSet<String>,
    failing_tables: HashSet<String>,
    function_delays: HashMap<String, Duration>,
    failing_logout: bool,
    logouts: usize,
    token_lifetime: Option<i64>,
}

impl MockState {
    fn issue_tokens(&mut self, email: &str) -> Value {
        let access_token = format!("access-{}", Uuid::new_v4());
        let refresh_token = format!("refresh-{}", Uuid::new_v4());
        self.access_tokens
            .insert(access_token.clone(), email.to_string());
        self.refresh_tokens
            .insert(refresh_token.clone(), email.to_string());
        let user = self
            .users
            .get(email)
            .map(MockUser::to_json)
            .unwrap_or(Value::Null);
        json!({
            "access_token": access_token,
            "refresh_token": refresh_token,
            "token_type": "bearer",
            "expires_in": self.token_lifetime.unwrap_or(TOKEN_LIFETIME_SECS),
            "user": user,
        })
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<MockUser> {
        let token = bearer(headers)?;
        let email = self.access_tokens.get(&token)?;
        self.users.get(email).cloned()
    }
}

type SharedState = Arc<Mutex<MockState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, MockState> {
    state.lock().unwrap()
}

/// Mock backend instance
///
/// When dropped, the server shuts down.
pub struct TestServer {
    /// Base URL for the client under test (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    state: SharedState,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawns a mock backend on a random port, seeded with the fixture
    /// catalog and one confirmed account (`TEST_EMAIL`).
    pub async fn spawn() -> Self {
        let state: SharedState = Arc::new(Mutex::new(MockState {
            tables: create_test_tables(),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/health", get(health))
            .route("/auth/v1/token", post(token))
            .route("/auth/v1/signup", post(signup))
            .route("/auth/v1/logout", post(logout))
            .route("/auth/v1/user", get(current_user))
            .route(
                "/rest/v1/{table}",
                get(select_rows).post(insert_row).patch(update_rows),
            )
            .route("/functions/v1/{name}", post(invoke_function))
            .with_state(state.clone());

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            state,
            _shutdown_tx: Some(shutdown_tx),
        };
        server.add_user(TEST_EMAIL, TEST_PASSWORD, TEST_FULL_NAME, true);
        server.wait_for_ready().await;
        server
    }

    /// A fresh client pointed at this server
    pub fn client(&self) -> Arc<BackendClient> {
        Arc::new(
            BackendClient::new(
                self.base_url.clone(),
                ANON_KEY.to_string(),
                REQUEST_TIMEOUT_SECS,
            )
            .expect("Failed to build backend client"),
        )
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn add_user(&self, email: &str, password: &str, full_name: &str, confirmed: bool) -> Uuid {
        let user = MockUser {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
            confirmed,
        };
        let id = user.id;
        lock(&self.state).users.insert(email.to_string(), user);
        id
    }

    pub fn user_id(&self, email: &str) -> Uuid {
        lock(&self.state).users[email].id
    }

    pub fn is_confirmed(&self, email: &str) -> bool {
        lock(&self.state)
            .users
            .get(email)
            .is_some_and(|u| u.confirmed)
    }

    /// New sign-ups get a session right away instead of a confirmation email
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        lock(&self.state).auto_confirm = auto_confirm;
    }

    /// Confirms `email` and returns the link the confirmation email points to
    pub fn confirmation_url(&self, email: &str) -> String {
        let mut state = lock(&self.state);
        if let Some(user) = state.users.get_mut(email) {
            user.confirmed = true;
        }
        let grant = state.issue_tokens(email);
        format!(
            "{}/auth/callback#access_token={}&expires_in={}&refresh_token={}&token_type=bearer&type=signup",
            SITE_URL, grant["access_token"].as_str().unwrap_or_default(), TOKEN_LIFETIME_SECS,
            grant["refresh_token"].as_str().unwrap_or_default()
        )
    }

    pub fn signups(&self) -> Vec<SignUpRecord> {
        lock(&self.state).signups.clone()
    }

    pub fn fail_logout(&self) {
        lock(&self.state).failing_logout = true;
    }

    pub fn logouts(&self) -> usize {
        lock(&self.state).logouts
    }

    /// Lifetime, in seconds, of the tokens issued from now on
    pub fn set_token_lifetime(&self, seconds: i64) {
        lock(&self.state).token_lifetime = Some(seconds);
    }

    /// Every refresh token issued so far stops working
    pub fn revoke_refresh_tokens(&self) {
        lock(&self.state).refresh_tokens.clear();
    }

    // ========================================================================
    // Tables
    // ========================================================================

    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.state)
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn put_row(&self, table: &str, row: Value) {
        lock(&self.state)
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Reads on `table` answer 500
    pub fn fail_table(&self, table: &str) {
        lock(&self.state).failing_tables.insert(table.to_string());
    }

    pub async fn wait_for_rows(&self, table: &str, count: usize) -> Vec<Value> {
        let start = std::time::Instant::now();
        loop {
            let rows = self.rows(table);
            if rows.len() >= count {
                return rows;
            }
            if start.elapsed() > Duration::from_secs(REQUEST_TIMEOUT_SECS) {
                panic!("Expected {} rows in {}, found {}", count, table, rows.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ========================================================================
    // Functions
    // ========================================================================

    pub fn function_calls(&self, name: &str) -> Vec<FunctionCall> {
        lock(&self.state)
            .function_calls
            .iter()
            .filter(|(function, _)| function == name)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn fail_function(&self, name: &str) {
        lock(&self.state)
            .failing_functions
            .insert(name.to_string());
    }

    pub fn restore_function(&self, name: &str) {
        lock(&self.state).failing_functions.remove(name);
    }

    /// Holds every answer of `name` for `delay`
    pub fn delay_function(&self, name: &str, delay: Duration) {
        lock(&self.state)
            .function_delays
            .insert(name.to_string(), delay);
    }

    pub async fn wait_for_function_calls(&self, name: &str, count: usize) -> Vec<FunctionCall> {
        let start = std::time::Instant::now();
        loop {
            let calls = self.function_calls(name);
            if calls.len() >= count {
                return calls;
            }
            if start.elapsed() > Duration::from_secs(REQUEST_TIMEOUT_SECS) {
                panic!("Expected {} calls to {}, got {}", count, name, calls.len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn error(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn unauthorized() -> Response {
    error(StatusCode::UNAUTHORIZED, json!({ "msg": "invalid JWT" }))
}

fn check_apikey(headers: &HeaderMap) -> Result<(), Response> {
    match headers.get("apikey").and_then(|v| v.to_str().ok()) {
        Some(ANON_KEY) => Ok(()),
        _ => Err(error(
            StatusCode::UNAUTHORIZED,
            json!({ "message": "Invalid API key" }),
        )),
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn health() -> &'static str {
    "ok"
}

async fn token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let mut state = lock(&state);

    match params.get("grant_type").map(String::as_str) {
        Some("password") => {
            let email = body["email"].as_str().unwrap_or_default();
            let password = body["password"].as_str().unwrap_or_default();
            let Some(user) = state.users.get(email).cloned() else {
                return invalid_grant("Invalid login credentials");
            };
            if user.password != password {
                return invalid_grant("Invalid login credentials");
            }
            if !user.confirmed {
                return error(
                    StatusCode::BAD_REQUEST,
                    json!({ "error_code": "email_not_confirmed", "msg": "Email not confirmed" }),
                );
            }
            Json(state.issue_tokens(email)).into_response()
        }
        Some("refresh_token") => {
            let refresh_token = body["refresh_token"].as_str().unwrap_or_default();
            match state.refresh_tokens.remove(refresh_token) {
                Some(email) => Json(state.issue_tokens(&email)).into_response(),
                None => invalid_grant("Invalid Refresh Token: Refresh Token Not Found"),
            }
        }
        _ => error(
            StatusCode::BAD_REQUEST,
            json!({ "error": "unsupported_grant_type" }),
        ),
    }
}

fn invalid_grant(description: &str) -> Response {
    error(
        StatusCode::BAD_REQUEST,
        json!({ "error": "invalid_grant", "error_description": description }),
    )
}

async fn signup(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let email = body["email"].as_str().unwrap_or_default().to_string();
    let password = body["password"].as_str().unwrap_or_default().to_string();
    let full_name = body["data"]["full_name"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let mut state = lock(&state);
    state.signups.push(SignUpRecord {
        email: email.clone(),
        full_name: full_name.clone(),
        redirect_to: params.get("redirect_to").cloned().unwrap_or_default(),
    });

    if state.users.contains_key(&email) {
        return error(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "code": 422, "error_code": "user_already_exists", "msg": "User already registered" }),
        );
    }

    let user = MockUser {
        id: Uuid::new_v4(),
        email: email.clone(),
        password,
        full_name,
        confirmed: state.auto_confirm,
    };
    let confirmed = user.confirmed;
    let user_json = user.to_json();
    state.users.insert(email.clone(), user);

    if confirmed {
        Json(state.issue_tokens(&email)).into_response()
    } else {
        Json(user_json).into_response()
    }
}

async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let mut state = lock(&state);
    state.logouts += 1;
    if state.failing_logout {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "msg": "logout unavailable" }),
        );
    }
    match bearer(&headers) {
        Some(token) if state.access_tokens.remove(&token).is_some() => {
            StatusCode::NO_CONTENT.into_response()
        }
        _ => unauthorized(),
    }
}

async fn current_user(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    match lock(&state).user_for(&headers) {
        Some(user) => Json(user.to_json()).into_response(),
        None => unauthorized(),
    }
}

fn parse_filter(column: &str, value: &str) -> Filter {
    if let Some(list) = value.strip_prefix("in.(").and_then(|v| v.strip_suffix(')')) {
        return Filter::In {
            column: column.to_string(),
            values: list
                .split(',')
                .filter(|v| !v.is_empty())
                .map(|v| v.trim_matches('"').to_string())
                .collect(),
        };
    }
    Filter::Eq {
        column: column.to_string(),
        value: value.strip_prefix("eq.").unwrap_or(value).to_string(),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => value_as_param(a).cmp(&value_as_param(b)),
    }
}

/// Sorts by `order=col.desc,col2.asc`
fn sort_rows(rows: &mut [Value], order: &str) {
    let keys: Vec<(String, bool)> = order
        .split(',')
        .filter_map(|part| {
            let (column, direction) = part.rsplit_once('.')?;
            Some((column.to_string(), direction != "desc"))
        })
        .collect();

    rows.sort_by(|a, b| {
        for (column, ascending) in &keys {
            let ordering = compare_values(&a[column.as_str()], &b[column.as_str()]);
            let ordering = if *ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

async fn select_rows(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let state = lock(&state);
    if state.failing_tables.contains(&table) {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "message": format!("relation \"{}\" is unavailable", table) }),
        );
    }
    let Some(rows) = state.tables.get(&table) else {
        return error(
            StatusCode::NOT_FOUND,
            json!({ "code": "42P01", "message": format!("relation \"public.{}\" does not exist", table) }),
        );
    };

    let mut filters = Vec::new();
    let mut order = None;
    let mut offset = 0usize;
    let mut limit = None;
    for (key, value) in &params {
        match key.as_str() {
            "select" => {}
            "order" => order = Some(value.clone()),
            "offset" => offset = value.parse().unwrap_or(0),
            "limit" => limit = value.parse::<usize>().ok(),
            column => filters.push(parse_filter(column, value)),
        }
    }

    let mut matched: Vec<Value> = rows
        .iter()
        .filter(|row| filters.iter().all(|f| f.matches(row)))
        .cloned()
        .collect();
    if let Some(order) = order {
        sort_rows(&mut matched, &order);
    }
    let total = matched.len();
    let page: Vec<Value> = matched
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    let wants_count = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("count=exact"));
    let range = if page.is_empty() {
        format!("*/{}", total)
    } else {
        format!("{}-{}/{}", offset, offset + page.len() - 1, total)
    };

    let mut response = Json(Value::Array(page)).into_response();
    if wants_count {
        response
            .headers_mut()
            .insert("content-range", HeaderValue::from_str(&range).unwrap());
    }
    response
}

async fn insert_row(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(row): Json<Value>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let mut state = lock(&state);
    if state.failing_tables.contains(&table) {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "message": "insert failed" }),
        );
    }
    state.tables.entry(table).or_default().push(row);
    StatusCode::CREATED.into_response()
}

async fn update_rows(
    State(state): State<SharedState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    Json(patch): Json<Value>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }
    let filters: Vec<Filter> = params
        .iter()
        .map(|(column, value)| parse_filter(column, value))
        .collect();

    let mut state = lock(&state);
    if let (Some(rows), Some(patch)) = (state.tables.get_mut(&table), patch.as_object()) {
        for row in rows
            .iter_mut()
            .filter(|row| filters.iter().all(|f| f.matches(row)))
        {
            if let Some(fields) = row.as_object_mut() {
                for (key, value) in patch {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn invoke_function(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_apikey(&headers) {
        return response;
    }

    let (user, delay, failing) = {
        let mut state = lock(&state);
        let user = state.user_for(&headers);
        state.function_calls.push((
            name.clone(),
            FunctionCall {
                body: body.clone(),
                user_email: user.as_ref().map(|u| u.email.clone()),
            },
        ));
        (
            user,
            state.function_delays.get(&name).copied(),
            state.failing_functions.contains(&name),
        )
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if failing {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": format!("{} failed", name) }),
        );
    }

    let mut state = lock(&state);
    match (name.as_str(), user) {
        ("search-content", _) => Json(search_content(&state, &body)).into_response(),
        ("update-progress", Some(_)) => Json(json!({ "success": true })).into_response(),
        ("manage-watchlist", Some(user)) => manage_watchlist(&mut state, &user, &body),
        ("update-progress" | "manage-watchlist", None) => unauthorized(),
        _ => error(
            StatusCode::NOT_FOUND,
            json!({ "error": "Function not found" }),
        ),
    }
}

fn search_content(state: &MockState, body: &Value) -> Value {
    let query = body["query"].as_str().unwrap_or_default().to_lowercase();
    let filters = &body["filters"];
    let limit = body["limit"].as_u64().unwrap_or(50) as usize;
    let offset = body["offset"].as_u64().unwrap_or(0) as usize;

    let results: Vec<Value> = state
        .tables
        .get("content")
        .into_iter()
        .flatten()
        .filter(|row| {
            row["title"]
                .as_str()
                .unwrap_or_default()
                .to_lowercase()
                .contains(&query)
                && filters
                    .get("content_type")
                    .map_or(true, |t| row["content_type"] == *t)
                && filters
                    .get("release_year")
                    .map_or(true, |y| row["release_year"] == *y)
                && filters.get("quality").map_or(true, |q| row["quality"] == *q)
                && filters
                    .get("min_rating")
                    .and_then(Value::as_f64)
                    .map_or(true, |min| row["imdb_rating"].as_f64().unwrap_or(0.0) >= min)
        })
        .cloned()
        .collect();

    let total = results.len();
    let page: Vec<Value> = results.into_iter().skip(offset).take(limit).collect();
    json!({ "data": { "results": page, "total": total } })
}

fn manage_watchlist(state: &mut MockState, user: &MockUser, body: &Value) -> Response {
    let Some(content_id) = body["contentId"].as_i64() else {
        return error(
            StatusCode::BAD_REQUEST,
            json!({ "error": "contentId is required" }),
        );
    };
    let user_id = user.id.to_string();
    state.next_row_id += 1;
    let row_id = state.next_row_id;
    // Later additions get later timestamps
    let added_at = DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + chrono::Duration::seconds(row_id);

    let rows = state
        .tables
        .entry("user_watchlist".to_string())
        .or_default();
    let is_entry =
        |row: &Value| row["user_id"] == user_id.as_str() && row["content_id"] == content_id;

    match body["action"].as_str() {
        Some("add") => {
            if !rows.iter().any(is_entry) {
                rows.push(json!({
                    "id": row_id,
                    "user_id": user_id,
                    "content_id": content_id,
                    "added_at": added_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                }));
            }
        }
        Some("remove") => rows.retain(|row| !is_entry(row)),
        _ => {
            return error(
                StatusCode::BAD_REQUEST,
                json!({ "error": "action must be add or remove" }),
            )
        }
    }
    Json(json!({ "success": true })).into_response()
}
