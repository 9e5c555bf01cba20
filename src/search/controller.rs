//! Search execution driven by the debounced query and the current filters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{functions, BackendError, FunctionBackend};
use crate::catalog::Content;

use super::debounce::Debouncer;
use super::filters::{SearchFilters, SearchPage, SearchRequest, SearchResponse};

/// Calls the remote search function.
pub struct SearchService {
    functions: Arc<dyn FunctionBackend>,
    page_size: usize,
}

impl SearchService {
    pub fn new(functions: Arc<dyn FunctionBackend>, page_size: usize) -> Self {
        Self {
            functions,
            page_size,
        }
    }

    /// First page of results for `query`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<SearchPage, BackendError> {
        let body = serde_json::to_value(SearchRequest {
            query,
            filters,
            limit: self.page_size,
            offset: 0,
        })?;
        debug!("Searching for '{}'", query);
        let response = self.functions.invoke(functions::SEARCH_CONTENT, body).await?;
        let response: SearchResponse = serde_json::from_value(response)?;
        Ok(response.data.unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SearchState {
    /// Nothing to search for.
    #[default]
    Idle,
    Loading {
        query: String,
    },
    Ready {
        query: String,
        results: Vec<Content>,
        total: u64,
    },
    Failed {
        query: String,
        message: String,
    },
}

/// Owns the debounced query, the filters and the published search state.
pub struct SearchController {
    query: Debouncer<String>,
    filters: watch::Sender<SearchFilters>,
    state: watch::Receiver<SearchState>,
    shutdown: CancellationToken,
}

impl SearchController {
    pub fn start(service: Arc<SearchService>, quiet: Duration) -> Self {
        let query = Debouncer::new(String::new(), quiet);
        let (filters, filters_rx) = watch::channel(SearchFilters::default());
        let (state_tx, state) = watch::channel(SearchState::Idle);
        let shutdown = CancellationToken::new();

        tokio::spawn(run(
            service,
            query.subscribe(),
            filters_rx,
            state_tx,
            shutdown.clone(),
        ));

        Self {
            query,
            filters,
            state,
            shutdown,
        }
    }

    /// Raw keystrokes; a search only runs once typing pauses.
    pub fn set_query(&self, query: &str) {
        self.query.push(query.to_string());
    }

    /// Takes effect right away for the current debounced query.
    pub fn set_filters(&self, filters: SearchFilters) {
        self.filters.send_if_modified(|current| {
            if *current == filters {
                return false;
            }
            *current = filters;
            true
        });
    }

    pub fn filters(&self) -> SearchFilters {
        self.filters.borrow().clone()
    }

    pub fn debounced_query(&self) -> String {
        self.query.current()
    }

    pub fn state(&self) -> SearchState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchState> {
        self.state.clone()
    }

    /// Waits for the next settled state (`Idle`, `Ready` or `Failed`).
    pub async fn settled(&self) -> SearchState {
        let mut rx = self.subscribe();
        let settled = rx
            .wait_for(|state| !matches!(state, SearchState::Loading { .. }))
            .await;
        match settled {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    service: Arc<SearchService>,
    mut query_rx: watch::Receiver<String>,
    mut filters_rx: watch::Receiver<SearchFilters>,
    state: watch::Sender<SearchState>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = query_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = filters_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        // A change while a search runs drops that search and starts over.
        loop {
            let query = query_rx.borrow_and_update().clone();
            let filters = filters_rx.borrow_and_update().clone();

            if query.trim().is_empty() {
                state.send_replace(SearchState::Idle);
                break;
            }

            state.send_replace(SearchState::Loading {
                query: query.clone(),
            });
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = query_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                changed = filters_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                result = service.search(&query, &filters) => {
                    let next = match result {
                        Ok(page) => SearchState::Ready {
                            query,
                            results: page.results,
                            total: page.total,
                        },
                        Err(e) => {
                            warn!("Search failed: {}", e);
                            SearchState::Failed {
                                query,
                                message: e.to_string(),
                            }
                        }
                    };
                    state.send_replace(next);
                    break;
                }
            }
        }
    }
    debug!("Search loop stopped");
}
