//! Debounced catalog search.

mod controller;
mod debounce;
mod filters;

pub use controller::{SearchController, SearchService, SearchState};
pub use debounce::{Debouncer, DEFAULT_QUIET_PERIOD};
pub use filters::{Quality, SearchFilters, SearchForm, SearchPage, SearchRequest, ANY, DEFAULT_PAGE_SIZE};
