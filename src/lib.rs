//! Lumajoyaron Client Library
//!
//! Client side of the Lumajoyaron storefront: session handling, debounced
//! search, playback progress tracking and the watchlist, all talking to the
//! hosted backend through `backend::BackendClient`.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod playback;
pub mod profile;
pub mod search;
pub mod session;
pub mod sync;
pub mod watchlist;

// Re-export commonly used types for convenience
pub use backend::{AuthBackend, BackendClient, BackendError, DataBackend, FunctionBackend};
pub use catalog::CatalogService;
pub use config::{AppConfig, CliConfig, FileConfig};
pub use playback::{PlayerSession, ProgressSync};
pub use profile::ProfileService;
pub use search::{SearchController, SearchService};
pub use session::SessionStore;
pub use watchlist::WatchlistToggle;
