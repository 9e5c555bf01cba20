//! Per-user watchlist.

mod toggle;

pub use toggle::{
    Membership, WatchlistAction, WatchlistEntry, WatchlistError, WatchlistToggle, WATCHLIST_TABLE,
};
