//! User profiles stored next to the auth identity.

mod service;

pub use service::{
    display_name, ProfileService, ProfileUpdate, UserProfile, DEFAULT_SUBSCRIPTION,
    PROFILES_TABLE,
};
