use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{AuthUser, BackendError, DataBackend, Query};

pub const PROFILES_TABLE: &str = "user_profiles";

/// Subscription tier every new profile starts on.
pub const DEFAULT_SUBSCRIPTION: &str = "free";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub subscription_status: Option<String>,
    #[serde(default)]
    pub subscription_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.avatar_url.is_none()
    }
}

/// Name shown for a user: profile full name, else the email local part.
pub fn display_name(profile: Option<&UserProfile>, user: &AuthUser) -> String {
    profile
        .and_then(|p| p.full_name.as_deref())
        .filter(|name| !name.is_empty())
        .or_else(|| {
            user.email
                .as_deref()
                .and_then(|email| email.split('@').next())
                .filter(|local| !local.is_empty())
        })
        .unwrap_or("User")
        .to_string()
}

/// Reads and writes rows of the profile table.
pub struct ProfileService {
    data: Arc<dyn DataBackend>,
}

impl ProfileService {
    pub fn new(data: Arc<dyn DataBackend>) -> Self {
        Self { data }
    }

    pub async fn create_profile(
        &self,
        user_id: Uuid,
        full_name: Option<&str>,
    ) -> Result<(), BackendError> {
        debug!("Creating profile for {}", user_id);
        self.data
            .insert(
                PROFILES_TABLE,
                json!({
                    "id": user_id,
                    "full_name": full_name.unwrap_or(""),
                    "subscription_status": DEFAULT_SUBSCRIPTION,
                }),
            )
            .await
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, BackendError> {
        let query = Query::table(PROFILES_TABLE).eq("id", user_id).limit(1);
        self.data.select(&query).await?.decode_first()
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<(), BackendError> {
        if update.is_empty() {
            return Ok(());
        }
        let mut patch = serde_json::to_value(update)?;
        if let Some(fields) = patch.as_object_mut() {
            fields.insert("updated_at".to_string(), json!(Utc::now()));
        }
        let query = Query::table(PROFILES_TABLE).eq("id", user_id);
        self.data.update(&query, patch).await
    }
}
