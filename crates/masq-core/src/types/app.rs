//! Registered applications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MasqError, MasqResult};

/// Path prefix of app records in a profile database.
pub const APPS_PREFIX: &str = "apps/";

pub fn app_path(app_id: &str) -> String {
    format!("{}{}", APPS_PREFIX, app_id)
}

/// Check that `app_id` can name an app database.
///
/// Ids become one segment of a database name, so `/` is not allowed.
pub fn validate_app_id(app_id: &str) -> MasqResult<()> {
    if app_id.is_empty() {
        return Err(MasqError::MissingIdentifier);
    }
    if app_id.contains('/') {
        return Err(MasqError::InvalidRequest(format!(
            "app id {:?} contains '/'",
            app_id
        )));
    }
    Ok(())
}

/// Name of the app database a profile keeps for `app_id`.
pub fn app_db_name(profile_id: &str, app_id: &str) -> String {
    format!("apps/{}/{}", profile_id, app_id)
}

/// An application known to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub app_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Input of `add_app`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApp {
    pub app_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

impl NewApp {
    pub fn new(app_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn into_app(self) -> App {
        App {
            app_id: self.app_id,
            name: self.name,
            description: self.description,
            url: self.url,
            created_at: Utc::now(),
        }
    }
}
