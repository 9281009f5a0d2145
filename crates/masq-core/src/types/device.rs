//! Device and app grant records stored in a profile database

use serde::{Deserialize, Serialize};

use crate::identity::WriterId;

/// Path prefix of device records in a profile database.
pub const DEVICES_PREFIX: &str = "devices/";

pub fn device_path(id: &str) -> String {
    format!("{}{}", DEVICES_PREFIX, id)
}

/// Local storage key holding the id of this device's record for a profile.
pub fn current_device_key(profile_id: &str) -> String {
    format!("device-{}", profile_id)
}

/// Write access of one device to one app database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppGrant {
    #[serde(rename = "id")]
    pub app_id: String,
    /// Root identity of the app database
    pub key: WriterId,
    /// Writer this device uses in the app database
    pub local_key: WriterId,
}

impl AppGrant {
    /// True for the device that created the app database.
    pub fn is_creator(&self) -> bool {
        self.key == self.local_key
    }
}

/// One physical device that joined a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: String,
    /// Writer this device uses in the profile database
    pub local_key: WriterId,
    #[serde(default)]
    pub apps: Vec<AppGrant>,
}

impl Device {
    pub fn grant(&self, app_id: &str) -> Option<&AppGrant> {
        self.apps.iter().find(|g| g.app_id == app_id)
    }

    /// Record `grant`, replacing an earlier one for the same app.
    ///
    /// Returns false if the device already held exactly this grant.
    pub fn upsert_grant(&mut self, grant: AppGrant) -> bool {
        match self.apps.iter_mut().find(|g| g.app_id == grant.app_id) {
            Some(existing) if *existing == grant => false,
            Some(existing) => {
                *existing = grant;
                true
            }
            None => {
                self.apps.push(grant);
                true
            }
        }
    }
}

/// Input of `add_device`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: String,
}

impl NewDevice {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::WriterKeypair;

    fn device() -> Device {
        Device {
            id: "d1".to_string(),
            name: "laptop".to_string(),
            description: String::new(),
            color: "#ff0000".to_string(),
            local_key: WriterKeypair::generate().public(),
            apps: Vec::new(),
        }
    }

    #[test]
    fn test_json_shape() {
        let mut d = device();
        let key = WriterKeypair::generate().public();
        d.upsert_grant(AppGrant {
            app_id: "app".to_string(),
            key,
            local_key: key,
        });
        let json: serde_json::Value = serde_json::to_value(&d).unwrap();
        assert_eq!(json["localKey"].as_str().unwrap().len(), 64);
        assert_eq!(json["apps"][0]["id"], "app");
        assert_eq!(json["apps"][0]["key"], json["apps"][0]["localKey"]);

        let back: Device = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
        assert!(back.grant("app").unwrap().is_creator());
    }

    #[test]
    fn test_upsert_grant() {
        let mut d = device();
        let key = WriterKeypair::generate().public();
        let grant = AppGrant {
            app_id: "app".to_string(),
            key,
            local_key: WriterKeypair::generate().public(),
        };
        assert!(d.upsert_grant(grant.clone()));
        assert!(!d.upsert_grant(grant.clone()));
        assert_eq!(d.apps.len(), 1);
        assert!(!d.grant("app").unwrap().is_creator());
    }
}
