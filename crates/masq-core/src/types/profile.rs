//! Profile records
//!
//! The public part of a profile (`Profile`) is stored in plain local storage
//! under `profile-<id>` and travels in a profile push. Names and avatar are
//! sealed with a key derived from the password, so the public record alone
//! reveals nothing but the username.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{derive_password_key, generate_salt, KdfParams, SecretBox};
use crate::error::{MasqError, MasqResult};

/// Local storage key of a profile record.
pub fn profile_record_key(id: &str) -> String {
    format!("profile-{}", id)
}

/// Name of a profile's replicated database.
pub fn profile_db_name(id: &str) -> String {
    format!("profile-{}", id)
}

/// Fields only readable with the password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateFields {
    pub firstname: String,
    pub lastname: String,
    /// Avatar, typically a data URL
    pub image: String,
}

/// Public profile record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub username: String,
    pub kdf: KdfParams,
    /// Hex salt for the password KDF
    pub salt: String,
    /// Base64 of the sealed [`PrivateFields`]
    pub encrypted_fields: String,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Create a profile record and return it with its unlocked key.
    pub fn create(
        id: impl Into<String>,
        username: impl Into<String>,
        password: &str,
        fields: &PrivateFields,
        kdf: KdfParams,
    ) -> MasqResult<(Self, [u8; 32])> {
        let salt = generate_salt();
        let key = derive_password_key(password, &salt, &kdf)?;
        let mut profile = Self {
            id: id.into(),
            username: username.into(),
            kdf,
            salt: hex::encode(salt),
            encrypted_fields: String::new(),
            created_at: Utc::now(),
        };
        profile.seal_fields(&key, fields)?;
        Ok((profile, key))
    }

    pub fn derive_key(&self, password: &str) -> MasqResult<[u8; 32]> {
        let salt = hex::decode(&self.salt)
            .map_err(|e| MasqError::Crypto(format!("Invalid profile salt: {}", e)))?;
        derive_password_key(password, &salt, &self.kdf)
    }

    /// Check `password` and decrypt the private fields.
    ///
    /// Fails with `PasswordMismatch` if the password is wrong.
    pub fn unlock(&self, password: &str) -> MasqResult<([u8; 32], PrivateFields)> {
        let key = self.derive_key(password)?;
        let fields = self.open_fields(&key)?;
        debug!(profile = %self.id, "Profile unlocked");
        Ok((key, fields))
    }

    pub fn open_fields(&self, key: &[u8; 32]) -> MasqResult<PrivateFields> {
        let sealed = BASE64
            .decode(&self.encrypted_fields)
            .map_err(|e| MasqError::Serialization(format!("Invalid sealed fields: {}", e)))?;
        let plain = SecretBox::new(key)
            .open(&sealed)
            .map_err(|_| MasqError::PasswordMismatch)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    pub fn seal_fields(&mut self, key: &[u8; 32], fields: &PrivateFields) -> MasqResult<()> {
        let sealed = SecretBox::new(key).seal(&serde_json::to_vec(fields)?)?;
        self.encrypted_fields = BASE64.encode(sealed);
        Ok(())
    }

    /// The same profile under another id, as sent to a new device.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    pub fn details(&self, fields: PrivateFields) -> ProfileDetails {
        ProfileDetails {
            id: self.id.clone(),
            username: self.username.clone(),
            firstname: fields.firstname,
            lastname: fields.lastname,
            image: fields.image,
            created_at: self.created_at,
        }
    }
}

/// An unlocked profile as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDetails {
    pub id: String,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

/// Input of `add_profile`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProfile {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub image: String,
}

impl NewProfile {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn private_fields(&self) -> PrivateFields {
        PrivateFields {
            firstname: self.firstname.clone(),
            lastname: self.lastname.clone(),
            image: self.image.clone(),
        }
    }
}

/// Input of `update_profile`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub id: Option<String>,
    pub username: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub image: Option<String>,
}

impl ProfileUpdate {
    pub fn touches_private_fields(&self) -> bool {
        self.firstname.is_some() || self.lastname.is_some() || self.image.is_some()
    }

    pub fn apply_private(&self, fields: &mut PrivateFields) {
        if let Some(firstname) = &self.firstname {
            fields.firstname = firstname.clone();
        }
        if let Some(lastname) = &self.lastname {
            fields.lastname = lastname.clone();
        }
        if let Some(image) = &self.image {
            fields.image = image.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> PrivateFields {
        PrivateFields {
            firstname: "Alice".to_string(),
            lastname: "Liddell".to_string(),
            image: String::new(),
        }
    }

    #[test]
    fn test_unlock_with_right_password() {
        let (profile, key) =
            Profile::create("p1", "alice", "pass", &fields(), KdfParams::insecure_fast()).unwrap();
        let (unlocked, opened) = profile.unlock("pass").unwrap();
        assert_eq!(unlocked, key);
        assert_eq!(opened, fields());
    }

    #[test]
    fn test_wrong_password_is_mismatch() {
        let (profile, _) =
            Profile::create("p1", "alice", "pass", &fields(), KdfParams::insecure_fast()).unwrap();
        assert!(matches!(
            profile.unlock("wrong"),
            Err(MasqError::PasswordMismatch)
        ));
    }

    #[test]
    fn test_public_record_hides_names() {
        let (profile, _) =
            Profile::create("p1", "alice", "pass", &fields(), KdfParams::insecure_fast()).unwrap();
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("alice"));
        assert!(!json.contains("Liddell"));
        assert!(json.contains("encryptedFields"));
    }

    #[test]
    fn test_with_id_keeps_secrets_readable() {
        let (profile, _) =
            Profile::create("p1", "alice", "pass", &fields(), KdfParams::insecure_fast()).unwrap();
        let copy = profile.with_id("p1-copy");
        assert_eq!(copy.id, "p1-copy");
        assert_eq!(copy.unlock("pass").unwrap().1, fields());
    }

    #[test]
    fn test_update_private_fields() {
        let update = ProfileUpdate {
            id: Some("p1".to_string()),
            lastname: Some("Carroll".to_string()),
            ..Default::default()
        };
        assert!(update.touches_private_fields());
        let mut f = fields();
        update.apply_private(&mut f);
        assert_eq!(f.lastname, "Carroll");
        assert_eq!(f.firstname, "Alice");
    }
}
