//! Records managed by the vault

mod app;
mod device;
mod profile;

pub use app::{app_db_name, app_path, validate_app_id, App, NewApp, APPS_PREFIX};
pub use device::{current_device_key, device_path, AppGrant, Device, NewDevice, DEVICES_PREFIX};
pub use profile::{
    profile_db_name, profile_record_key, NewProfile, PrivateFields, Profile, ProfileDetails,
    ProfileUpdate,
};
