//! The authenticated caller of an upstream-bound operation.
//!
//! A single sum type rather than bidirectional pointers between `DeviceCode`
//! and `UserCredential` (see DESIGN.md): the two only ever relate through
//! `osm_user_id`, never by foreign key.

use chrono::{DateTime, Utc};

use crate::models::{DeviceCode, UserCredential};

/// Either a device acting through its linked upstream credential, or an
/// authenticated admin-UI user acting through their own session tokens.
pub enum Principal {
    Device {
        device_code: String,
        osm_user_id: String,
        section_id: String,
        access_token: String,
        refresh_token: String,
        token_expires_at: DateTime<Utc>,
    },
    User {
        osm_user_id: String,
        access_token: String,
        refresh_token: String,
        token_expires_at: DateTime<Utc>,
    },
}

impl Principal {
    pub fn osm_user_id(&self) -> &str {
        match self {
            Self::Device { osm_user_id, .. } => osm_user_id,
            Self::User { osm_user_id, .. } => osm_user_id,
        }
    }

    pub fn access_token(&self) -> &str {
        match self {
            Self::Device { access_token, .. } => access_token,
            Self::User { access_token, .. } => access_token,
        }
    }

    pub fn refresh_token(&self) -> &str {
        match self {
            Self::Device { refresh_token, .. } => refresh_token,
            Self::User { refresh_token, .. } => refresh_token,
        }
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        match self {
            Self::Device { token_expires_at, .. } => *token_expires_at,
            Self::User { token_expires_at, .. } => *token_expires_at,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at() - now < chrono::Duration::minutes(5)
    }

    pub fn from_device_code(device_code: &DeviceCode) -> Option<Self> {
        Some(Self::Device {
            device_code: device_code.device_code.clone(),
            osm_user_id: device_code.osm_user_id.clone()?,
            section_id: device_code.section_id.clone()?,
            access_token: device_code.access_token.clone()?,
            refresh_token: device_code.refresh_token.clone()?,
            token_expires_at: device_code.token_expires_at?,
        })
    }

    pub fn from_user_credential(cred: &UserCredential) -> Self {
        Self::User {
            osm_user_id: cred.osm_user_id.clone(),
            access_token: cred.access_token.clone(),
            refresh_token: cred.refresh_token.clone(),
            token_expires_at: cred.token_expires_at,
        }
    }
}
