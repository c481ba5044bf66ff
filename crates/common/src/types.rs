//! Core types for AlertWatch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// Coarse identity class used to decide whether a re-login is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Admin,
    Normal,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Admin => "admin",
            UserType::Normal => "normal",
        }
    }

    pub fn all() -> [UserType; 2] {
        [UserType::Admin, UserType::Normal]
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(UserType::Admin),
            "normal" | "user" => Ok(UserType::Normal),
            other => Err(Error::UnknownUserType(other.to_string())),
        }
    }
}

/// Username/password pair for one identity
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Browser storage state (the persisted credential artifact).
///
/// Mirrors the JSON shape Playwright produces for `context.storageState()`.
/// Both collections are required; a file missing either one fails to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub cookies: Vec<Cookie>,
    pub origins: Vec<OriginState>,
}

impl StorageState {
    /// A usable artifact carries at least one cookie.
    ///
    /// `origins` must be present (parsing enforces that) but may be empty:
    /// cookie-only sign-ins leave no local storage behind, and the cookie is
    /// what the dashboard authenticates with.
    pub fn is_structurally_valid(&self) -> bool {
        !self.cookies.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default = "default_cookie_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_cookie_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

/// Validity metadata stored next to each storage-state artifact.
///
/// On disk: `{ "timestamp": 1700000000000, "created": "...", "userType": "admin", "lastExtended": "..." }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Milliseconds since the Unix epoch at creation
    pub timestamp: i64,
    pub created: DateTime<Utc>,
    pub user_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_extended: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(user_type: UserType, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.timestamp_millis(),
            created: now,
            user_type: user_type.as_str().to_string(),
            last_extended: None,
        }
    }

    /// The instant validity is measured from
    pub fn anchor(&self) -> DateTime<Utc> {
        self.last_extended.unwrap_or(self.created)
    }
}

/// Element geometry as reported by the browser
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Geometry rounded to whole pixels, for stability comparison
    pub fn rounded(&self) -> (i64, i64, i64, i64) {
        (
            self.x.round() as i64,
            self.y.round() as i64,
            self.width.round() as i64,
            self.height.round() as i64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_type_parse() {
        assert_eq!("Admin".parse::<UserType>().unwrap(), UserType::Admin);
        assert_eq!("normal".parse::<UserType>().unwrap(), UserType::Normal);
        assert!("root".parse::<UserType>().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("ops@example.com", "hunter2");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("ops@example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_session_record_wire_format() {
        let now = Utc::now();
        let record = SessionRecord::new(UserType::Admin, now);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["userType"], "admin");
        assert_eq!(json["timestamp"], now.timestamp_millis());
        assert!(json.get("lastExtended").is_none());
        assert_eq!(record.anchor(), now);
    }

    #[test]
    fn test_storage_state_requires_both_collections() {
        let missing_origins = r#"{"cookies": [{"name": "sid", "value": "abc"}]}"#;
        assert!(serde_json::from_str::<StorageState>(missing_origins).is_err());

        let ok = r#"{"cookies": [{"name": "sid", "value": "abc", "httpOnly": true}], "origins": []}"#;
        let state: StorageState = serde_json::from_str(ok).unwrap();
        assert!(state.is_structurally_valid());
        assert!(state.cookies[0].http_only);
    }

    #[test]
    fn test_bounding_box_rounding() {
        let bbox = BoundingBox::new(10.4, 20.6, 100.49, 30.5);
        assert_eq!(bbox.rounded(), (10, 21, 100, 31));
    }
}
