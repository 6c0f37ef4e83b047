//! Domain types for the identity and profile stores.
//!
//! Both stores key their records by [`UserId`]. The identity store owns the
//! id; a profile may only be written once the identity id is known.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque identifier assigned by the identity store at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Email address used to correlate an identity with its profile.
///
/// The raw value is kept as entered; comparisons between records go through
/// [`Email::normalized`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(pub String);

impl Email {
    /// Trimmed, ASCII-lowercased form used as the correlation key.
    pub fn normalized(&self) -> String {
        self.0.trim().to_ascii_lowercase()
    }

    /// The part before `@`, or the whole address when there is none.
    pub fn local_part(&self) -> &str {
        let trimmed = self.0.trim();
        trimmed.split('@').next().unwrap_or(trimmed)
    }

    /// Minimal shape check: one `@` with text on both sides.
    pub fn is_plausible(&self) -> bool {
        let trimmed = self.0.trim();
        match trimmed.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            }
            None => false,
        }
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Email {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Email {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Application role carried by a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Supplier,
    #[default]
    Customer,
    Influencer,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Supplier, Role::Customer, Role::Influencer];

    /// Guess a role from the email local part, falling back to `default`.
    ///
    /// Seeded accounts follow the `admin@`, `supplier@` / `fournisseur@`,
    /// `influencer@` naming; everything else is a customer unless configured
    /// otherwise.
    pub fn infer(email: &Email, default: Role) -> Role {
        let local = email.local_part().to_ascii_lowercase();
        if local.contains("admin") {
            Role::Admin
        } else if local.contains("supplier") || local.contains("fournisseur") {
            Role::Supplier
        } else if local.contains("influenc") {
            Role::Influencer
        } else {
            default
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Supplier => write!(f, "supplier"),
            Role::Customer => write!(f, "customer"),
            Role::Influencer => write!(f, "influencer"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "supplier" => Ok(Role::Supplier),
            "customer" => Ok(Role::Customer),
            "influencer" => Ok(Role::Influencer),
            other => Err(format!(
                "unknown role '{other}'; expected: admin, supplier, customer, influencer"
            )),
        }
    }
}

/// Which backing store a record, batch or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Identity,
    Profile,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Identity => write!(f, "identity"),
            StoreKind::Profile => write!(f, "profile"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An authentication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: UserId,
    pub email: Email,
    /// Opaque; written at creation and never read back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_hash: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Notification toggles inside [`ProfileSettings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub email: bool,
    pub push: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            email: true,
            push: false,
        }
    }
}

/// Per-user configuration blob stored with the profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    pub language: String,
    pub currency: String,
    pub notifications: NotificationSettings,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            language: "fr".to_string(),
            currency: "EUR".to_string(),
            notifications: NotificationSettings::default(),
        }
    }
}

/// An application-level user document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub id: UserId,
    pub email: Email,
    pub role: Role,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settings: ProfileSettings,
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub history: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ProfileRecord {
    /// Default profile for an identity that has none.
    pub fn for_identity(identity: &IdentityRecord, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            role,
            name: display_name(&identity.email),
            company: None,
            is_active: !identity.disabled,
            created_at: now,
            settings: ProfileSettings::default(),
            favorites: Vec::new(),
            messages: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Copy of this profile moved onto `identity`'s id and email.
    ///
    /// Everything the user configured (role, name, company, settings and the
    /// reserved sequences) is carried over.
    pub fn rekeyed_to(&self, identity: &IdentityRecord) -> Self {
        Self {
            id: identity.id.clone(),
            email: identity.email.clone(),
            ..self.clone()
        }
    }
}

/// `jean.dupont@x.fr` → `Jean Dupont`.
fn display_name(email: &Email) -> String {
    email
        .local_part()
        .split(['.', '_', '-', '+'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
