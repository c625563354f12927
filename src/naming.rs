//! Deterministic resource naming and path confinement.
//!
//! Every container, network and in-container path the daemon touches for a
//! tenant is derived here. Tenant identifiers and data-source references are
//! re-validated on construction, so no caller can smuggle a name separator or
//! a traversal component into an engine call.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_LEN: usize = 64;

/// Maximum length of a data-source reference.
pub const MAX_DATA_SOURCE_LEN: usize = 128;

/// Separator between the parts of a resource name. Never valid inside a tenant id.
const SEPARATOR: char = '-';

static TENANT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_]*$").expect("valid tenant pattern"));

static SEGMENT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid segment pattern"));

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._\-/][a-z0-9]+)*$").expect("valid image pattern")
});

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").expect("valid tag pattern"));

/// Naming validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamingError {
    /// Tenant identifier is empty
    #[error("tenant identifier is empty")]
    EmptyTenant,

    /// Tenant identifier exceeds the length limit
    #[error("tenant identifier exceeds {MAX_TENANT_LEN} characters")]
    TenantTooLong,

    /// Tenant identifier contains characters outside `[A-Za-z0-9_]`
    #[error("tenant identifier '{0}' contains invalid characters")]
    InvalidTenant(String),

    /// Data-source reference is malformed
    #[error("invalid data source reference '{0}'")]
    InvalidDataSource(String),

    /// Image name or tag is malformed
    #[error("invalid image reference '{0}'")]
    InvalidImage(String),
}

/// Path confinement errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Path tries to leave its root
    #[error("path '{0}' escapes its root")]
    Traversal(String),

    /// Path contains a NUL byte or a backslash
    #[error("path '{0}' contains forbidden characters")]
    ForbiddenCharacter(String),
}

/// Validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is empty, too long, or contains
    /// anything but ASCII alphanumerics and `_`.
    pub fn parse(raw: &str) -> Result<Self, NamingError> {
        if raw.is_empty() {
            return Err(NamingError::EmptyTenant);
        }
        if raw.len() > MAX_TENANT_LEN {
            return Err(NamingError::TenantTooLong);
        }
        if !TENANT_PATTERN.is_match(raw) {
            return Err(NamingError::InvalidTenant(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = NamingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Validated reference to the dataset a compute container serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSourceRef(String);

impl DataSourceRef {
    /// Validate a `/`-separated data-source reference.
    ///
    /// # Errors
    ///
    /// Returns error for empty or `.`/`..` segments, characters outside
    /// `[A-Za-z0-9_.-]`, or references longer than [`MAX_DATA_SOURCE_LEN`].
    pub fn parse(raw: &str) -> Result<Self, NamingError> {
        let invalid = || NamingError::InvalidDataSource(raw.to_string());

        if raw.is_empty() || raw.len() > MAX_DATA_SOURCE_LEN {
            return Err(invalid());
        }

        for segment in raw.split('/') {
            if segment == "." || segment == ".." || !SEGMENT_PATTERN.is_match(segment) {
                return Err(invalid());
            }
        }

        Ok(Self(raw.to_string()))
    }

    /// Get the reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataSourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated `name:tag` image reference of a compute container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    name: String,
    tag: String,
}

impl ImageRef {
    /// Validate an image name (lowercase path components) and a tag.
    pub fn parse(name: &str, tag: &str) -> Result<Self, NamingError> {
        if name.len() > 255 || !IMAGE_PATTERN.is_match(name) || !TAG_PATTERN.is_match(tag) {
            return Err(NamingError::InvalidImage(format!("{name}:{tag}")));
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// Canonical engine resource names for every tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    prefix: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self::new(crate::env::DEFAULT_NAME_PREFIX)
    }
}

impl ResourceNames {
    /// Create a naming scheme with the given prefix.
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Name prefix shared by every resource.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Compute container name.
    pub fn compute(&self, tenant: &TenantId) -> String {
        self.role(Role::Compute, tenant)
    }

    /// Data volume holder container name.
    pub fn data(&self, tenant: &TenantId) -> String {
        self.role(Role::Data, tenant)
    }

    /// Isolated network name.
    pub fn network(&self, tenant: &TenantId) -> String {
        self.role(Role::Network, tenant)
    }

    /// Common prefix of every helper container of a tenant.
    pub fn helper_prefix(&self, tenant: &TenantId) -> String {
        format!("{}{}", self.role(Role::Helper, tenant), SEPARATOR)
    }

    /// Fresh, unique helper container name.
    pub fn helper(&self, tenant: &TenantId) -> String {
        format!(
            "{}{}",
            self.helper_prefix(tenant),
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Whether an engine-reported container name is one of the tenant's helpers.
    ///
    /// Engine listings report names with a leading `/`.
    pub fn is_helper_of(&self, name: &str, tenant: &TenantId) -> bool {
        let name = name.strip_prefix('/').unwrap_or(name);
        name.strip_prefix(&self.helper_prefix(tenant))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains(SEPARATOR))
    }

    fn role(&self, role: Role, tenant: &TenantId) -> String {
        format!(
            "{prefix}{sep}{role}{sep}{tenant}",
            prefix = self.prefix,
            sep = SEPARATOR,
            role = role.as_str(),
            tenant = tenant.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Compute,
    Data,
    Network,
    Helper,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Compute => "compute",
            Role::Data => "data",
            Role::Network => "net",
            Role::Helper => "helper",
        }
    }
}

/// Join a caller-supplied relative path under an absolute root.
///
/// A leading `/` is accepted and means "relative to the root". Empty and `.`
/// components are dropped. `..` components, NUL bytes and backslashes are
/// rejected outright rather than normalized.
///
/// # Errors
///
/// Returns [`PathError`] if the path could resolve outside `root`.
pub fn confine(root: &str, relative: &str) -> Result<String, PathError> {
    if relative.contains('\0') || relative.contains('\\') {
        return Err(PathError::ForbiddenCharacter(relative.escape_debug().to_string()));
    }

    let mut joined = root.trim_end_matches('/').to_string();
    for component in relative.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(relative.to_string())),
            part => {
                joined.push('/');
                joined.push_str(part);
            }
        }
    }

    if joined.is_empty() {
        joined.push('/');
    }
    Ok(joined)
}

/// Split an absolute in-container path into its parent directory and file name.
///
/// Returns `None` for the filesystem root.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, name))
}
