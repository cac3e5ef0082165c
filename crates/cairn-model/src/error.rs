//! Structured errors reported by the item model and the plan engine.
//!
//! Every rejected request yields a [`ModelErrors`] list. Each entry carries
//! an [`ErrorKind`], a human-readable message, and (where it applies) the
//! offending item path and property name. Independent violations found in
//! one request are reported together rather than failing on the first.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::ItemPath;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// The kind of a model error. Rendered (and serialized) with an `Error`
/// suffix, e.g. `ValidationError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ErrorKind {
    InvalidLocation,
    InvalidType,
    InvalidChildType,
    ChildNotAllowed,
    MissingRequiredProperty,
    PropertyNotAllowed,
    Validation,
    InvalidProperty,
    InvalidRequest,
    MethodNotAllowed,
    ItemExists,
    DoNothingPlan,
    InvalidPlanState,
    MissingRequiredItem,
    Cardinality,
    Plugin,
    InternalServer,
}

/// Broad grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Location,
    Type,
    Property,
    Permission,
    State,
    Plugin,
}

impl ErrorKind {
    const ALL: [ErrorKind; 17] = [
        Self::InvalidLocation,
        Self::InvalidType,
        Self::InvalidChildType,
        Self::ChildNotAllowed,
        Self::MissingRequiredProperty,
        Self::PropertyNotAllowed,
        Self::Validation,
        Self::InvalidProperty,
        Self::InvalidRequest,
        Self::MethodNotAllowed,
        Self::ItemExists,
        Self::DoNothingPlan,
        Self::InvalidPlanState,
        Self::MissingRequiredItem,
        Self::Cardinality,
        Self::Plugin,
        Self::InternalServer,
    ];

    /// Name shown to callers, e.g. `"ItemExistsError"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidLocation => "InvalidLocationError",
            Self::InvalidType => "InvalidTypeError",
            Self::InvalidChildType => "InvalidChildTypeError",
            Self::ChildNotAllowed => "ChildNotAllowedError",
            Self::MissingRequiredProperty => "MissingRequiredPropertyError",
            Self::PropertyNotAllowed => "PropertyNotAllowedError",
            Self::Validation => "ValidationError",
            Self::InvalidProperty => "InvalidPropertyError",
            Self::InvalidRequest => "InvalidRequestError",
            Self::MethodNotAllowed => "MethodNotAllowedError",
            Self::ItemExists => "ItemExistsError",
            Self::DoNothingPlan => "DoNothingPlanError",
            Self::InvalidPlanState => "InvalidPlanStateError",
            Self::MissingRequiredItem => "MissingRequiredItemError",
            Self::Cardinality => "CardinalityError",
            Self::Plugin => "PluginError",
            Self::InternalServer => "InternalServerError",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidLocation => ErrorCategory::Location,
            Self::InvalidType | Self::InvalidChildType | Self::ChildNotAllowed => {
                ErrorCategory::Type
            }
            Self::MissingRequiredProperty
            | Self::PropertyNotAllowed
            | Self::Validation
            | Self::InvalidProperty
            | Self::InvalidRequest => ErrorCategory::Property,
            Self::MethodNotAllowed => ErrorCategory::Permission,
            Self::ItemExists
            | Self::DoNothingPlan
            | Self::InvalidPlanState
            | Self::MissingRequiredItem
            | Self::Cardinality => ErrorCategory::State,
            Self::Plugin | Self::InternalServer => ErrorCategory::Plugin,
        }
    }

    /// Whether front ends should present this as a validation failure of the
    /// request (as opposed to a missing resource or an internal fault).
    pub fn is_validation(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Type | ErrorCategory::Property
        ) || matches!(
            self,
            Self::InvalidPlanState | Self::MissingRequiredItem | Self::Cardinality
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ErrorKindParseError(s.to_owned()))
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl TryFrom<String> for ErrorKind {
    type Error = ErrorKindParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone, Error)]
#[error("invalid error kind: {0:?}")]
pub struct ErrorKindParseError(pub String);

// ---------------------------------------------------------------------------
// Single error
// ---------------------------------------------------------------------------

/// One structured error: kind, message, and the offending path/property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}{kind}{}: {message}", path_prefix(.path), property_suffix(.property))]
pub struct ModelError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ItemPath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

fn path_prefix(path: &Option<ItemPath>) -> String {
    path.as_ref().map(|p| format!("{p}: ")).unwrap_or_default()
}

fn property_suffix(property: &Option<String>) -> String {
    property
        .as_ref()
        .map(|p| format!(" in property {p:?}"))
        .unwrap_or_default()
}

impl ModelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            property: None,
        }
    }

    pub fn at(mut self, path: &ItemPath) -> Self {
        self.path = Some(path.clone());
        self
    }

    pub fn on_property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn invalid_location(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidLocation, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotAllowed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServer, message)
    }
}

// ---------------------------------------------------------------------------
// Error list
// ---------------------------------------------------------------------------

/// All errors raised by one request. Never empty when returned as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Error)]
#[serde(transparent)]
#[error("{}", render_list(.0))]
pub struct ModelErrors(pub Vec<ModelError>);

fn render_list(errors: &[ModelError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl ModelErrors {
    pub fn iter(&self) -> std::slice::Iter<'_, ModelError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of errors of the given kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.0.iter().filter(|e| e.kind == kind).count()
    }

    pub fn has(&self, kind: ErrorKind) -> bool {
        self.count(kind) > 0
    }

    pub fn kinds(&self) -> Vec<ErrorKind> {
        self.0.iter().map(|e| e.kind).collect()
    }

    /// `Ok(())` when `errors` is empty, otherwise the collected list.
    pub fn check(errors: Vec<ModelError>) -> Result<(), ModelErrors> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelErrors(errors))
        }
    }
}

impl From<ModelError> for ModelErrors {
    fn from(error: ModelError) -> Self {
        Self(vec![error])
    }
}

impl IntoIterator for ModelErrors {
    type Item = ModelError;
    type IntoIter = std::vec::IntoIter<ModelError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

pub type ModelResult<T> = Result<T, ModelErrors>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrips_through_display() {
        for kind in ErrorKind::ALL {
            let parsed: ErrorKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("NotAnError".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn display_includes_path_and_property() {
        let path = ItemPath::parse("/software/items/pkg").unwrap();
        let err = ModelError::new(ErrorKind::Validation, "Invalid value 'x'.")
            .at(&path)
            .on_property("name");
        assert_eq!(
            err.to_string(),
            "/software/items/pkg: ValidationError in property \"name\": Invalid value 'x'."
        );
    }

    #[test]
    fn list_counts_by_kind() {
        let errors = ModelErrors(vec![
            ModelError::new(ErrorKind::MissingRequiredProperty, "a"),
            ModelError::new(ErrorKind::MissingRequiredProperty, "b"),
            ModelError::new(ErrorKind::InvalidRequest, "c"),
        ]);
        assert_eq!(errors.count(ErrorKind::MissingRequiredProperty), 2);
        assert!(errors.has(ErrorKind::InvalidRequest));
        assert!(!errors.has(ErrorKind::Validation));
        assert_eq!(errors.to_string().lines().count(), 3);
    }

    #[test]
    fn plan_state_errors_surface_as_validation() {
        assert!(ErrorKind::InvalidPlanState.is_validation());
        assert!(ErrorKind::Validation.is_validation());
        assert!(!ErrorKind::InvalidLocation.is_validation());
        assert_eq!(ErrorKind::MethodNotAllowed.category(), ErrorCategory::Permission);
    }

    #[test]
    fn serializes_kind_and_omits_empty_fields() {
        let err = ModelError::invalid_location("Path not found");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "InvalidLocationError");
        assert!(json.get("path").is_none());
    }
}
