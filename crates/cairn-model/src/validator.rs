//! Property value validators.
//!
//! Property values are strings. Each property definition may carry one
//! [`Validator`]; a value that fails it is reported as a `ValidationError`
//! naming the property and the offending value.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static BASIC_STRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-._]+$").unwrap());

static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?[0-9]+$").unwrap());

static POSITIVE_INTEGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]*$").unwrap());

static PATH_STRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9\-._/]*$").unwrap());

/// A tagged validation rule.
#[derive(Clone)]
pub enum Validator {
    /// The whole value must match the pattern.
    Regex(Regex),
    /// The value must be one of the listed literals.
    Enum(Vec<String>),
    /// The value must parse as an integer within `min..=max`.
    IntRange { min: i64, max: i64 },
    /// `true` or `false`.
    Boolean,
    /// Arbitrary predicate; the error string becomes the message.
    Custom {
        name: &'static str,
        check: fn(&str) -> Result<(), String>,
    },
}

impl Validator {
    /// Build a regex validator. The pattern is anchored at both ends.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{pattern})$")).map(Self::Regex)
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(values.into_iter().map(Into::into).collect())
    }

    pub fn int_range(min: i64, max: i64) -> Self {
        Self::IntRange { min, max }
    }

    pub fn custom(name: &'static str, check: fn(&str) -> Result<(), String>) -> Self {
        Self::Custom { name, check }
    }

    /// Letters, digits, `-`, `.` and `_`.
    pub fn basic_string() -> Self {
        Self::Regex(BASIC_STRING_RE.clone())
    }

    pub fn integer() -> Self {
        Self::Regex(INTEGER_RE.clone())
    }

    pub fn positive_integer() -> Self {
        Self::Regex(POSITIVE_INTEGER_RE.clone())
    }

    pub fn boolean() -> Self {
        Self::Boolean
    }

    /// An absolute filesystem-style path.
    pub fn path_string() -> Self {
        Self::Regex(PATH_STRING_RE.clone())
    }

    /// Check a value, returning a human-readable reason on failure.
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            Self::Regex(re) => {
                if re.is_match(value) {
                    Ok(())
                } else {
                    Err(format!(
                        "Invalid value '{value}'. Value must match '{}'.",
                        re.as_str()
                    ))
                }
            }
            Self::Enum(allowed) => {
                if allowed.iter().any(|a| a == value) {
                    Ok(())
                } else {
                    Err(format!(
                        "Invalid value '{value}'. Value must be one of: {}.",
                        allowed.join(", ")
                    ))
                }
            }
            Self::IntRange { min, max } => match value.parse::<i64>() {
                Ok(n) if (*min..=*max).contains(&n) => Ok(()),
                Ok(_) => Err(format!(
                    "Invalid value '{value}'. Value must be between {min} and {max}."
                )),
                Err(_) => Err(format!("Invalid value '{value}'. Value must be an integer.")),
            },
            Self::Boolean => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!(
                    "Invalid value '{value}'. Value must be 'true' or 'false'."
                )),
            },
            Self::Custom { check, .. } => check(value),
        }
    }

    /// Short human-readable form of the rule.
    pub fn describe(&self) -> String {
        match self {
            Self::Regex(re) => format!("matches {}", re.as_str()),
            Self::Enum(allowed) => format!("one of {}", allowed.join(", ")),
            Self::IntRange { min, max } => format!("integer between {min} and {max}"),
            Self::Boolean => "true or false".to_owned(),
            Self::Custom { name, .. } => (*name).to_owned(),
        }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Self::Enum(values) => f.debug_tuple("Enum").field(values).finish(),
            Self::IntRange { min, max } => f
                .debug_struct("IntRange")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Boolean => f.write_str("Boolean"),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}
