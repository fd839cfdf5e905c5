use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("skipping key {key:?}: {cause}")]
    ConfigMapKey { key: String, cause: String },

    #[error("skipping annotation {annotation:?}: {cause}")]
    Annotation { annotation: String, cause: String },

    #[error("error validating HSTS settings, skipping all hsts keys")]
    HstsInvalid,

    #[error("missing {field} in TLS secret")]
    SecretField { field: &'static str },

    #[error("no active endpoints for service {namespace}/{service}:{port}")]
    MissingEndpoints {
        namespace: String,
        service: String,
        port: String,
    },
}

/// Collects per-key validation failures of a single object. Parsing always
/// yields a usable result alongside the collected errors; the caller decides
/// whether to surface them as warning events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationError {
    errors: Vec<ConfigError>,
}

impl ValidationError {
    pub fn push(&mut self, error: ConfigError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ConfigError] {
        &self.errors
    }

    /// `None` when no errors were collected.
    pub fn into_option(self) -> Option<Self> {
        if self.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "validation: [ ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{err}")?;
        }
        write!(f, " ]")
    }
}

impl std::error::Error for ValidationError {}
