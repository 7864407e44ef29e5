//! Structured error types shared across DPM crates.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured payload attached to every [`DpmError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (item indices, cluster ids, values).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional hint that may help the caller resolve the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a new error payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry to the payload.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    /// Sets a human readable hint for remediation.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Canonical error type for the DPM engine.
///
/// Every variant is fatal for the proposal that raised it. A proposal whose
/// log probability is `-inf` is a legitimate rejection and is never reported
/// through this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum DpmError {
    /// Coupled partition state diverged (change tags, cardinalities, pointers).
    #[error("consistency error: {0}")]
    Consistency(ErrorInfo),
    /// Numeric degeneracy such as a NaN log-likelihood.
    #[error("numeric error: {0}")]
    Numeric(ErrorInfo),
    /// Failures raised by or about the likelihood oracle.
    #[error("oracle error: {0}")]
    Oracle(ErrorInfo),
    /// Invalid proposal kernel construction or evaluation.
    #[error("kernel error: {0}")]
    Kernel(ErrorInfo),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(ErrorInfo),
    /// Serialization and checkpoint IO errors.
    #[error("serde error: {0}")]
    Serde(ErrorInfo),
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)?;
        if !self.context.is_empty() {
            write!(f, " | context: [")?;
            for (idx, (key, value)) in self.context.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, "]")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " | hint: {hint}")?;
        }
        Ok(())
    }
}

impl DpmError {
    /// Returns a reference to the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            DpmError::Consistency(info)
            | DpmError::Numeric(info)
            | DpmError::Oracle(info)
            | DpmError::Kernel(info)
            | DpmError::Config(info)
            | DpmError::Serde(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            DpmError::Consistency(info)
            | DpmError::Numeric(info)
            | DpmError::Oracle(info)
            | DpmError::Kernel(info)
            | DpmError::Config(info)
            | DpmError::Serde(info) => info,
        }
    }

    /// Returns `true` for chain-terminating consistency failures.
    pub fn is_consistency(&self) -> bool {
        matches!(self, DpmError::Consistency(_))
    }

    /// Attaches an extra context entry while preserving the error family.
    ///
    /// Existing keys are kept so the innermost context wins.
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.info_mut()
            .context
            .entry(key.into())
            .or_insert_with(|| value.to_string());
        self
    }
}
