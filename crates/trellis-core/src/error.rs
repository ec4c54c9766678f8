//! Error handling for the Trellis core engine.
//!
//! Structured error types for every core operation: production compilation,
//! working-memory mutation, network maintenance, and user-supplied code
//! invoked during matching and firing.

use thiserror::Error;
use trellis_types::FactId;

/// Identifier assigned to a production when it is added to the engine.
pub type ProductionId = u64;

/// Error type for Trellis core engine operations
#[derive(Error, Debug, Clone)]
pub enum TrellisError {
    /// Production compilation and validation errors
    #[error("compile error: {message}")]
    Compile {
        message: String,
        production: Option<String>,
        variable: Option<String>,
    },

    /// Working-memory operation errors
    #[error("fact store error: {message}")]
    FactStore {
        message: String,
        fact_id: Option<FactId>,
        operation: Option<String>,
    },

    /// Rete network construction and maintenance errors
    #[error("network error: {message}")]
    Network { message: String, node_type: Option<String> },

    /// A conflict-set entry that is no longer valid was fired
    #[error("stale match: {message}")]
    StaleMatch { message: String, production: ProductionId },

    /// A test or bind function failed while strict mode is enabled
    #[error("test error: {message}")]
    Test { message: String, production: Option<String> },

    /// A production action returned an error from `fire`
    #[error("action error in '{production}': {message}")]
    Action { message: String, production: String },

    /// Invariant violations inside the engine
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TrellisError {
    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            TrellisError::Compile { .. } => "compile",
            TrellisError::FactStore { .. } => "fact_store",
            TrellisError::Network { .. } => "network",
            TrellisError::StaleMatch { .. } => "stale_match",
            TrellisError::Test { .. } => "test",
            TrellisError::Action { .. } => "action",
            TrellisError::Internal { .. } => "internal",
        }
    }

    /// Create a compile error without variable context
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile { message: message.into(), production: None, variable: None }
    }

    /// Create a compile error naming the offending variable
    pub fn compile_variable(variable: &str, message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
            production: None,
            variable: Some(variable.to_string()),
        }
    }

    /// Create a fact store error for an operation on a specific fact
    pub fn fact_store(fact_id: FactId, operation: &str, message: impl Into<String>) -> Self {
        Self::FactStore {
            message: message.into(),
            fact_id: Some(fact_id),
            operation: Some(operation.to_string()),
        }
    }

    /// Create a network error
    pub fn network(node_type: &str, message: impl Into<String>) -> Self {
        Self::Network { message: message.into(), node_type: Some(node_type.to_string()) }
    }

    /// Create a stale match error
    pub fn stale_match(production: ProductionId, message: impl Into<String>) -> Self {
        Self::StaleMatch { message: message.into(), production }
    }

    /// Create a strict-mode test error
    pub fn test_failure(message: impl Into<String>) -> Self {
        Self::Test { message: message.into(), production: None }
    }

    /// Create an action error
    pub fn action(production: &str, message: impl Into<String>) -> Self {
        Self::Action { message: message.into(), production: production.to_string() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Attach a production name to compile and test errors
    pub fn with_production(mut self, name: &str) -> Self {
        match &mut self {
            TrellisError::Compile { production, .. } | TrellisError::Test { production, .. } => {
                *production = Some(name.to_string());
            }
            _ => {}
        }
        self
    }
}

/// Result type alias for core engine operations
pub type TrellisResult<T> = Result<T, TrellisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_are_stable() {
        assert_eq!(TrellisError::compile("x").category(), "compile");
        assert_eq!(TrellisError::fact_store(1, "remove", "gone").category(), "fact_store");
        assert_eq!(TrellisError::stale_match(3, "gone").category(), "stale_match");
    }

    #[test]
    fn with_production_annotates_compile_errors() {
        let err = TrellisError::compile_variable("x", "unbound").with_production("p1");
        match err {
            TrellisError::Compile { production, variable, .. } => {
                assert_eq!(production.as_deref(), Some("p1"));
                assert_eq!(variable.as_deref(), Some("x"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
