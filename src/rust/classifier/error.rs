/// One violated field constraint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {constraint} (got {actual})")]
pub struct Violation {
    /// Field path, e.g. `confidence` or `evidence[3]`
    pub field: String,
    /// The constraint that was expected to hold
    pub constraint: String,
    /// Rendering of the value actually found
    pub actual: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, constraint: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
            actual: actual.into(),
        }
    }
}

/// A payload that did not satisfy the decision contract.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} validation error(s) for decision{}", .violations.len(), join_violations(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn single(violation: Violation) -> Self {
        Self { violations: vec![violation] }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations.iter().map(|v| format!("; {}", v)).collect()
}

/// Failure of the generation endpoint itself.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response contained no candidate text")]
    EmptyResponse,
    #[error("{0}")]
    Other(String),
}

/// Why a single classification attempt produced no decision.
///
/// Both variants are recoverable; the retry protocol and the run loop treat
/// them as data rather than aborting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    /// The endpoint answered but the answer did not validate
    #[error("Validation error: {0}")]
    Validation(String),
    /// Transport, status or timeout failure
    #[error("API error: {0}")]
    Api(String),
}

impl From<ValidationError> for ClassifyError {
    fn from(err: ValidationError) -> Self {
        ClassifyError::Validation(err.to_string())
    }
}

impl From<BackendError> for ClassifyError {
    fn from(err: BackendError) -> Self {
        ClassifyError::Api(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let violation = Violation::new("confidence", "must be within [0, 1]", "2");
        assert_eq!(violation.to_string(), "confidence: must be within [0, 1] (got 2)");
    }

    #[test]
    fn test_validation_error_lists_every_violation() -> Result<(), Box<dyn std::error::Error>> {
        let err = ValidationError::new(vec![
            Violation::new("label", "one of true, false, uncertain", "\"maybe\""),
            Violation::new("evidence[3]", "at most 3 items", "4 items"),
        ]);
        assert_eq!(
            err.to_string(),
            "2 validation error(s) for decision; label: one of true, false, uncertain (got \"maybe\"); \
             evidence[3]: at most 3 items (got 4 items)"
        );

        let boxed: Box<dyn std::error::Error> = Box::new(ValidationError::single(Violation::new(
            "reasoning",
            "non-empty",
            "\"\"",
        )));
        assert_eq!(
            boxed.to_string(),
            "1 validation error(s) for decision; reasoning: non-empty (got \"\")"
        );
        Ok(())
    }

    #[test]
    fn test_validation_error_becomes_validation_classify_error() {
        let err = ClassifyError::from(ValidationError::single(Violation::new("confidence", "a number", "null")));
        assert_eq!(
            err.to_string(),
            "Validation error: 1 validation error(s) for decision; confidence: a number (got null)"
        );
    }
}
