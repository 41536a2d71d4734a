use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;

use super::error::{BackendError, ClassifyError};
use super::labels::Label;
use super::schema::{repair_instructions, response_schema, validate, Decision};

/// One request to a text-generation endpoint.
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub model_id: &'a str,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// JSON schema the output is constrained to
    pub response_schema: &'a Value,
}

/// An external model that turns a prompt into (hopefully) schema-shaped text.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, BackendError>;
}

/// Result of a single call to the endpoint.
#[derive(Debug, Clone)]
pub struct Attempt<L: Label> {
    pub result: Result<Decision<L>, ClassifyError>,
    pub elapsed_ms: u64,
}

/// Result of the bounded two-attempt protocol.
#[derive(Debug, Clone)]
pub struct Outcome<L: Label> {
    pub result: Result<Decision<L>, ClassifyError>,
    /// Wall time summed over all attempts
    pub elapsed_ms: u64,
    /// 1 or 2
    pub attempts: u8,
}

impl<L: Label> Outcome<L> {
    pub fn decision(&self) -> Option<&Decision<L>> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ClassifyError> {
        self.result.as_ref().err()
    }
}

/// States of the retry protocol that still need an endpoint call.
///
/// `FirstAttempt -> Done | RepairAttempt`, `RepairAttempt -> Done | Failed`.
/// There is no edge out of `RepairAttempt` back to an attempt, which is what
/// bounds every item to two endpoint calls.
#[derive(Debug)]
pub(crate) enum RetryState {
    FirstAttempt,
    RepairAttempt { first_error: ClassifyError, elapsed_ms: u64 },
}

/// Where the protocol goes after one attempt.
#[derive(Debug)]
pub(crate) enum Step<L: Label> {
    Next(RetryState),
    Done(Outcome<L>),
    Failed(Outcome<L>),
}

impl RetryState {
    /// Feeds the result of the attempt this state asked for.
    pub(crate) fn advance<L: Label>(self, attempt: Attempt<L>) -> Step<L> {
        match self {
            RetryState::FirstAttempt => match attempt.result {
                Ok(decision) => Step::Done(Outcome {
                    result: Ok(decision),
                    elapsed_ms: attempt.elapsed_ms,
                    attempts: 1,
                }),
                Err(error) => Step::Next(RetryState::RepairAttempt {
                    first_error: error,
                    elapsed_ms: attempt.elapsed_ms,
                }),
            },
            RetryState::RepairAttempt { first_error, elapsed_ms } => {
                let elapsed_ms = elapsed_ms + attempt.elapsed_ms;
                match attempt.result {
                    Ok(decision) => Step::Done(Outcome {
                        result: Ok(decision),
                        elapsed_ms,
                        attempts: 2,
                    }),
                    Err(error) => {
                        debug!("Repair attempt failed too (first error: {})", first_error);
                        Step::Failed(Outcome {
                            result: Err(error),
                            elapsed_ms,
                            attempts: 2,
                        })
                    }
                }
            }
        }
    }
}

/// Obtains validated decisions of one label type from a generation backend.
pub struct Classifier<L: Label> {
    backend: Arc<dyn GenerationBackend>,
    schema: Value,
    _label: PhantomData<L>,
}

impl<L: Label> Clone for Classifier<L> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            schema: self.schema.clone(),
            _label: PhantomData,
        }
    }
}

impl<L: Label> Classifier<L> {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            schema: response_schema::<L>(),
            _label: PhantomData,
        }
    }

    /// Makes exactly one call to the endpoint and validates the answer.
    pub async fn classify(
        &self,
        prompt: &str,
        model_id: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Attempt<L> {
        let request = GenerationRequest {
            prompt,
            model_id,
            temperature,
            max_output_tokens,
            response_schema: &self.schema,
        };

        let start = Instant::now();
        let response = self.backend.generate(&request).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = match response {
            Ok(text) => parse_decision::<L>(&text),
            Err(err) => Err(ClassifyError::from(err)),
        };
        Attempt { result, elapsed_ms }
    }

    /// Classifies with at most one repair retry.
    ///
    /// The repair prompt is the original prompt followed by a literal
    /// restatement of the field constraints. On double failure the error of
    /// the second attempt is returned.
    pub async fn classify_with_retry(
        &self,
        prompt: &str,
        model_id: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Outcome<L> {
        let mut state = RetryState::FirstAttempt;
        loop {
            let attempt = match &state {
                RetryState::FirstAttempt => {
                    self.classify(prompt, model_id, temperature, max_output_tokens).await
                }
                RetryState::RepairAttempt { first_error, .. } => {
                    warn!("First attempt failed, retrying with repair prompt: {}", first_error);
                    let repair = repair_prompt::<L>(prompt);
                    self.classify(&repair, model_id, temperature, max_output_tokens).await
                }
            };
            match state.advance(attempt) {
                Step::Next(next) => state = next,
                Step::Done(outcome) | Step::Failed(outcome) => return outcome,
            }
        }
    }
}

/// Builds the second-attempt prompt.
pub fn repair_prompt<L: Label>(prompt: &str) -> String {
    format!("{}\n\n{}", prompt, repair_instructions::<L>())
}

fn parse_decision<L: Label>(text: &str) -> Result<Decision<L>, ClassifyError> {
    let payload: Value = serde_json::from_str(text.trim())
        .map_err(|e| ClassifyError::Validation(format!("response is not valid JSON: {}", e)))?;
    Ok(validate::<L>(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::labels::RelevanceLabel;

    fn decision() -> Decision<RelevanceLabel> {
        Decision {
            label: RelevanceLabel::False,
            evidence: vec![],
            reasoning: "Kein Bezug zum Radverkehr.".into(),
            confidence: 0.9,
        }
    }

    fn failed(message: &str, elapsed_ms: u64) -> Attempt<RelevanceLabel> {
        Attempt {
            result: Err(ClassifyError::Validation(message.into())),
            elapsed_ms,
        }
    }

    fn finished(step: Step<RelevanceLabel>) -> Option<Outcome<RelevanceLabel>> {
        match step {
            Step::Done(outcome) | Step::Failed(outcome) => Some(outcome),
            Step::Next(_) => None,
        }
    }

    fn repair_state(first: &str, elapsed_ms: u64) -> Option<RetryState> {
        match RetryState::FirstAttempt.advance::<RelevanceLabel>(failed(first, elapsed_ms)) {
            Step::Next(state) => Some(state),
            _ => None,
        }
    }

    #[test]
    fn test_first_attempt_success_is_terminal() {
        let step = RetryState::FirstAttempt.advance(Attempt { result: Ok(decision()), elapsed_ms: 40 });
        assert!(matches!(step, Step::Done(_)));
        let outcome = finished(step).unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.elapsed_ms, 40);
        assert!(outcome.error().is_none());
    }

    #[test]
    fn test_failure_moves_to_repair() {
        let step = RetryState::FirstAttempt.advance::<RelevanceLabel>(failed("bad", 10));
        assert!(matches!(step, Step::Next(RetryState::RepairAttempt { elapsed_ms: 10, .. })));
    }

    #[test]
    fn test_repair_success_sums_elapsed() {
        let step = repair_state("bad", 10)
            .unwrap()
            .advance(Attempt { result: Ok(decision()), elapsed_ms: 15 });
        assert!(matches!(step, Step::Done(_)));
        let outcome = finished(step).unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.elapsed_ms, 25);
        assert!(outcome.decision().is_some());
    }

    #[test]
    fn test_double_failure_keeps_second_error() {
        let step = repair_state("first", 10).unwrap().advance(failed("second", 20));
        assert!(matches!(step, Step::Failed(_)));
        let outcome = finished(step).unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.elapsed_ms, 30);
        assert_eq!(outcome.error(), Some(&ClassifyError::Validation("second".into())));
    }

    #[test]
    fn test_parse_rejects_prose() {
        let result = parse_decision::<RelevanceLabel>("Sure! Here is the JSON you asked for.");
        assert!(matches!(result, Err(ClassifyError::Validation(_))));
    }

    #[test]
    fn test_repair_prompt_extends_original() {
        let repair = repair_prompt::<RelevanceLabel>("PROMPT");
        assert!(repair.starts_with("PROMPT\n\nIMPORTANT:"));
    }
}
