//! Saga definitions and the registry the orchestrator resolves them from.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use event_store::TransactionalEventStore;

use crate::error::{Result, SagaError};
use crate::retry::RetryPolicy;
use crate::status::SagaPattern;
use crate::step::SagaStep;

type InputValidator = Arc<dyn Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync>;

/// An ordered list of steps registered under a saga type name.
pub struct SagaDefinition<S: TransactionalEventStore> {
    saga_type: String,
    steps: Vec<Arc<dyn SagaStep<S>>>,
    pattern: SagaPattern,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    validator: Option<InputValidator>,
}

impl<S: TransactionalEventStore> Clone for SagaDefinition<S> {
    fn clone(&self) -> Self {
        Self {
            saga_type: self.saga_type.clone(),
            steps: self.steps.clone(),
            pattern: self.pattern,
            retry_policy: self.retry_policy.clone(),
            timeout: self.timeout,
            validator: self.validator.clone(),
        }
    }
}

impl<S: TransactionalEventStore> SagaDefinition<S> {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
            pattern: SagaPattern::Orchestration,
            retry_policy: None,
            timeout: None,
            validator: None,
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: impl SagaStep<S> + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a shared step.
    pub fn step_arc(mut self, step: Arc<dyn SagaStep<S>>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_pattern(mut self, pattern: SagaPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Overrides the orchestrator's retry policy for this saga type.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Default timeout for sagas of this type.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validates saga input before an instance is created.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&serde_json::Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep<S>>] {
        &self.steps
    }

    pub fn step_at(&self, index: usize) -> Option<&Arc<dyn SagaStep<S>>> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn pattern(&self) -> SagaPattern {
        self.pattern
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Checks the definition itself and then `input` against it.
    pub fn validate_input(&self, input: &serde_json::Value) -> Result<()> {
        if !input.is_object() {
            return Err(SagaError::Validation(format!(
                "input for saga '{}' must be a JSON object",
                self.saga_type
            )));
        }
        if let Some(validator) = &self.validator {
            validator(input).map_err(SagaError::Validation)?;
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.saga_type.trim().is_empty() {
            return Err(SagaError::Validation("saga type must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(SagaError::Validation(format!(
                "saga '{}' has no steps",
                self.saga_type
            )));
        }
        let mut names = std::collections::HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name()) {
                return Err(SagaError::Validation(format!(
                    "saga '{}' has duplicate step '{}'",
                    self.saga_type,
                    step.name()
                )));
            }
        }
        Ok(())
    }
}

/// Saga definitions by type name.
pub struct SagaRegistry<S: TransactionalEventStore> {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition<S>>>>,
}

impl<S: TransactionalEventStore> Default for SagaRegistry<S> {
    fn default() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: TransactionalEventStore> SagaRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, rejecting invalid or duplicate ones.
    pub fn register(&self, definition: SagaDefinition<S>) -> Result<()> {
        definition.check()?;
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(definition.saga_type()) {
            return Err(SagaError::Validation(format!(
                "saga type '{}' is already registered",
                definition.saga_type()
            )));
        }
        tracing::debug!(saga_type = definition.saga_type(), steps = definition.len(), "saga type registered");
        definitions.insert(definition.saga_type().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Looks up a definition.
    pub fn get(&self, saga_type: &str) -> Result<Arc<SagaDefinition<S>>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    /// Returns true if a definition is registered for `saga_type`.
    pub fn contains(&self, saga_type: &str) -> bool {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(saga_type)
    }

    /// Returns the registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
