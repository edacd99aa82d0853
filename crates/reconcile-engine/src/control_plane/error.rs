//! Control plane error classification
//!
//! Classification works on the structured error code returned by the control
//! plane. Message substrings are only consulted for errors that carry no code
//! at all, so an unrelated error can never be swallowed because its text
//! happens to mention "not found".

use thiserror::Error;

/// Error returned by the control plane for an `invoke` or `describe` call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.render())]
pub struct ControlPlaneError {
    /// Structured error code (e.g. `ThrottlingException`), when the API provides one
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl ControlPlaneError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Error without a structured code (transport failures, legacy APIs)
    pub fn uncoded(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        match &self.code {
            Some(code) => format!("{code}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// How a caller should react to a control plane error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    /// Transient or eventual-consistency failure; try again after a delay
    Retryable,
    /// The resource does not exist (success for deletes)
    NotFound,
    /// Anything else; propagate without retrying
    Fatal,
}

/// Matches one error against a classification rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorMatcher {
    /// Exact structured code
    Code(String),
    /// Structured code starting with the given prefix (e.g. `InvalidGroup.`)
    CodePrefix(String),
    /// Structured code plus a message substring, for codes the API overloads
    CodeWithMessage { code: String, fragment: String },
    /// Message substring; only applies to errors without a structured code
    Message(String),
}

impl ErrorMatcher {
    fn matches(&self, error: &ControlPlaneError) -> bool {
        match (self, error.code.as_deref()) {
            (ErrorMatcher::Code(c), Some(code)) => c == code,
            (ErrorMatcher::CodePrefix(p), Some(code)) => code.starts_with(p.as_str()),
            (ErrorMatcher::CodeWithMessage { code: c, fragment }, Some(code)) => {
                c == code && error.message.contains(fragment.as_str())
            }
            (ErrorMatcher::Message(fragment), None) => error.message.contains(fragment.as_str()),
            _ => false,
        }
    }
}

/// Known error codes for "not found" conditions
pub const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NotFoundException",
    "InvalidInstanceID.NotFound",
    "InvalidAllocationID.NotFound",
    "InvalidGroup.NotFound",
    "InvalidPermission.NotFound",
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchEntity",
];

/// Known error codes for throttling/rate limiting
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
];

/// Known error codes for dependency violations (resource still in use)
pub const DEPENDENCY_CODES: &[&str] = &["DependencyViolation", "ResourceInUseException"];

/// Known error codes for conflicting in-flight changes (eventual consistency)
pub const CONFLICT_CODES: &[&str] = &[
    "ConflictException",
    "ConcurrentModificationException",
    "IncorrectState",
    "OperationAborted",
];

/// Known error codes for transient server-side failures
pub const SERVER_ERROR_CODES: &[&str] = &[
    "InternalError",
    "InternalFailure",
    "ServiceUnavailable",
    "ServiceUnavailableException",
];

/// Message fragments for uncoded errors that indicate a missing resource
const NOT_FOUND_MESSAGES: &[&str] = &["does not exist", "not found"];

/// Message fragments for uncoded errors that indicate a transient transport failure
const TRANSIENT_MESSAGES: &[&str] = &["connection reset", "timed out", "connection refused"];

/// Declarative, per-call-site error classification table.
///
/// Rules are evaluated in insertion order and the first match wins; errors
/// that match no rule are [`ErrorClass::Fatal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorClassifier {
    rules: Vec<(ErrorMatcher, ErrorClass)>,
}

impl ErrorClassifier {
    /// Classifier with no rules: every error is fatal
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, matcher: ErrorMatcher, class: ErrorClass) -> Self {
        self.rules.push((matcher, class));
        self
    }

    pub fn retry_on_code(self, code: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::Code(code.into()), ErrorClass::Retryable)
    }

    pub fn retry_on_codes(self, codes: &[&str]) -> Self {
        codes.iter().fold(self, |c, code| c.retry_on_code(*code))
    }

    pub fn retry_on_code_prefix(self, prefix: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::CodePrefix(prefix.into()), ErrorClass::Retryable)
    }

    /// Retry a code only when its message contains `fragment`
    pub fn retry_on_code_with_message(
        self,
        code: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        self.rule(
            ErrorMatcher::CodeWithMessage {
                code: code.into(),
                fragment: fragment.into(),
            },
            ErrorClass::Retryable,
        )
    }

    pub fn retry_on_message(self, fragment: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::Message(fragment.into()), ErrorClass::Retryable)
    }

    pub fn not_found_on_code(self, code: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::Code(code.into()), ErrorClass::NotFound)
    }

    pub fn not_found_on_codes(self, codes: &[&str]) -> Self {
        codes.iter().fold(self, |c, code| c.not_found_on_code(*code))
    }

    pub fn not_found_on_code_prefix(self, prefix: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::CodePrefix(prefix.into()), ErrorClass::NotFound)
    }

    pub fn not_found_on_message(self, fragment: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::Message(fragment.into()), ErrorClass::NotFound)
    }

    /// Force a code to be fatal even if a later rule would retry it
    pub fn fatal_on_code(self, code: impl Into<String>) -> Self {
        self.rule(ErrorMatcher::Code(code.into()), ErrorClass::Fatal)
    }

    /// Rules shared by every preset: not-found, throttling and server errors
    fn base() -> Self {
        let mut c = Self::new()
            .not_found_on_codes(NOT_FOUND_CODES)
            .retry_on_codes(THROTTLING_CODES)
            .retry_on_codes(SERVER_ERROR_CODES);
        for fragment in NOT_FOUND_MESSAGES {
            c = c.not_found_on_message(*fragment);
        }
        for fragment in TRANSIENT_MESSAGES {
            c = c.retry_on_message(*fragment);
        }
        c
    }

    /// Deletes also retry while dependents are still detaching or a change is in flight
    pub fn for_delete() -> Self {
        Self::base()
            .retry_on_codes(DEPENDENCY_CODES)
            .retry_on_codes(CONFLICT_CODES)
    }

    /// Creates retry while a freshly created dependency is not yet visible
    pub fn for_create() -> Self {
        Self::base()
            .retry_on_code_with_message("InvalidParameterValue", "iamInstanceProfile")
            .retry_on_code_with_message("InvalidParameterValueException", "not authorized")
            .retry_on_message("Invalid IAM Instance Profile")
    }

    /// Updates and transitions retry on conflicting in-flight changes
    pub fn for_update() -> Self {
        Self::base().retry_on_codes(CONFLICT_CODES)
    }

    /// Describe calls only need not-found, throttling and server-error rules
    pub fn for_describe() -> Self {
        Self::base()
    }

    /// Classify an error. Unmatched errors are fatal.
    pub fn classify(&self, error: &ControlPlaneError) -> ErrorClass {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.matches(error))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Fatal)
    }

    pub fn is_retryable(&self, error: &ControlPlaneError) -> bool {
        self.classify(error) == ErrorClass::Retryable
    }

    pub fn is_not_found(&self, error: &ControlPlaneError) -> bool {
        self.classify(error) == ErrorClass::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        let c = ErrorClassifier::for_delete();
        for code in NOT_FOUND_CODES {
            let err = ControlPlaneError::new(*code, "some message");
            assert_eq!(c.classify(&err), ErrorClass::NotFound, "code: {code}");
        }
    }

    #[test]
    fn throttling_codes_retry_everywhere() {
        for c in [
            ErrorClassifier::for_delete(),
            ErrorClassifier::for_create(),
            ErrorClassifier::for_update(),
            ErrorClassifier::for_describe(),
        ] {
            for code in THROTTLING_CODES {
                let err = ControlPlaneError::new(*code, "slow down");
                assert!(c.is_retryable(&err), "Expected retryable for code: {code}");
            }
        }
    }

    #[test]
    fn dependency_violation_retries_only_for_delete() {
        let err = ControlPlaneError::new("DependencyViolation", "ENI attached");
        assert!(ErrorClassifier::for_delete().is_retryable(&err));
        assert_eq!(
            ErrorClassifier::for_create().classify(&err),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn create_retries_on_iam_propagation() {
        let c = ErrorClassifier::for_create();
        let err = ControlPlaneError::new(
            "InvalidParameterValue",
            "Value for parameter iamInstanceProfile is invalid",
        );
        assert!(c.is_retryable(&err));

        let other = ControlPlaneError::new("InvalidParameterValue", "bad instance type");
        assert_eq!(c.classify(&other), ErrorClass::Fatal);
    }

    #[test]
    fn message_rules_ignored_when_code_present() {
        // Structured code wins: text that mentions "not found" must not be swallowed
        let c = ErrorClassifier::for_delete();
        let err = ControlPlaneError::new("AccessDenied", "role not found in trust policy");
        assert_eq!(c.classify(&err), ErrorClass::Fatal);

        let uncoded = ControlPlaneError::uncoded("queue q-1 does not exist");
        assert_eq!(c.classify(&uncoded), ErrorClass::NotFound);
    }

    #[test]
    fn uncoded_transport_failures_retry() {
        let c = ErrorClassifier::for_describe();
        assert!(c.is_retryable(&ControlPlaneError::uncoded("connection reset by peer")));
        assert_eq!(
            c.classify(&ControlPlaneError::uncoded("something failed")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn code_prefix_rule() {
        let c = ErrorClassifier::new().not_found_on_code_prefix("InvalidGroup.");
        assert!(c.is_not_found(&ControlPlaneError::new("InvalidGroup.NotFound", "x")));
        assert!(!c.is_not_found(&ControlPlaneError::new("InvalidGroupId", "x")));
    }

    #[test]
    fn first_matching_rule_wins() {
        let c = ErrorClassifier::new()
            .fatal_on_code("ConflictException")
            .retry_on_code("ConflictException");
        assert_eq!(
            c.classify(&ControlPlaneError::new("ConflictException", "x")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn empty_classifier_is_fatal() {
        let c = ErrorClassifier::new();
        assert_eq!(
            c.classify(&ControlPlaneError::new("Throttling", "x")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn error_display_includes_code() {
        let err = ControlPlaneError::new("ClientException", "queue is enabled");
        assert_eq!(err.to_string(), "ClientException: queue is enabled");
        assert_eq!(ControlPlaneError::uncoded("boom").to_string(), "boom");
    }
}
