use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::fmt;

use crate::error::AppError;

pub const CURRENCY_CODE_LEN: usize = 3;
pub const NOTE_MAX_LEN: usize = 1000;
pub const ACTOR_MAX_LEN: usize = 100;
pub const SOURCE_MAX_LEN: usize = 64;
pub const URL_MAX_LEN: usize = 2048;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrictPayload<T> {
    #[serde(flatten)]
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation(err.to_string())
    }
}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| word.chars().filter(|ch| !ch.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// ISO 4217 style code; returns it lowercased as stored.
pub fn validate_currency_code(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let code = sanitize_string(value);
    validate_required(field, &code)?;

    if code.len() != CURRENCY_CODE_LEN || !code.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Err(ValidationError::new(
            field,
            format!("must be a {}-letter currency code", CURRENCY_CODE_LEN),
        ));
    }

    Ok(code.to_ascii_lowercase())
}

pub fn validate_positive_amount(field: &'static str, amount: &BigDecimal) -> ValidationResult {
    if amount <= &BigDecimal::from(0) {
        return Err(ValidationError::new(field, "must be greater than zero"));
    }

    Ok(())
}

/// Free-text note for the audit trail, sanitized. Empty notes become `None`.
pub fn validate_note(value: Option<&str>) -> Result<Option<String>, ValidationError> {
    let note = match value {
        Some(raw) => sanitize_string(raw),
        None => return Ok(None),
    };
    if note.is_empty() {
        return Ok(None);
    }
    validate_max_len("notes", &note, NOTE_MAX_LEN)?;
    Ok(Some(note))
}

pub fn validate_actor(value: &str) -> Result<String, ValidationError> {
    let actor = sanitize_string(value);
    validate_required("performed_by", &actor)?;
    validate_max_len("performed_by", &actor, ACTOR_MAX_LEN)?;
    Ok(actor)
}

pub fn validate_redirect_url(field: &'static str, value: &str) -> ValidationResult {
    validate_required(field, value)?;
    validate_max_len(field, value, URL_MAX_LEN)?;
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(_) => Err(ValidationError::new(field, "must be an http(s) URL")),
        Err(_) => Err(ValidationError::new(field, "must be a valid URL")),
    }
}
