//! Field-level validation for provisioning payloads.
//!
//! Validation runs in the request gateway, before anything is published, so a
//! request that fails here never reaches the broker or the store.

use std::sync::OnceLock;

use regex::Regex;

/// A payload field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error("email is not a valid address")]
    InvalidEmail,
    #[error("cpf must contain exactly 11 digits")]
    InvalidCpf,
    #[error("password must be at least {min} characters")]
    WeakPassword { min: usize },
    #[error("update does not change any field")]
    EmptyUpdate,
    #[error("{field} must list at least one entry")]
    EmptyList { field: &'static str },
}

/// Maximum length of free-text fields (names, titles, customer names).
pub const MAX_TEXT_LEN: usize = 255;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static email pattern compiles")
    })
}

/// Checks that `value` is non-blank and at most [`MAX_TEXT_LEN`] characters.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] or [`ValidationError::TooLong`].
pub fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.chars().count() > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
        });
    }
    Ok(())
}

/// # Errors
///
/// Returns [`ValidationError::InvalidEmail`] when `value` is not `local@domain.tld`.
pub fn validate_email(value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_TEXT_LEN || !email_pattern().is_match(value) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

/// Accepts the bare 11-digit form or the punctuated `000.000.000-00` form.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidCpf`] otherwise.
pub fn validate_cpf(value: &str) -> Result<(), ValidationError> {
    let digits = normalize_cpf(value);
    let only_allowed = value
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if !only_allowed || digits.len() != 11 {
        return Err(ValidationError::InvalidCpf);
    }
    Ok(())
}

/// Strips punctuation from a CPF, keeping only its digits.
#[must_use]
pub fn normalize_cpf(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

/// # Errors
///
/// Returns [`ValidationError::WeakPassword`] below [`MIN_PASSWORD_LEN`] characters.
pub fn validate_password(value: &str) -> Result<(), ValidationError> {
    if value.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}
