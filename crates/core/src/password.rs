//! Admin password policy applied when a customer completes setup.

use crate::error::{DomainError, DomainResult};

pub const MIN_ADMIN_PASSWORD_LEN: usize = 12;

/// Require at least 12 characters with lowercase, uppercase, digit and symbol,
/// and an exact confirmation match.
pub fn validate_admin_password(password: &str, confirm: &str) -> DomainResult<()> {
    if password != confirm {
        return Err(DomainError::validation("passwords do not match"));
    }
    if password.chars().count() < MIN_ADMIN_PASSWORD_LEN {
        return Err(DomainError::validation(format!(
            "password must be at least {MIN_ADMIN_PASSWORD_LEN} characters"
        )));
    }

    let mut missing = Vec::new();
    if !password.chars().any(|c| c.is_lowercase()) {
        missing.push("a lowercase letter");
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        missing.push("an uppercase letter");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        missing.push("a digit");
    }
    if !password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
        missing.push("a symbol");
    }

    if !missing.is_empty() {
        return Err(DomainError::validation(format!(
            "password must contain {}",
            missing.join(", ")
        )));
    }
    Ok(())
}
