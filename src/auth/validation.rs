use crate::auth::Credentials;
use crate::error::AuthError;

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// `local@domain.tld`: exactly one `@`, no whitespace, and a dot inside the domain.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    domain
        .char_indices()
        .any(|(index, c)| c == '.' && index > 0 && index + 1 < domain.len())
}

/// At least 8 ASCII letters or digits, with a lowercase letter, an uppercase letter and a digit.
pub fn is_strong_password(password: &str) -> bool {
    password.len() >= 8
        && password.chars().all(|c| c.is_ascii_alphanumeric())
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
}

pub fn validate_sign_in(email: &str, password: &str) -> Result<Credentials, AuthError> {
    if is_blank(email) || is_blank(password) {
        return Err(AuthError::MissingField);
    }

    Ok(Credentials { email: email.to_string(), password: password.to_string() })
}

/// The sign-up form: checks run in the order the user is told about them.
pub fn validate_sign_up(email: &str, password: &str, confirmation: &str) -> Result<Credentials, AuthError> {
    if email.is_empty() || password.is_empty() || confirmation.is_empty() {
        return Err(AuthError::MissingField);
    }

    if !is_valid_email(email) {
        return Err(AuthError::InvalidEmail);
    }

    if !is_strong_password(password) {
        return Err(AuthError::WeakPassword);
    }

    if password != confirmation {
        return Err(AuthError::PasswordMismatch);
    }

    Ok(Credentials { email: email.to_string(), password: password.to_string() })
}
