use std::collections::HashSet;

use axum::body::Bytes;
use serde::de::DeserializeOwned;

use crate::error::AppError;

pub const CODE_LENGTH: usize = 6;

const MIN_E164_DIGITS: usize = 8;
const MAX_E164_DIGITS: usize = 15;

pub fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|_| AppError::MalformedPayload)
}

/// Normalizes user input to E.164. Bare 10 digit numbers are assumed North American.
pub fn normalize_phone(raw: &str) -> Result<String, AppError> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    let (has_plus, digits) = match stripped.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, stripped.as_str()),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::InvalidPhoneNumber);
    }

    if has_plus {
        if !(MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&digits.len()) || digits.starts_with('0')
        {
            return Err(AppError::InvalidPhoneNumber);
        }

        return Ok(format!("+{digits}"));
    }

    match digits.len() {
        10 => Ok(format!("+1{digits}")),
        11 if digits.starts_with('1') => Ok(format!("+{digits}")),
        _ => Err(AppError::InvalidPhoneNumber),
    }
}

pub fn validate_code(raw: &str) -> Result<String, AppError> {
    let code = raw.trim();

    if code.len() != CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::InvalidCode);
    }

    Ok(code.to_string())
}

/// Trims ids, drops empties and repeated ids, keeping first-seen order.
pub fn dedupe_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();

    ids.into_iter()
        .map(|id| id.as_ref().trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// `+15551234567` -> `+1******4567`
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();

    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }

    let head = if chars[0] == '+' { 2 } else { 1 };
    let tail = 4;

    chars
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i < head || i >= chars.len() - tail {
                *c
            } else {
                '*'
            }
        })
        .collect()
}
