//! Recipient and media checks run before any channel is tried.

use posterly_core::error::{PosterlyError, Result};
use reqwest::Url;

/// E.164 upper bound.
const MAX_DIGITS: usize = 15;

/// Normalize a contact number to international digits (no `+`).
///
/// Separators (spaces, dashes, dots, parentheses) are dropped. A leading `+`
/// or `00` marks the number as international. Otherwise a single trunk `0`
/// is removed and a bare local number of exactly `min_digits` digits gets
/// `default_cc` prefixed.
pub fn normalize_phone(raw: &str, default_cc: &str, min_digits: usize) -> Result<String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(PosterlyError::InvalidInput("empty phone number".into()));
    }

    let (has_plus, rest) = match s.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            other => {
                return Err(PosterlyError::InvalidInput(format!(
                    "phone number '{raw}' contains '{other}'"
                )));
            }
        }
    }

    let normalized = if has_plus {
        digits
    } else if let Some(intl) = digits.strip_prefix("00") {
        intl.to_string()
    } else {
        let local = match digits.strip_prefix('0') {
            Some(stripped) => stripped.to_string(),
            None => digits,
        };
        if local.len() == min_digits {
            format!("{default_cc}{local}")
        } else {
            local
        }
    };

    if normalized.len() < min_digits || normalized.len() > MAX_DIGITS {
        return Err(PosterlyError::InvalidInput(format!(
            "phone number '{raw}' has {} digits after normalization",
            normalized.len()
        )));
    }
    Ok(normalized)
}

/// Accept only absolute `http(s)` URLs with a host.
pub fn media_url(raw: &str) -> Result<String> {
    let s = raw.trim();
    let url = Url::parse(s)
        .map_err(|e| PosterlyError::InvalidInput(format!("media url '{s}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PosterlyError::InvalidInput(format!(
            "media url '{s}' must be http or https"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(PosterlyError::InvalidInput(format!("media url '{s}' has no host")));
    }
    Ok(s.to_string())
}
