// Phone canonicalization: NFKC normalization, native digit folding, E.164 shape.

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// E.164 bounds on the digit count after the `+`.
const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

pub const DEFAULT_COUNTRY_CODE: &str = "98";
pub const DEFAULT_NATIONAL_NUMBER_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("phone number is empty")]
    Empty,

    #[error("phone number has {0} digits, expected at least {MIN_DIGITS}")]
    TooShort(usize),

    #[error("phone number has {0} digits, expected at most {MAX_DIGITS}")]
    TooLong(usize),

    #[error("phone number has no valid country code")]
    InvalidCountryCode,
}

/// Regional defaults applied to numbers typed without an international prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRules {
    pub country_code: String,
    pub national_number_len: usize,
}

impl Default for PhoneRules {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.to_string(),
            national_number_len: DEFAULT_NATIONAL_NUMBER_LEN,
        }
    }
}

/// Normalize a raw phone number into its canonical `+<digits>` form.
///
/// Rules:
/// - Apply Unicode NFKC normalization
/// - Fold Persian and Arabic-Indic digits to ASCII
/// - Drop everything except digits and a leading `+`
/// - `00` prefix means international, like `+`
/// - A trunk `0` is replaced by the default country code
/// - A bare national number gets the default country code
/// - Enforce 8..=15 digits
pub fn normalize_phone(input: &str, rules: &PhoneRules) -> Result<String, PhoneError> {
    let normalized: String = input.nfkc().map(fold_digit).collect();
    let trimmed = normalized.trim();

    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();

    if digits.is_empty() {
        return Err(PhoneError::Empty);
    }

    let international = if has_plus {
        digits
    } else if let Some(rest) = digits.strip_prefix("00") {
        rest.to_string()
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("{}{rest}", rules.country_code)
    } else if digits.len() == rules.national_number_len && !digits.starts_with(&rules.country_code)
    {
        format!("{}{digits}", rules.country_code)
    } else {
        digits
    };

    if international.starts_with('0') {
        return Err(PhoneError::InvalidCountryCode);
    }

    let count = international.len();
    if count < MIN_DIGITS {
        return Err(PhoneError::TooShort(count));
    }
    if count > MAX_DIGITS {
        return Err(PhoneError::TooLong(count));
    }

    Ok(format!("+{international}"))
}

fn fold_digit(ch: char) -> char {
    match ch {
        // Arabic-Indic
        '\u{0660}'..='\u{0669}' => char::from(b'0' + (ch as u32 - 0x0660) as u8),
        // Extended Arabic-Indic (Persian)
        '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (ch as u32 - 0x06F0) as u8),
        _ => ch,
    }
}
