//! Fractional position keys for cell ordering.
//!
//! A key is a string of base-36 digits read as a fraction in `[0, 1)`, so
//! lexicographic order equals numeric order and there is always room for a
//! new key between two distinct ones. Moving a cell rewrites only its own
//! key, which keeps a move down to a single document operation.
//!
//! Keys never end in `'0'`: `"a0"` and `"a"` denote the same fraction, and
//! allowing both would leave no key between them.

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const BASE: u32 = 36;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PositionError {
    #[error("invalid position digit {0:?}")]
    InvalidDigit(char),

    #[error("position {0:?} ends in '0'")]
    TrailingZero(String),

    #[error("position {lower:?} is not below {upper:?}")]
    Unordered { lower: String, upper: String },
}

/// Generate a key strictly between `lower` and `upper`.
///
/// `None` stands for the start (lower) or end (upper) of the sequence.
pub fn between(lower: Option<&str>, upper: Option<&str>) -> Result<String, PositionError> {
    let lower = lower.unwrap_or("");
    validate(lower)?;
    if let Some(upper) = upper {
        validate(upper)?;
        if lower >= upper || upper.is_empty() {
            return Err(PositionError::Unordered {
                lower: lower.to_string(),
                upper: upper.to_string(),
            });
        }
    }
    Ok(midpoint(lower.as_bytes(), upper.map(str::as_bytes)))
}

/// `n` ascending keys, each appended after the previous one.
pub fn sequence(n: usize) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(n);
    for _ in 0..n {
        let next = midpoint(keys.last().map_or(&[][..], |k| k.as_bytes()), None);
        keys.push(next);
    }
    keys
}

fn validate(key: &str) -> Result<(), PositionError> {
    if let Some(c) = key.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='z')) {
        return Err(PositionError::InvalidDigit(c));
    }
    if key.ends_with('0') {
        return Err(PositionError::TrailingZero(key.to_string()));
    }
    Ok(())
}

fn value(digit: u8) -> u32 {
    DIGITS.iter().position(|&d| d == digit).unwrap_or(0) as u32
}

fn digit(value: u32) -> char {
    DIGITS[value as usize] as char
}

fn midpoint(lower: &[u8], upper: Option<&[u8]>) -> String {
    if let Some(upper) = upper {
        // Shared prefix, reading `lower` as padded with zeros.
        let shared = upper
            .iter()
            .enumerate()
            .take_while(|&(i, &d)| lower.get(i).copied().unwrap_or(b'0') == d)
            .count();
        if shared > 0 {
            let mut key: String = upper[..shared].iter().map(|&d| d as char).collect();
            key.push_str(&midpoint(
                lower.get(shared..).unwrap_or(&[]),
                Some(&upper[shared..]),
            ));
            return key;
        }
    }

    let low = lower.first().map_or(0, |&d| value(d));
    let high = upper.and_then(|u| u.first()).map_or(BASE, |&d| value(d));

    if high - low > 1 {
        return digit((low + high) / 2).to_string();
    }

    match upper {
        Some(upper) if upper.len() > 1 => digit(high).to_string(),
        _ => {
            let mut key = digit(low).to_string();
            key.push_str(&midpoint(lower.get(1..).unwrap_or(&[]), None));
            key
        }
    }
}
