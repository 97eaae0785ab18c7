//! Human-transcribable `user_code` generation and parsing.
//!
//! Uses a base-20 alphabet with vowels and visually-ambiguous characters
//! removed (no `A E I O U`, no `0 1 O I`), rendered as two 4-symbol groups
//! separated by a hyphen (`XXXX-XXXX`) so it reads cleanly off a small
//! scoreboard display and types cleanly on a phone.

use rand::Rng;

const ALPHABET: &[u8] = b"23456789CDFHJKMNPRTX";

/// Generate a fresh 8-symbol user code in `XXXX-XXXX` form.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let symbols: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", &symbols[0..4], &symbols[4..8])
}

/// Normalize a user-supplied code: uppercase, strip any hyphen, validate the
/// alphabet, and reinsert the canonical hyphen. Accepts input with or
/// without a hyphen, in any case.
pub fn normalize(input: &str) -> Option<String> {
    let stripped: String = input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if stripped.len() != 8 || !stripped.bytes().all(|b| ALPHABET.contains(&b)) {
        return None;
    }
    Some(format!("{}-{}", &stripped[0..4], &stripped[4..8]))
}

/// Strip the hyphen for use in the short verification URL (`/d/<8chars>`).
pub fn to_short_form(user_code: &str) -> String {
    user_code.replace('-', "")
}

/// Reinsert the hyphen from the short URL form back into canonical form.
pub fn from_short_form(short: &str) -> Option<String> {
    normalize(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let code = generate();
        assert_eq!(code.len(), 9);
        assert_eq!(code.chars().nth(4), Some('-'));
    }

    #[test]
    fn test_generate_uses_only_alphabet() {
        for _ in 0..200 {
            let code = generate();
            for c in code.chars().filter(|c| *c != '-') {
                assert!(ALPHABET.contains(&(c as u8)), "unexpected symbol {c}");
                assert!(!"AEIOU01".contains(c), "ambiguous/vowel symbol {c} leaked through");
            }
        }
    }

    #[test]
    fn test_normalize_accepts_case_and_hyphen_variants() {
        assert_eq!(normalize("mrhq-tdy4"), Some("MRHQ-TDY4".to_string()));
        assert_eq!(normalize("MRHQTDY4"), Some("MRHQ-TDY4".to_string()));
        assert_eq!(normalize("  mrhq tdy4  "), Some("MRHQ-TDY4".to_string()));
    }

    #[test]
    fn test_normalize_rejects_wrong_length_or_alphabet() {
        assert_eq!(normalize("ABC"), None);
        assert_eq!(normalize("AEIOUBCD"), None); // contains vowels, not in alphabet
    }

    #[test]
    fn test_short_form_round_trip() {
        let code = "MRHQ-TDY4";
        let short = to_short_form(code);
        assert_eq!(short, "MRHQTDY4");
        assert_eq!(from_short_form(&short), Some(code.to_string()));
    }
}
