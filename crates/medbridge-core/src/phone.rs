//! Phone number normalization.
//!
//! A phone number is the weakest search key in the matching hierarchy and the
//! one most likely to be formatted differently on the two sides. The canonical
//! equality rule everywhere in the system is: strip every non-digit character,
//! then compare.

/// Normalize a phone number for comparison by keeping only digits.
#[must_use]
pub fn normalize(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

/// Compare two phone numbers under the canonical equality rule.
///
/// Empty-after-normalization values never match anything, including each
/// other — an all-punctuation "number" is not a usable key.
#[must_use]
pub fn matches(a: &str, b: &str) -> bool {
    let a = normalize(a);
    !a.is_empty() && a == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting() {
        assert_eq!(normalize("+7 (916) 123-45-67"), "79161234567");
        assert_eq!(normalize("8-916-123-45-67"), "89161234567");
    }

    #[test]
    fn digits_pass_through() {
        assert_eq!(normalize("79161234567"), "79161234567");
    }

    #[test]
    fn formatted_and_bare_match() {
        assert!(matches("+79161234567", "7 916 123 45 67"));
        assert!(!matches("+79161234567", "+79161234568"));
    }

    #[test]
    fn empty_never_matches() {
        assert!(!matches("", ""));
        assert!(!matches("---", "---"));
    }
}
