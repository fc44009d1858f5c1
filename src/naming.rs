//! Slug normalization and random identifier material.

use rand::Rng;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Normalize free-form input into a DNS-friendly slug.
///
/// Lowercases the input, keeps `[a-z0-9]`, maps `-`, `_` and spaces to a
/// single `-` (collapsing runs), and trims leading/trailing separators.
/// Returns an empty string when nothing usable remains; callers treat that
/// as invalid input.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.to_lowercase().chars() {
        match c {
            'a'..='z' | '0'..='9' => slug.push(c),
            '-' | '_' | ' ' => {
                if !slug.is_empty() && !slug.ends_with('-') {
                    slug.push('-');
                }
            }
            _ => {}
        }
    }
    slug.trim_matches('-').to_string()
}

/// Random lowercase alphanumeric suffix for de-duplicating store ids.
pub fn random_suffix(length: usize) -> String {
    random_from(ID_ALPHABET, length)
}

/// Random mixed-case alphanumeric string, used for generated credentials.
pub fn random_string(length: usize) -> String {
    random_from(PASSWORD_ALPHABET, length)
}

fn random_from(alphabet: &[u8], length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_joins_words() {
        assert_eq!(slugify("My Shop"), "my-shop");
        assert_eq!(slugify("Fancy_Store Name"), "fancy-store-name");
    }

    #[test]
    fn slugify_collapses_separator_runs() {
        assert_eq!(slugify("a -- _ b"), "a-b");
        assert_eq!(slugify("--edge--"), "edge");
    }

    #[test]
    fn slugify_drops_non_alphanumerics() {
        assert_eq!(slugify("shop!@#$%^&*()"), "shop");
        assert_eq!(slugify("caf\u{e9} 42"), "caf-42");
    }

    #[test]
    fn slugify_rejects_unusable_input_with_empty_result() {
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify("   "), "");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn slugify_is_idempotent() {
        for input in ["My Shop", "a--b", "  x_y  ", "Already-Fine"] {
            let once = slugify(input);
            assert_eq!(slugify(&once), once);
        }
    }

    #[test]
    fn random_suffix_is_lowercase_alphanumeric() {
        let s = random_suffix(4);
        assert_eq!(s.len(), 4);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn random_string_has_requested_length() {
        assert_eq!(random_string(20).len(), 20);
        assert_eq!(random_string(0).len(), 0);
    }
}
