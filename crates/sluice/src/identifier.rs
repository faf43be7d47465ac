//! Dialect identifier policy
//!
//! Warehouses disagree on what a table or column may be called. Each adapter
//! carries an [`IdentifierPolicy`] describing its rules; the engine pushes
//! every caller-supplied name through it before the name reaches DDL.
//! Normalization is idempotent: feeding a normalized name back in returns it
//! unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static SAFE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Per-dialect identifier rules.
#[derive(Debug, Clone)]
pub struct IdentifierPolicy {
    /// Maximum identifier length after normalization.
    pub max_length: usize,
    /// Words that cannot be used bare; they get a hash suffix.
    pub reserved_words: &'static [&'static str],
    /// Quote character used by [`IdentifierPolicy::quote`].
    pub quote_char: char,
    /// Fold identifiers to lower case before applying the other rules.
    pub lowercase: bool,
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self {
            max_length: 63,
            reserved_words: &[],
            quote_char: '"',
            lowercase: false,
        }
    }
}

impl IdentifierPolicy {
    pub fn is_reserved(&self, ident: &str) -> bool {
        let lowered = ident.to_ascii_lowercase();
        self.reserved_words.iter().any(|w| *w == lowered)
    }

    /// Normalize an identifier for this dialect.
    ///
    /// Unsupported characters are stripped, a numeric first character is
    /// escaped with an underscore, over-long names are clamped with a
    /// deterministic hash suffix, and empty or reserved results fall back to
    /// a hash-suffixed placeholder.
    pub fn normalize(&self, ident: &str) -> String {
        let source = if self.lowercase {
            ident.to_lowercase()
        } else {
            ident.to_string()
        };

        let mut cleaned: String = source
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();

        if cleaned
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            cleaned.insert(0, '_');
        }

        if cleaned.is_empty() {
            return format!("column_{}", short_hash(ident));
        }

        if self.is_reserved(&cleaned) {
            cleaned = format!("{}_{}", cleaned, short_hash(&cleaned));
        }

        if cleaned.len() > self.max_length {
            let hash = short_hash(&cleaned);
            let keep = self.max_length.saturating_sub(hash.len() + 1);
            cleaned = format!("{}_{}", &cleaned[..keep], hash);
        }

        cleaned
    }

    /// Quote an identifier with the dialect's quote character.
    pub fn quote(&self, ident: &str) -> String {
        let q = self.quote_char;
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Whether a name is already in normalized form.
    pub fn is_normalized(&self, ident: &str) -> bool {
        SAFE_IDENTIFIER.is_match(ident)
            && ident.len() <= self.max_length
            && !self.is_reserved(ident)
            && (!self.lowercase || ident == ident.to_lowercase())
    }
}

/// Deterministic 8-hex-digit suffix for clamped and fallback names.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> IdentifierPolicy {
        IdentifierPolicy {
            max_length: 24,
            reserved_words: &["select", "from", "table"],
            quote_char: '"',
            lowercase: false,
        }
    }

    #[test]
    fn test_plain_names_untouched() {
        let p = policy();
        assert_eq!(p.normalize("events"), "events");
        assert_eq!(p.normalize("user_id"), "user_id");
    }

    #[test]
    fn test_strips_unsupported_chars() {
        let p = policy();
        assert_eq!(p.normalize("user name!"), "username");
        assert_eq!(p.normalize("a-b.c"), "abc");
    }

    #[test]
    fn test_numeric_prefix_escaped() {
        let p = policy();
        assert_eq!(p.normalize("1st_column"), "_1st_column");
    }

    #[test]
    fn test_reserved_word_gets_suffix() {
        let p = policy();
        let out = p.normalize("select");
        assert!(out.starts_with("select_"));
        assert_ne!(out, "select");
    }

    #[test]
    fn test_empty_falls_back_to_placeholder() {
        let p = policy();
        let out = p.normalize("!!!");
        assert!(out.starts_with("column_"));
        // Distinct garbage yields distinct placeholders
        assert_ne!(p.normalize("!!!"), p.normalize("???"));
    }

    #[test]
    fn test_length_clamp() {
        let p = policy();
        let long = "a".repeat(100);
        let out = p.normalize(&long);
        assert!(out.len() <= p.max_length);
        // Clamped names from different inputs stay distinct
        let other = format!("{}b", "a".repeat(100));
        assert_ne!(out, p.normalize(&other));
    }

    #[test]
    fn test_normalize_idempotent() {
        let p = policy();
        for input in [
            "events",
            "user name!",
            "1st_column",
            "select",
            "!!!",
            &"x".repeat(80),
            "Крокодил",
        ] {
            let once = p.normalize(input);
            assert_eq!(p.normalize(&once), once, "input: {input:?}");
            assert!(p.is_normalized(&once), "not normalized: {once:?}");
        }
    }

    #[test]
    fn test_lowercase_policy() {
        let p = IdentifierPolicy {
            lowercase: true,
            ..policy()
        };
        assert_eq!(p.normalize("UserId"), "userid");
        assert_eq!(p.normalize(&p.normalize("UserId")), "userid");
    }

    #[test]
    fn test_quote_escapes_embedded_quotes() {
        let p = policy();
        assert_eq!(p.quote("plain"), "\"plain\"");
        assert_eq!(p.quote("we\"ird"), "\"we\"\"ird\"");
    }
}
