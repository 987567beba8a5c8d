//! Error signatures: normalize away volatile details, then hash.

use std::{fmt::Debug, sync::OnceLock};

use regex::Regex;
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest.
const SIGNATURE_LEN: usize = 16;

/// Versioned normalization rules.
///
/// Two reports with equal signatures are the same error. Changing the rules
/// changes `version()`, which makes the registry re-sign stored records.
pub trait SignaturePolicy: Debug + Send + Sync {
    fn version(&self) -> u32;

    fn normalize_location(&self, location: &str) -> String;

    fn normalize_message(&self, message: &str) -> String;

    fn signature(&self, location: &str, message: &str) -> String {
        hash_signature(
            self.version(),
            &self.normalize_location(location),
            &self.normalize_message(message),
        )
    }
}

/// First rule set: line numbers, addresses, timestamps and quoted literals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct V1Policy;

fn message_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            // Before the `:N:` rule, which would split `hh:mm:ss`.
            (r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}", "TIMESTAMP"),
            (r"(?i)line \d+", "line N"),
            (r":\d+:", ":N:"),
            (r"\[\d+\]", "[N]"),
            (r"0x[0-9a-fA-F]+", "ADDR"),
            (r"'[^']*'", "'X'"),
            (r#""[^"]*""#, "\"X\""),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern).ok().map(|re| (re, replacement))
        })
        .collect()
    })
}

impl SignaturePolicy for V1Policy {
    fn version(&self) -> u32 {
        1
    }

    fn normalize_location(&self, location: &str) -> String {
        let unified = location.trim().replace('\\', "/");
        let mut rest = unified.as_str();
        while let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        }
        rest.trim_start_matches('/').to_lowercase()
    }

    fn normalize_message(&self, message: &str) -> String {
        let normalized = message_rules()
            .iter()
            .fold(message.replace('\\', "/"), |text, (re, replacement)| {
                re.replace_all(&text, *replacement).into_owned()
            });
        normalized
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// `sha256("v{version}:{location}:{message}")`, truncated.
#[must_use]
pub fn hash_signature(version: u32, location: &str, message: &str) -> String {
    let digest = Sha256::digest(format!("v{version}:{location}:{message}").as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(SIGNATURE_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn volatile_tokens_are_replaced() {
        let policy = V1Policy;
        assert_eq!(
            policy.normalize_message(
                "TypeError at Line 10: 'foo' is not callable (0xDEADbeef) at 2024-01-31T10:20:30"
            ),
            "typeerror at line n: 'x' is not callable (addr) at timestamp"
        );
        assert_eq!(
            policy.normalize_message("main.rs:42:7 index [3] out of   bounds"),
            "main.rs:n:7 index [n] out of bounds"
        );
        assert_eq!(policy.normalize_message(r#"missing "config.toml""#), "missing \"x\"");
    }

    #[test]
    fn locations_are_normalized() {
        let policy = V1Policy;
        assert_eq!(policy.normalize_location(".\\Src\\App.py"), "src/app.py");
        assert_eq!(policy.normalize_location("///src/app.py"), "src/app.py");
        assert_eq!(policy.normalize_location("././src/app.py"), "src/app.py");
    }

    #[test]
    fn meaningful_numbers_survive() {
        let policy = V1Policy;
        assert_ne!(
            policy.signature("a.py", "expected 2 arguments"),
            policy.signature("a.py", "expected 3 arguments")
        );
    }

    #[test]
    fn signature_is_sixteen_hex_chars() {
        let sig = V1Policy.signature("src/app.py", "boom");
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, hash_signature(1, "src/app.py", "boom"));
    }

    proptest! {
        #[test]
        fn line_numbers_never_split_an_error(a in 0_u32..100_000, b in 0_u32..100_000) {
            let policy = V1Policy;
            prop_assert_eq!(
                policy.signature("src/app.py", &format!("TypeError: bad operand at line {a}")),
                policy.signature("src/app.py", &format!("TypeError: bad operand at line {b}"))
            );
        }

        #[test]
        fn separators_and_case_never_split_an_error(path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}\\.py") {
            let policy = V1Policy;
            let windows = format!(".\\{}", path.replace('/', "\\").to_uppercase());
            prop_assert_eq!(
                policy.signature(&path, "ImportError: no module"),
                policy.signature(&windows, "ImportError: no module")
            );
        }

        #[test]
        fn whitespace_runs_never_split_an_error(pad in "[ \t]{1,5}") {
            let policy = V1Policy;
            prop_assert_eq!(
                policy.signature("a.py", "name error"),
                policy.signature("a.py", &format!("{pad}name{pad}error{pad}"))
            );
        }
    }
}
