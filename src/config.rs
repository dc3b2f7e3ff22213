//! Environment-derived configuration.

use tracing::warn;

/// Environment variable holding the NVD API key.
pub const NVD_API_KEY_VAR: &str = "NVD_API_KEY";

/// Environment variable holding the GitHub token for advisory queries.
pub const GITHUB_TOKEN_VAR: &str = "GITHUB_TOKEN";

/// Read a secret from the environment.
///
/// A value starting with `op://` is an unexpanded secret-manager reference,
/// not a credential; it is reported and ignored rather than sent upstream.
pub fn secret_from_env(var: &str) -> Option<String> {
    let value = std::env::var(var).ok()?;
    if value.is_empty() {
        return None;
    }
    if value.starts_with("op://") {
        warn!(
            var,
            "Environment variable holds an unexpanded secret reference, ignoring it",
        );
        return None;
    }
    Some(value)
}

pub fn nvd_api_key() -> Option<String> {
    secret_from_env(NVD_API_KEY_VAR)
}

pub fn github_token() -> Option<String> {
    secret_from_env(GITHUB_TOKEN_VAR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_empty_values_read_as_none() {
        assert_eq!(secret_from_env("VULNMIRROR_TEST_UNSET"), None);

        std::env::set_var("VULNMIRROR_TEST_EMPTY", "");
        assert_eq!(secret_from_env("VULNMIRROR_TEST_EMPTY"), None);
    }

    #[test]
    fn plain_values_pass_through() {
        std::env::set_var("VULNMIRROR_TEST_PLAIN", "abc123");
        assert_eq!(
            secret_from_env("VULNMIRROR_TEST_PLAIN"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn op_references_are_refused() {
        std::env::set_var("VULNMIRROR_TEST_OP", "op://vault/item/field");
        assert_eq!(secret_from_env("VULNMIRROR_TEST_OP"), None);
    }
}
