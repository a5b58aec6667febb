//! Flag/environment resolution shared by the binaries, and the shared
//! credential pair used between workers and the index.

use base64::{engine::general_purpose::STANDARD, Engine as _};

pub const ENV_INDEX_ADDR: &str = "RELAY_INDEX_ADDR";
pub const ENV_INDEX_USERNAME: &str = "RELAY_INDEX_USERNAME";
pub const ENV_INDEX_PASSWORD: &str = "RELAY_INDEX_PASSWORD";
pub const ENV_WORKER_NAME: &str = "RELAY_WORKER_NAME";
pub const ENV_WORKER_ADDR: &str = "RELAY_WORKER_ADDR";
pub const ENV_LOG_DIR: &str = "RELAY_LOG_DIR";
pub const ENV_DEBUG: &str = "RELAY_DEBUG";
pub const ENV_LOG_LEVEL: &str = "RELAY_LOG_LEVEL";

pub const DEFAULT_INDEX_ADDR: &str = "127.0.0.1:4000";
pub const DEFAULT_WORKER_ADDR: &str = "127.0.0.1:4001";

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// First non-blank of: the flag, the environment variable, the default.
pub fn resolve(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    /// None unless a username is set; an empty password is allowed.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.trim().is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn resolve(username_flag: &str, password_flag: &str) -> Option<Self> {
        Self::from_parts(
            &resolve(username_flag, ENV_INDEX_USERNAME, ""),
            &resolve(password_flag, ENV_INDEX_PASSWORD, ""),
        )
    }

    /// Value for an `Authorization` header.
    pub fn authorization_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Checks an `Authorization` header value against this pair.
    pub fn verify(&self, header: &str) -> bool {
        let Some(encoded) = header.trim().strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((username, password)) => {
                username == self.username && password == self.password
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_flag_then_env_then_default() {
        let key = "RELAY_TEST_RESOLVE_ORDER";
        std::env::remove_var(key);
        assert_eq!(resolve("", key, "fallback"), "fallback");
        std::env::set_var(key, "from-env");
        assert_eq!(resolve(" ", key, "fallback"), "from-env");
        assert_eq!(resolve("from-flag", key, "fallback"), "from-flag");
        std::env::set_var(key, "   ");
        assert_eq!(resolve("", key, "fallback"), "fallback");
        std::env::remove_var(key);
    }

    #[test]
    fn env_true_accepts_common_spellings() {
        let key = "RELAY_TEST_ENV_TRUE";
        for value in ["1", "true", "YES", " on "] {
            std::env::set_var(key, value);
            assert!(env_true(key), "{value} should be true");
        }
        std::env::set_var(key, "off");
        assert!(!env_true(key));
        std::env::remove_var(key);
        assert!(!env_true(key));
    }

    #[test]
    fn credentials_round_trip_through_header() {
        let credentials = Credentials::from_parts("bob", "s3cr:et").expect("credentials");
        let header = credentials.authorization_header();
        assert_eq!(header, "Basic Ym9iOnMzY3I6ZXQ=");
        assert!(credentials.verify(&header));
        assert!(!credentials.verify("Basic Ym9iOndyb25n"));
        assert!(!credentials.verify("Bearer Ym9iOnMzY3I6ZXQ="));
        assert!(!credentials.verify("Basic !!!"));
    }

    #[test]
    fn credentials_need_a_username() {
        assert!(Credentials::from_parts("", "pw").is_none());
        assert!(Credentials::from_parts("bob", "").is_some());
        let shown = format!("{:?}", Credentials::from_parts("bob", "pw").expect("credentials"));
        assert!(!shown.contains("pw"));
    }
}
