//! Runtime environment detection.
//!
//! Single source of truth for "are we under test" so config-path resolution
//! and timing constants can be overridden without touching the real
//! filesystem or waiting out real intervals.
//!
//! Set `OVERLORD_ENV=test` to switch into test mode.

/// Runtime environment for either binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Default runtime mode.
    Production,
    /// Unit/integration test mode: config paths are redirected, retry/poll
    /// intervals may be shortened by callers that check `is_test()`.
    Test,
}

impl Environment {
    /// Detect current environment from `OVERLORD_ENV`.
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("OVERLORD_ENV").as_deref() {
            Ok("test") => Self::Test,
            _ => Self::Production,
        }
    }

    /// Returns `true` if running under test.
    #[must_use]
    pub fn is_test(self) -> bool {
        self == Self::Test
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Convenience function equivalent to `Environment::current().is_test()`.
#[must_use]
pub fn is_test_mode() -> bool {
    Environment::current().is_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_variant() {
        assert_eq!(Environment::Production.to_string(), "production");
        assert_eq!(Environment::Test.to_string(), "test");
    }
}
