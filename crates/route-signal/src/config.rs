//! Coordinator configuration.

use serde::{Deserialize, Serialize};

/// Environment variable controlling strict match validation.
pub const ENV_STRICT: &str = "ROUTE_SIGNAL_STRICT";

/// Behaviour switches for [`CancellationCoordinator`](crate::CancellationCoordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Reject match sets that reference routes outside the tree.
    ///
    /// When disabled, unknown ids are tracked like routes without an
    /// operation: they get a controller and are cancelled when they leave,
    /// but nothing runs for them.
    #[serde(default = "default_strict")]
    pub strict: bool,
}

const fn default_strict() -> bool {
    true
}

impl CoordinatorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `ROUTE_SIGNAL_STRICT`: `false`/`0` disables strict validation (default: strict)
    #[must_use]
    pub fn from_env() -> Self {
        let strict = std::env::var(ENV_STRICT).map_or_else(
            |_| default_strict(),
            |v| !(v.eq_ignore_ascii_case("false") || v == "0"),
        );

        Self { strict }
    }

    #[must_use]
    pub const fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            strict: default_strict(),
        }
    }
}
