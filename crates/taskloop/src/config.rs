// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop configuration: a closed, enumerated option set rather than a
//! free-form map.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Reason;

/// Hint for the ingress drain strategy. The scheduler always pops at
/// most one ingress task per tick regardless of this setting — only
/// whether it first consults the queue's approximate length to decide
/// it's worth attempting a pop is affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathMode {
    /// Consult the approximate length before popping (default).
    Auto,
    /// Always consult the approximate length before popping.
    Forced,
    /// Never consult it; always attempt the pop directly.
    Disabled,
}

pub type UnhandledRejectionHandler = Arc<dyn Fn(Reason) + Send + Sync>;

/// Construction-time options for an event loop. A `new()` / `with_*()`
/// idiom rather than a generic builder trait: the option set is small,
/// closed, and unlikely to grow.
pub struct LoopConfig {
    pub debug_mode: bool,
    pub metrics: bool,
    pub strict_microtask_ordering: bool,
    pub fast_path_mode: FastPathMode,
    pub max_block_time: Duration,
    pub unhandled_rejection_handler: Option<UnhandledRejectionHandler>,
}

impl LoopConfig {
    /// Defaults: no debug capture, metrics counters still updated but
    /// unread (see `LoopMetrics`), relaxed microtask ordering, `Auto`
    /// fast-path, a 10 second poll ceiling, no rejection handler.
    pub fn new() -> Self {
        Self {
            debug_mode: false,
            metrics: false,
            strict_microtask_ordering: false,
            fast_path_mode: FastPathMode::Auto,
            max_block_time: Duration::from_secs(10),
            unhandled_rejection_handler: None,
        }
    }

    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    pub fn with_strict_microtask_ordering(mut self, enabled: bool) -> Self {
        self.strict_microtask_ordering = enabled;
        self
    }

    pub fn with_fast_path_mode(mut self, mode: FastPathMode) -> Self {
        self.fast_path_mode = mode;
        self
    }

    pub fn with_max_block_time(mut self, d: Duration) -> Self {
        self.max_block_time = d;
        self
    }

    pub fn with_unhandled_rejection_handler(
        mut self,
        handler: impl Fn(Reason) + Send + Sync + 'static,
    ) -> Self {
        self.unhandled_rejection_handler = Some(Arc::new(handler));
        self
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = LoopConfig::new();
        assert!(!cfg.debug_mode);
        assert!(!cfg.metrics);
        assert!(!cfg.strict_microtask_ordering);
        assert_eq!(cfg.fast_path_mode, FastPathMode::Auto);
        assert_eq!(cfg.max_block_time, Duration::from_secs(10));
        assert!(cfg.unhandled_rejection_handler.is_none());
    }

    #[test]
    fn builders_chain() {
        let cfg = LoopConfig::new()
            .with_debug_mode(true)
            .with_metrics(true)
            .with_max_block_time(Duration::from_millis(500));
        assert!(cfg.debug_mode);
        assert!(cfg.metrics);
        assert_eq!(cfg.max_block_time, Duration::from_millis(500));
    }
}
