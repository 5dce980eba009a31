//! Error classification and recovery advice.
//!
//! Raw failures are matched against ordered, case-insensitive pattern groups
//! (network, permission, configuration, storage). The first group that matches
//! decides the category; severity and recoverability follow from the category.
//! Each category maps to one user-facing message and a prioritized list of
//! executable recovery options backed by [`RecoveryHooks`].

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Network,
    Permission,
    Configuration,
    Storage,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Permission => "permission",
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
}

impl ErrorCategory {
    pub fn classification(self) -> ErrorClassification {
        let (severity, recoverable) = match self {
            Self::Network => (ErrorSeverity::Medium, true),
            Self::Permission => (ErrorSeverity::High, false),
            Self::Configuration => (ErrorSeverity::High, true),
            Self::Storage => (ErrorSeverity::Medium, true),
            Self::Unknown => (ErrorSeverity::Medium, true),
        };
        ErrorClassification {
            category: self,
            severity,
            recoverable,
        }
    }
}

/// Pattern groups in match order.
static PATTERN_GROUPS: LazyLock<Vec<(ErrorCategory, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorCategory::Network,
            r"(?i)network|fetch|timed?\s?out|connection|offline|unreachable|econn|socket|dns|channel_error|change feed",
        ),
        (
            ErrorCategory::Permission,
            r"(?i)permission|denied|not allowed|unauthori[sz]ed|forbidden",
        ),
        (
            ErrorCategory::Configuration,
            r"(?i)config|invalid (preferences|settings)|not supported|unsupported|missing (key|setting)",
        ),
        (
            ErrorCategory::Storage,
            r"(?i)storage|quota|disk|no space|persist|history",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| (category, Regex::new(pattern).expect("valid error pattern")))
    .collect()
});

/// Classify any displayable failure by its message.
pub fn classify_error<E: fmt::Display + ?Sized>(error: &E) -> ErrorClassification {
    let message = error.to_string();
    PATTERN_GROUPS
        .iter()
        .find(|(_, re)| re.is_match(&message))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
        .classification()
}

/// Message shown to end users in place of the raw error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FriendlyMessage {
    pub title: &'static str,
    pub description: &'static str,
    pub actions: Vec<&'static str>,
}

pub fn user_friendly_message<E: fmt::Display + ?Sized>(error: &E) -> FriendlyMessage {
    match classify_error(error).category {
        ErrorCategory::Network => FriendlyMessage {
            title: "Connection problem",
            description: "Notifications could not be delivered because the connection was lost. They will be retried automatically.",
            actions: vec!["Check your internet connection", "Try again"],
        },
        ErrorCategory::Permission => FriendlyMessage {
            title: "Notifications blocked",
            description: "Push notifications are not allowed. You will keep receiving in-app notifications.",
            actions: vec!["Allow notifications in your settings", "Use in-app notifications only"],
        },
        ErrorCategory::Configuration => FriendlyMessage {
            title: "Settings problem",
            description: "Your notification settings could not be read. Resetting them usually fixes this.",
            actions: vec!["Reset notification settings", "Reconnect"],
        },
        ErrorCategory::Storage => FriendlyMessage {
            title: "Storage problem",
            description: "Notification history could not be saved.",
            actions: vec!["Clear notification history", "Try again"],
        },
        ErrorCategory::Unknown => FriendlyMessage {
            title: "Something went wrong",
            description: "An unexpected error occurred while delivering notifications.",
            actions: vec!["Try again"],
        },
    }
}

/// Side effects recovery options may trigger. Every hook is idempotent and
/// reports whether it succeeded.
#[async_trait]
pub trait RecoveryHooks: Send + Sync {
    /// Run the standing failure queue now.
    async fn retry_failed(&self) -> anyhow::Result<bool>;
    /// Re-establish the live change feed.
    async fn reconnect(&self) -> anyhow::Result<bool>;
    /// Stop attempting push and rely on in-app delivery.
    async fn use_in_app_only(&self) -> anyhow::Result<bool>;
    /// Re-check whether push delivery is permitted.
    async fn check_permission(&self) -> anyhow::Result<bool>;
    async fn reset_preferences(&self) -> anyhow::Result<bool>;
    async fn clear_history(&self) -> anyhow::Result<bool>;
}

pub type RecoveryAction = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Clone)]
pub struct RecoveryOption {
    pub label: &'static str,
    /// Lower runs first.
    pub priority: u8,
    pub action: RecoveryAction,
}

impl fmt::Debug for RecoveryOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOption")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum Hook {
    RetryFailed,
    Reconnect,
    UseInAppOnly,
    CheckPermission,
    ResetPreferences,
    ClearHistory,
}

fn hook_action(hooks: &Arc<dyn RecoveryHooks>, hook: Hook) -> RecoveryAction {
    let hooks = Arc::clone(hooks);
    Arc::new(move || {
        let hooks = Arc::clone(&hooks);
        async move {
            match hook {
                Hook::RetryFailed => hooks.retry_failed().await,
                Hook::Reconnect => hooks.reconnect().await,
                Hook::UseInAppOnly => hooks.use_in_app_only().await,
                Hook::CheckPermission => hooks.check_permission().await,
                Hook::ResetPreferences => hooks.reset_preferences().await,
                Hook::ClearHistory => hooks.clear_history().await,
            }
        }
        .boxed()
    })
}

/// Recovery options for `error`, ordered by ascending priority.
pub fn recovery_options<E: fmt::Display + ?Sized>(
    error: &E,
    hooks: &Arc<dyn RecoveryHooks>,
) -> Vec<RecoveryOption> {
    let table: &[(&'static str, u8, Hook)] = match classify_error(error).category {
        ErrorCategory::Network => &[
            ("Retry now", 1, Hook::RetryFailed),
            ("Reconnect live updates", 2, Hook::Reconnect),
        ],
        ErrorCategory::Permission => &[
            ("Use in-app notifications only", 1, Hook::UseInAppOnly),
            ("Check notification permission", 2, Hook::CheckPermission),
        ],
        ErrorCategory::Configuration => &[
            ("Reset notification settings", 1, Hook::ResetPreferences),
            ("Reconnect live updates", 2, Hook::Reconnect),
        ],
        ErrorCategory::Storage => &[
            ("Clear notification history", 1, Hook::ClearHistory),
            ("Retry now", 2, Hook::RetryFailed),
        ],
        ErrorCategory::Unknown => &[("Retry now", 1, Hook::RetryFailed)],
    };

    let mut options: Vec<RecoveryOption> = table
        .iter()
        .map(|&(label, priority, hook)| RecoveryOption {
            label,
            priority,
            action: hook_action(hooks, hook),
        })
        .collect();
    options.sort_by_key(|o| o.priority);
    options
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub error: Option<String>,
}

/// Running error counters. Only `reset_stats` clears them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    pub by_severity: HashMap<ErrorSeverity, u64>,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// Logs classified errors, keeps statistics and runs recovery actions.
pub struct ErrorRecovery {
    stats: Mutex<ErrorStats>,
}

impl ErrorRecovery {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(ErrorStats::default()),
        }
    }

    /// Classify, count and log `error`. Never fails.
    pub fn log_error<E: fmt::Display + ?Sized>(
        &self,
        error: &E,
        context: Option<&serde_json::Value>,
    ) -> ErrorClassification {
        let classification = classify_error(error);
        {
            let mut stats = self.stats.lock();
            stats.total += 1;
            *stats.by_category.entry(classification.category).or_default() += 1;
            *stats.by_severity.entry(classification.severity).or_default() += 1;
            stats.last_error_time = Some(Utc::now());
        }

        let context = context.map(|c| c.to_string()).unwrap_or_default();
        match classification.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => tracing::error!(
                category = %classification.category,
                severity = %classification.severity,
                recoverable = classification.recoverable,
                context = %context,
                "{}", error
            ),
            ErrorSeverity::Medium => tracing::warn!(
                category = %classification.category,
                severity = %classification.severity,
                recoverable = classification.recoverable,
                context = %context,
                "{}", error
            ),
            ErrorSeverity::Low => tracing::info!(
                category = %classification.category,
                severity = %classification.severity,
                recoverable = classification.recoverable,
                context = %context,
                "{}", error
            ),
        }

        classification
    }

    /// Run a recovery action. Its error or panic is captured in the result.
    pub async fn attempt_recovery<E: fmt::Display + ?Sized>(
        &self,
        error: &E,
        action: &RecoveryAction,
    ) -> RecoveryResult {
        let category = classify_error(error).category;
        tracing::info!(category = %category, "Attempting recovery");

        let result = match AssertUnwindSafe(action()).catch_unwind().await {
            Ok(Ok(true)) => RecoveryResult {
                success: true,
                error: None,
            },
            Ok(Ok(false)) => RecoveryResult {
                success: false,
                error: Some("recovery action reported failure".to_string()),
            },
            Ok(Err(e)) => RecoveryResult {
                success: false,
                error: Some(e.to_string()),
            },
            Err(_) => RecoveryResult {
                success: false,
                error: Some("recovery action panicked".to_string()),
            },
        };

        if result.success {
            tracing::info!(category = %category, "Recovery succeeded");
        } else {
            tracing::warn!(
                category = %category,
                error = result.error.as_deref().unwrap_or_default(),
                "Recovery failed"
            );
        }
        result
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = ErrorStats::default();
    }
}

impl Default for ErrorRecovery {
    fn default() -> Self {
        Self::new()
    }
}
