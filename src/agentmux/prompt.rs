//! Interactive decision prompts as a capability.
//!
//! The stage controller asks the user to confirm checkpoints, pick retry
//! actions, and supply stage modifications through the [`UserPrompt`] trait.
//! A CLI adapter is an external collaborator; this crate ships
//! [`AutoConfirmPrompt`] for non-interactive runs and tests.
//!
//! Every decision carries a timeout budget. On timeout the default value is
//! returned and `timed_out` is reported — that is part of the contract, not
//! an error.

use async_trait::async_trait;
use std::time::Duration;

/// Default per-decision budget.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// A resolved decision, flagging whether the default was substituted because
/// the budget ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome<T> {
    /// The chosen (or defaulted) value.
    pub value: T,
    /// Whether the decision timed out and the default was used.
    pub timed_out: bool,
}

impl<T> PromptOutcome<T> {
    /// A decision made in time.
    pub fn chosen(value: T) -> Self {
        Self {
            value,
            timed_out: false,
        }
    }

    /// A decision defaulted on timeout.
    pub fn defaulted(value: T) -> Self {
        Self {
            value,
            timed_out: true,
        }
    }
}

/// Capability used by the engine to ask the user for decisions.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Yes/no question.
    async fn confirm(&self, message: &str, default: bool) -> PromptOutcome<bool>;

    /// Pick one of `options`; returns the selected index.
    async fn select(
        &self,
        message: &str,
        options: &[&str],
        default_index: usize,
    ) -> PromptOutcome<usize>;

    /// Free-form text input.
    async fn text(&self, message: &str, default: &str) -> PromptOutcome<String>;

    /// Release any terminal or channel resources.
    async fn close(&self) {}
}

/// Non-interactive prompt that instantly answers every question with its
/// default.
///
/// # Example
///
/// ```rust
/// use agentmux::prompt::{AutoConfirmPrompt, UserPrompt};
///
/// # async {
/// let prompt = AutoConfirmPrompt;
/// let outcome = prompt.confirm("Continue?", true).await;
/// assert!(outcome.value);
/// assert!(!outcome.timed_out);
/// # };
/// ```
pub struct AutoConfirmPrompt;

#[async_trait]
impl UserPrompt for AutoConfirmPrompt {
    async fn confirm(&self, _message: &str, default: bool) -> PromptOutcome<bool> {
        PromptOutcome::chosen(default)
    }

    async fn select(
        &self,
        _message: &str,
        _options: &[&str],
        default_index: usize,
    ) -> PromptOutcome<usize> {
        PromptOutcome::chosen(default_index)
    }

    async fn text(&self, _message: &str, default: &str) -> PromptOutcome<String> {
        PromptOutcome::chosen(default.to_string())
    }
}

/// Wrap any prompt with a per-decision timeout; on expiry the default is
/// returned with `timed_out: true`.
pub struct TimeoutPrompt<P> {
    inner: P,
    budget: Duration,
}

impl<P> TimeoutPrompt<P> {
    /// Wrap `inner` with the given budget.
    pub fn new(inner: P, budget: Duration) -> Self {
        Self { inner, budget }
    }
}

#[async_trait]
impl<P: UserPrompt> UserPrompt for TimeoutPrompt<P> {
    async fn confirm(&self, message: &str, default: bool) -> PromptOutcome<bool> {
        match tokio::time::timeout(self.budget, self.inner.confirm(message, default)).await {
            Ok(outcome) => outcome,
            Err(_) => PromptOutcome::defaulted(default),
        }
    }

    async fn select(
        &self,
        message: &str,
        options: &[&str],
        default_index: usize,
    ) -> PromptOutcome<usize> {
        match tokio::time::timeout(
            self.budget,
            self.inner.select(message, options, default_index),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => PromptOutcome::defaulted(default_index),
        }
    }

    async fn text(&self, message: &str, default: &str) -> PromptOutcome<String> {
        match tokio::time::timeout(self.budget, self.inner.text(message, default)).await {
            Ok(outcome) => outcome,
            Err(_) => PromptOutcome::defaulted(default.to_string()),
        }
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverAnswers;

    #[async_trait]
    impl UserPrompt for NeverAnswers {
        async fn confirm(&self, _message: &str, _default: bool) -> PromptOutcome<bool> {
            std::future::pending().await
        }

        async fn select(
            &self,
            _message: &str,
            _options: &[&str],
            _default_index: usize,
        ) -> PromptOutcome<usize> {
            std::future::pending().await
        }

        async fn text(&self, _message: &str, _default: &str) -> PromptOutcome<String> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn timeout_substitutes_the_default() {
        let prompt = TimeoutPrompt::new(NeverAnswers, Duration::from_millis(20));

        let confirm = prompt.confirm("?", true).await;
        assert!(confirm.value);
        assert!(confirm.timed_out);

        let select = prompt.select("?", &["retry", "skip", "abort"], 2).await;
        assert_eq!(select.value, 2);
        assert!(select.timed_out);
    }

    #[tokio::test]
    async fn auto_confirm_answers_instantly() {
        let prompt = AutoConfirmPrompt;
        let outcome = prompt.text("notes?", "none").await;
        assert_eq!(outcome.value, "none");
        assert!(!outcome.timed_out);
    }
}
