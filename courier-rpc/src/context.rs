//! Cancellation-capable call context.
//!
//! Replaces the original design's ambient global context: every externally
//! invoked operation takes an explicit [`Context`] carrying a cancellation
//! token and correlation tags that ride along on RPC frames.

use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Explicit per-call context.
///
/// Cheap to clone; clones share the same cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    tags: BTreeMap<String, String>,
}

impl Context {
    /// A context that is never cancelled and carries no tags.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context driven by the given cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tags: BTreeMap::new(),
        }
    }

    /// Derive a child context: cancelled when the parent is, or when the
    /// child's own token is cancelled. Tags are inherited.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            tags: self.tags.clone(),
        }
    }

    /// Attach one correlation tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Attach a set of correlation tags.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// The correlation tags carried by this context.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The underlying cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True if this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_cancelled() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.tags().is_empty());
    }

    #[test]
    fn cancel_flows_to_clones() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancel(token.clone());
        let clone = ctx.clone();
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[test]
    fn child_cancels_with_parent_not_vice_versa() {
        let token = CancellationToken::new();
        let parent = Context::with_cancel(token.clone());
        let child = parent.child();
        child.cancel_token().cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child2 = parent.child();
        token.cancel();
        assert!(child2.is_cancelled());
    }

    #[test]
    fn tags_accumulate() {
        let ctx = Context::background()
            .with_tag("req", "abc")
            .with_tag("conn", "7");
        assert_eq!(ctx.tags().get("req").unwrap(), "abc");
        assert_eq!(ctx.tags().get("conn").unwrap(), "7");

        let child = ctx.child();
        assert_eq!(child.tags().len(), 2);
    }
}
