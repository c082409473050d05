use std::time::{Duration, Instant};

use crate::types::Principal;

/// Per-operation context carrying identity, request correlation, and the deadline.
///
/// Built once per inbound operation by the transport-facing wrapper and
/// read-only afterwards. Nested work may derive an extended copy (a child span,
/// a tighter deadline) but can never change `identity` or `request_id`: the
/// derivation methods below are the only way to produce a context from an
/// existing one, and they copy both fields verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    identity: Option<Principal>,
    request_id: String,
    trace_id: String,
    span_id: Option<String>,
    started_at_ms: u64,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Creates a context for a new operation. The trace id defaults to the request id.
    #[must_use]
    pub fn new(request_id: impl Into<String>, started_at_ms: u64) -> Self {
        let request_id = request_id.into();
        Self {
            identity: None,
            trace_id: request_id.clone(),
            request_id,
            span_id: None,
            started_at_ms,
            deadline: None,
        }
    }

    // -- construction-time builders -----------------------------------------

    #[must_use]
    pub fn with_identity(mut self, identity: Option<Principal>) -> Self {
        self.identity = identity;
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the deadline to `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    // -- derivation ---------------------------------------------------------

    /// Derives a context for a nested span of work.
    #[must_use]
    pub fn child(&self, span_id: impl Into<String>) -> Self {
        Self {
            span_id: Some(span_id.into()),
            ..self.clone()
        }
    }

    /// Derives a context whose deadline is the earlier of the current one and `deadline`.
    ///
    /// A derived context can only shorten the time budget, never extend it.
    #[must_use]
    pub fn with_tighter_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn identity(&self) -> Option<&Principal> {
        self.identity.as_ref()
    }

    /// Identifier of the acting principal, used as the audit actor.
    #[must_use]
    pub fn actor(&self) -> Option<&str> {
        self.identity.as_ref().map(|p| p.id.as_str())
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    #[must_use]
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when the operation is unbounded;
    /// `Some(Duration::ZERO)` once the deadline has passed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("req-1", 1_700_000_000_000)
            .with_identity(Some(Principal::new("alice")))
    }

    #[test]
    fn trace_id_defaults_to_request_id() {
        let c = RequestContext::new("req-9", 0);
        assert_eq!(c.trace_id(), "req-9");
        assert!(c.identity().is_none());
        assert!(c.deadline().is_none());
        assert!(c.remaining().is_none());
        assert!(!c.is_expired());
    }

    #[test]
    fn child_preserves_identity_and_request_id() {
        let parent = ctx().with_trace_id("trace-abc");
        let child = parent.child("span-2");
        assert_eq!(child.request_id(), parent.request_id());
        assert_eq!(child.identity(), parent.identity());
        assert_eq!(child.trace_id(), "trace-abc");
        assert_eq!(child.span_id(), Some("span-2"));
        assert_eq!(parent.span_id(), None);
    }

    #[test]
    fn tighter_deadline_never_extends() {
        let now = Instant::now();
        let parent = ctx().with_deadline(now + Duration::from_secs(1));

        let shorter = parent.with_tighter_deadline(now + Duration::from_millis(100));
        assert_eq!(shorter.deadline(), Some(now + Duration::from_millis(100)));

        let longer = parent.with_tighter_deadline(now + Duration::from_secs(10));
        assert_eq!(longer.deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(longer.actor(), Some("alice"));
    }

    #[test]
    fn tighter_deadline_on_unbounded_context_sets_it() {
        let now = Instant::now();
        let c = ctx().with_tighter_deadline(now + Duration::from_millis(5));
        assert_eq!(c.deadline(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn expired_deadline_reports_zero_remaining() {
        let c = ctx().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(c.remaining(), Some(Duration::ZERO));
        assert!(c.is_expired());
    }
}
