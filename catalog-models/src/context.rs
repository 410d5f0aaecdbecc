use std::fmt;

use uuid::Uuid;

/// Header carrying an upstream trace identifier on broker messages.
pub const TRACE_HEADER: &str = "trace-id";

/// Per-operation context threaded explicitly through handlers, units of work
/// and repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    trace_id: Uuid,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
        }
    }

    pub fn with_trace_id(trace_id: Uuid) -> Self {
        Self { trace_id }
    }

    /// Builds a context from a raw header value, falling back to a fresh trace
    /// id when the header is missing or unparseable.
    pub fn from_header(value: Option<&[u8]>) -> Self {
        value
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|text| Uuid::parse_str(text.trim()).ok())
            .map(Self::with_trace_id)
            .unwrap_or_default()
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace={}", self.trace_id.simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_with_valid_uuid_is_reused() {
        let id = Uuid::new_v4();
        let context = RequestContext::from_header(Some(id.to_string().as_bytes()));
        assert_eq!(context.trace_id(), id);
    }

    #[test]
    fn garbage_header_yields_fresh_trace() {
        let first = RequestContext::from_header(Some(b"not-a-uuid"));
        let second = RequestContext::from_header(None);
        assert_ne!(first.trace_id(), second.trace_id());
    }
}
