use uuid::Uuid;

/// W3C trace-context identifiers correlating one client request across the
/// gateway and every backend call it fans out to.
///
/// Continued from an inbound `traceparent` header when one is present,
/// otherwise minted fresh. Each outbound backend call gets a child context
/// (same trace id, fresh span id) injected as its own `traceparent`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub sampled: bool,
}

const TRACEPARENT_VERSION: &str = "00";

impl TraceContext {
    pub fn new() -> Self {
        TraceContext {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            sampled: true,
        }
    }

    /// Parses a `traceparent` header value. Returns `None` for anything
    /// malformed; callers start a fresh trace in that case.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version != TRACEPARENT_VERSION {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || trace_id.chars().all(|c| c == '0') {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        Some(TraceContext {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled: flags.ends_with('1'),
        })
    }

    pub fn continue_or_start(header: Option<&str>) -> Self {
        header
            .and_then(TraceContext::from_traceparent)
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::new)
    }

    /// Same trace, fresh span id.
    pub fn child(&self) -> Self {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            sampled: self.sampled,
        }
    }

    /// Header value for outbound propagation.
    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!(
            "{}-{}-{}-{}",
            TRACEPARENT_VERSION, self.trace_id, self.span_id, flags
        )
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        TraceContext::new()
    }
}

fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
