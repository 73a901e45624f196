// Error kinds surfaced by the history and template collaborators

/// Failure fetching history from the backend. The widget keeps its buffer when this happens.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("history request failed: {0}")]
    Request(String),
    #[error("history backend returned {status}: {body}")]
    Backend { status: u16, body: String },
    #[error("history response could not be decoded: {0}")]
    Decode(String),
}

/// Failure subscribing to, or cancelling, a template subscription.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template subscription not found")]
    NotFound,
    #[error("template evaluation failed: {0}")]
    Evaluation(String),
    #[error("template connection failed: {0}")]
    Connection(String),
}

impl TemplateError {
    /// Whether a cancellation error just means the subscription is already gone
    pub fn is_already_closed(&self) -> bool {
        matches!(self, TemplateError::NotFound | TemplateError::Evaluation(_))
    }
}

/// The widget's event loop has stopped and no longer accepts events
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("graph widget has shut down")]
pub struct WidgetClosed;
