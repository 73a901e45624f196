// Port for live template subscriptions
use crate::domain::error::TemplateError;
use crate::domain::template::TemplateSlot;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Everything needed to open one template subscription
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateRequest {
    pub template: String,
    pub entity_id: Option<String>,
    pub variables: serde_json::Value,
    pub strict: bool,
}

/// Events flowing from subscriptions back to the widget's event loop
pub enum SlotEvent {
    Subscribed {
        slot: TemplateSlot,
        generation: u64,
        handle: Box<dyn TemplateSubscription>,
    },
    SubscribeFailed {
        slot: TemplateSlot,
        generation: u64,
        error: TemplateError,
    },
    Pushed {
        slot: TemplateSlot,
        generation: u64,
        outcome: Result<String, TemplateError>,
    },
}

/// Update callback handed to a template service for one subscription.
///
/// Every push is tagged with the slot and the generation it was opened for,
/// so the event loop can ignore pushes from subscriptions it already dropped.
#[derive(Debug, Clone)]
pub struct TemplateSink {
    slot: TemplateSlot,
    generation: u64,
    events: mpsc::UnboundedSender<SlotEvent>,
}

impl TemplateSink {
    pub fn new(
        slot: TemplateSlot,
        generation: u64,
        events: mpsc::UnboundedSender<SlotEvent>,
    ) -> Self {
        Self {
            slot,
            generation,
            events,
        }
    }

    /// Deliver an evaluation result. Returns false once nobody is listening.
    pub fn push(&self, outcome: Result<String, TemplateError>) -> bool {
        self.events
            .send(SlotEvent::Pushed {
                slot: self.slot,
                generation: self.generation,
                outcome,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Cancellable handle to an open subscription
#[async_trait]
pub trait TemplateSubscription: Send + Sync {
    async fn unsubscribe(self: Box<Self>) -> Result<(), TemplateError>;
}

#[async_trait]
pub trait TemplateService: Send + Sync {
    async fn subscribe(
        &self,
        request: TemplateRequest,
        sink: TemplateSink,
    ) -> Result<Box<dyn TemplateSubscription>, TemplateError>;
}
