// Lifecycle of the per-slot template subscriptions
use crate::application::template_service::{
    SlotEvent, TemplateRequest, TemplateService, TemplateSink, TemplateSubscription,
};
use crate::domain::error::TemplateError;
use crate::domain::template::{is_live_expression, TemplateSlot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Connecting,
    Live,
    /// Disconnected while the subscribe call was still in flight; the handle is
    /// cancelled as soon as it arrives.
    Closing,
    Closed,
}

/// Variables shared by every subscription opened for the current configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateContext {
    pub entity_id: Option<String>,
    pub variables: serde_json::Value,
}

/// What a subscription was opened for
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubscriptionKey {
    expression: String,
    entity_id: Option<String>,
}

struct SlotEntry {
    state: SlotState,
    generation: u64,
    key: Option<SubscriptionKey>,
    handle: Option<Box<dyn TemplateSubscription>>,
    in_flight: bool,
    last_result: Option<String>,
    failed: Option<SubscriptionKey>,
}

impl Default for SlotEntry {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            generation: 0,
            key: None,
            handle: None,
            in_flight: false,
            last_result: None,
            failed: None,
        }
    }
}

/// Keeps at most one subscription per slot and falls back to the raw
/// expression text when a subscription cannot be opened.
pub struct SubscriptionManager {
    service: Arc<dyn TemplateService>,
    events: mpsc::UnboundedSender<SlotEvent>,
    slots: HashMap<TemplateSlot, SlotEntry>,
    active: bool,
}

impl SubscriptionManager {
    pub fn new(service: Arc<dyn TemplateService>, events: mpsc::UnboundedSender<SlotEvent>) -> Self {
        Self {
            service,
            events,
            slots: HashMap::new(),
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The host session is available; subscriptions may be opened
    pub fn attach(&mut self) {
        self.active = true;
    }

    /// Tear down every slot. All slots are attempted; the first fatal error is returned.
    pub async fn detach(&mut self) -> Result<(), TemplateError> {
        self.active = false;
        let mut first_error = None;
        for slot in TemplateSlot::ALL {
            if let Err(e) = self.disconnect(slot).await {
                tracing::error!("Failed to close {} template: {}", slot, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn state(&self, slot: TemplateSlot) -> SlotState {
        self.slots
            .get(&slot)
            .map(|entry| entry.state)
            .unwrap_or(SlotState::Idle)
    }

    /// Whether a subscription is open or being opened for the slot
    pub fn is_outstanding(&self, slot: TemplateSlot) -> bool {
        self.slots
            .get(&slot)
            .is_some_and(|entry| entry.handle.is_some() || entry.in_flight)
    }

    /// Current display value: the static text, or the latest evaluation of a live expression
    pub fn value(&self, slot: TemplateSlot, expression: Option<&str>) -> Option<String> {
        let expression = expression?;
        if !is_live_expression(expression) {
            return Some(expression.to_string());
        }
        self.slots
            .get(&slot)
            .and_then(|entry| entry.last_result.clone())
    }

    /// Open a subscription for a live slot unless one is already outstanding.
    pub fn connect(&mut self, slot: TemplateSlot, expression: Option<&str>, context: &TemplateContext) {
        if !self.active {
            return;
        }
        let Some(expression) = expression.filter(|e| is_live_expression(e)) else {
            return;
        };

        let entry = self.slots.entry(slot).or_default();
        if matches!(
            entry.state,
            SlotState::Connecting | SlotState::Live | SlotState::Closing
        ) {
            return;
        }

        let key = SubscriptionKey {
            expression: expression.to_string(),
            entity_id: context.entity_id.clone(),
        };
        // Retry a failed expression only once it or its entity changes.
        if entry.failed.as_ref() == Some(&key) {
            return;
        }

        entry.generation += 1;
        entry.state = SlotState::Connecting;
        entry.in_flight = true;
        entry.key = Some(key);
        entry.failed = None;

        let generation = entry.generation;
        let request = TemplateRequest {
            template: expression.to_string(),
            entity_id: context.entity_id.clone(),
            variables: context.variables.clone(),
            strict: true,
        };
        let sink = TemplateSink::new(slot, generation, self.events.clone());
        let service = self.service.clone();
        let events = self.events.clone();

        tracing::debug!("Subscribing {} template (generation {})", slot, generation);
        tokio::spawn(async move {
            let event = match service.subscribe(request, sink).await {
                Ok(handle) => SlotEvent::Subscribed {
                    slot,
                    generation,
                    handle,
                },
                Err(error) => SlotEvent::SubscribeFailed {
                    slot,
                    generation,
                    error,
                },
            };
            let _ = events.send(event);
        });
    }

    /// Cancel the slot's subscription, if any.
    ///
    /// Cancellation errors meaning the subscription is already gone are
    /// swallowed; anything else is returned.
    pub async fn disconnect(&mut self, slot: TemplateSlot) -> Result<(), TemplateError> {
        let Some(entry) = self.slots.get_mut(&slot) else {
            return Ok(());
        };
        entry.failed = None;

        if let Some(handle) = entry.handle.take() {
            entry.state = SlotState::Closed;
            tracing::debug!("Closing {} template", slot);
            return release(handle).await;
        }
        if entry.in_flight {
            entry.state = SlotState::Closing;
        }
        Ok(())
    }

    /// Apply an event produced by a subscription task or a template push.
    pub async fn handle_event(&mut self, event: SlotEvent) -> Result<(), TemplateError> {
        match event {
            SlotEvent::Subscribed {
                slot,
                generation,
                handle,
            } => {
                let entry = self.slots.entry(slot).or_default();
                if entry.generation != generation {
                    tracing::debug!("Dropping stale {} subscription", slot);
                    return release(handle).await;
                }
                entry.in_flight = false;
                match entry.state {
                    SlotState::Connecting | SlotState::Live => {
                        entry.handle = Some(handle);
                        Ok(())
                    }
                    SlotState::Closing => {
                        entry.state = SlotState::Closed;
                        release(handle).await
                    }
                    SlotState::Idle | SlotState::Closed => release(handle).await,
                }
            }
            SlotEvent::SubscribeFailed {
                slot,
                generation,
                error,
            } => {
                let entry = self.slots.entry(slot).or_default();
                if entry.generation != generation {
                    return Ok(());
                }
                entry.in_flight = false;
                if entry.state == SlotState::Closing {
                    entry.state = SlotState::Closed;
                    return Ok(());
                }
                tracing::warn!("Template for {} failed, showing it as text: {}", slot, error);
                entry.last_result = entry.key.as_ref().map(|k| k.expression.clone());
                entry.failed = entry.key.clone();
                entry.state = SlotState::Idle;
                Ok(())
            }
            SlotEvent::Pushed {
                slot,
                generation,
                outcome,
            } => {
                let Some(entry) = self.slots.get_mut(&slot) else {
                    return Ok(());
                };
                if entry.generation != generation
                    || !matches!(entry.state, SlotState::Connecting | SlotState::Live)
                {
                    return Ok(());
                }
                match outcome {
                    Ok(result) => {
                        entry.state = SlotState::Live;
                        entry.last_result = Some(result);
                    }
                    Err(error) => {
                        tracing::warn!("Template for {} reported an error: {}", slot, error);
                        entry.last_result = entry.key.as_ref().map(|k| k.expression.clone());
                    }
                }
                Ok(())
            }
        }
    }
}

async fn release(handle: Box<dyn TemplateSubscription>) -> Result<(), TemplateError> {
    match handle.unsubscribe().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_closed() => {
            tracing::debug!("Template subscription already closed: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Clone)]
    enum Behavior {
        Succeed(String),
        Fail(TemplateError),
        WaitThenSucceed(Arc<Notify>, String),
    }

    struct FakeSubscription {
        open: Arc<AtomicUsize>,
        result: Result<(), TemplateError>,
    }

    #[async_trait]
    impl TemplateSubscription for FakeSubscription {
        async fn unsubscribe(self: Box<Self>) -> Result<(), TemplateError> {
            self.open.fetch_sub(1, Ordering::SeqCst);
            self.result
        }
    }

    struct FakeTemplates {
        behavior: Mutex<Behavior>,
        unsubscribe_result: Mutex<Result<(), TemplateError>>,
        subscribes: AtomicUsize,
        open: Arc<AtomicUsize>,
        requests: Mutex<Vec<TemplateRequest>>,
    }

    impl FakeTemplates {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Mutex::new(behavior),
                unsubscribe_result: Mutex::new(Ok(())),
                subscribes: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn subscribes(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }

        fn open(&self) -> usize {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TemplateService for FakeTemplates {
        async fn subscribe(
            &self,
            request: TemplateRequest,
            sink: TemplateSink,
        ) -> Result<Box<dyn TemplateSubscription>, TemplateError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            let behavior = self.behavior.lock().unwrap().clone();
            let result = match behavior {
                Behavior::Fail(e) => return Err(e),
                Behavior::Succeed(result) => result,
                Behavior::WaitThenSucceed(gate, result) => {
                    gate.notified().await;
                    result
                }
            };
            sink.push(Ok(result));
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSubscription {
                open: self.open.clone(),
                result: self.unsubscribe_result.lock().unwrap().clone(),
            }))
        }
    }

    fn manager(
        service: Arc<FakeTemplates>,
    ) -> (SubscriptionManager, mpsc::UnboundedReceiver<SlotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(service, tx);
        manager.attach();
        (manager, rx)
    }

    fn context(entity: &str) -> TemplateContext {
        TemplateContext {
            entity_id: Some(entity.to_string()),
            variables: json!({ "entity": entity, "user": "Ada" }),
        }
    }

    async fn pump(
        manager: &mut SubscriptionManager,
        rx: &mut mpsc::UnboundedReceiver<SlotEvent>,
        events: usize,
    ) -> Result<(), TemplateError> {
        for _ in 0..events {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for slot event")
                .expect("event channel closed");
            manager.handle_event(event).await?;
        }
        Ok(())
    }

    const EXPR: &str = "{{ entity }}";

    #[tokio::test]
    async fn test_successful_subscription_goes_live() {
        let service = FakeTemplates::new(Behavior::Succeed("sensor.temp".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Connecting);

        // Push, then the handle.
        pump(&mut manager, &mut rx, 2).await.unwrap();

        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Live);
        assert_eq!(
            manager.value(TemplateSlot::Primary, Some(EXPR)),
            Some("sensor.temp".to_string())
        );
        let requests = service.requests.lock().unwrap();
        assert!(requests[0].strict);
        assert_eq!(requests[0].entity_id.as_deref(), Some("sensor.temp"));
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_noop() {
        let gate = Arc::new(Notify::new());
        let service = FakeTemplates::new(Behavior::WaitThenSucceed(gate.clone(), "ok".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Icon, Some(EXPR), &context("sensor.temp"));
        manager.connect(TemplateSlot::Icon, Some(EXPR), &context("sensor.temp"));
        assert!(manager.is_outstanding(TemplateSlot::Icon));

        gate.notify_one();
        pump(&mut manager, &mut rx, 2).await.unwrap();
        manager.connect(TemplateSlot::Icon, Some(EXPR), &context("sensor.temp"));
        tokio::task::yield_now().await;

        assert_eq!(service.subscribes(), 1);
        assert_eq!(service.open(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_falls_back_to_raw_text() {
        let service = FakeTemplates::new(Behavior::Fail(TemplateError::Evaluation(
            "undefined".into(),
        )));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Secondary, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 1).await.unwrap();

        assert_eq!(manager.state(TemplateSlot::Secondary), SlotState::Idle);
        assert!(!manager.is_outstanding(TemplateSlot::Secondary));
        assert_eq!(
            manager.value(TemplateSlot::Secondary, Some(EXPR)),
            Some(EXPR.to_string())
        );

        // Unchanged conditions do not retry; a new entity does.
        manager.connect(TemplateSlot::Secondary, Some(EXPR), &context("sensor.temp"));
        assert_eq!(manager.state(TemplateSlot::Secondary), SlotState::Idle);
        manager.connect(TemplateSlot::Secondary, Some(EXPR), &context("sensor.other"));
        pump(&mut manager, &mut rx, 1).await.unwrap();
        assert_eq!(service.subscribes(), 2);
    }

    #[tokio::test]
    async fn test_static_slots_never_subscribe() {
        let service = FakeTemplates::new(Behavior::Succeed("unused".into()));
        let (mut manager, _rx) = manager(service.clone());

        manager.connect(TemplateSlot::Icon, Some("mdi:thermometer"), &context("sensor.temp"));
        manager.connect(TemplateSlot::Picture, None, &context("sensor.temp"));
        tokio::task::yield_now().await;

        assert_eq!(service.subscribes(), 0);
        assert_eq!(
            manager.value(TemplateSlot::Icon, Some("mdi:thermometer")),
            Some("mdi:thermometer".to_string())
        );
        assert_eq!(manager.value(TemplateSlot::Picture, None), None);
    }

    #[tokio::test]
    async fn test_connect_without_session_is_noop() {
        let service = FakeTemplates::new(Behavior::Succeed("unused".into()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut manager = SubscriptionManager::new(service.clone(), tx);

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        tokio::task::yield_now().await;

        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Idle);
        assert_eq!(service.subscribes(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_swallows_already_closed() {
        let service = FakeTemplates::new(Behavior::Succeed("x".into()));
        *service.unsubscribe_result.lock().unwrap() = Err(TemplateError::NotFound);
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 2).await.unwrap();

        assert_eq!(manager.disconnect(TemplateSlot::Primary).await, Ok(()));
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Closed);
        assert!(!manager.is_outstanding(TemplateSlot::Primary));

        // Nothing held any more.
        assert_eq!(manager.disconnect(TemplateSlot::Primary).await, Ok(()));
    }

    #[tokio::test]
    async fn test_disconnect_propagates_other_errors() {
        let service = FakeTemplates::new(Behavior::Succeed("x".into()));
        *service.unsubscribe_result.lock().unwrap() =
            Err(TemplateError::Connection("socket reset".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 2).await.unwrap();

        assert_eq!(
            manager.disconnect(TemplateSlot::Primary).await,
            Err(TemplateError::Connection("socket reset".into()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_cancels_on_arrival() {
        let gate = Arc::new(Notify::new());
        let service = FakeTemplates::new(Behavior::WaitThenSucceed(gate.clone(), "ok".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        manager.disconnect(TemplateSlot::Primary).await.unwrap();
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Closing);

        // The prior handle has not resolved yet, so reconnecting waits.
        manager.connect(TemplateSlot::Primary, Some("{{ user }}"), &context("sensor.temp"));
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Closing);

        gate.notify_one();
        pump(&mut manager, &mut rx, 2).await.unwrap();
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Closed);
        assert_eq!(service.open(), 0);
        // The push that raced the disconnect is ignored.
        assert_eq!(manager.value(TemplateSlot::Primary, Some(EXPR)), None);

        manager.connect(TemplateSlot::Primary, Some("{{ user }}"), &context("sensor.temp"));
        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Connecting);
    }

    #[tokio::test]
    async fn test_stale_pushes_are_ignored() {
        let service = FakeTemplates::new(Behavior::Succeed("first".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 2).await.unwrap();

        manager
            .handle_event(SlotEvent::Pushed {
                slot: TemplateSlot::Primary,
                generation: 0,
                outcome: Ok("stale".into()),
            })
            .await
            .unwrap();

        assert_eq!(
            manager.value(TemplateSlot::Primary, Some(EXPR)),
            Some("first".to_string())
        );
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let service = FakeTemplates::new(Behavior::Succeed("v".into()));
        let (mut manager, mut rx) = manager(service.clone());

        manager.connect(TemplateSlot::Primary, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 2).await.unwrap();
        manager.connect(TemplateSlot::IconColor, Some(EXPR), &context("sensor.temp"));
        pump(&mut manager, &mut rx, 2).await.unwrap();

        manager.disconnect(TemplateSlot::Primary).await.unwrap();

        assert_eq!(manager.state(TemplateSlot::Primary), SlotState::Closed);
        assert_eq!(manager.state(TemplateSlot::IconColor), SlotState::Live);
        assert_eq!(service.open(), 1);
    }

    #[tokio::test]
    async fn test_detach_closes_everything() {
        let service = FakeTemplates::new(Behavior::Succeed("v".into()));
        let (mut manager, mut rx) = manager(service.clone());

        for slot in [TemplateSlot::Primary, TemplateSlot::BadgeIcon] {
            manager.connect(slot, Some(EXPR), &context("sensor.temp"));
            pump(&mut manager, &mut rx, 2).await.unwrap();
        }

        manager.detach().await.unwrap();
        assert!(!manager.is_active());
        assert_eq!(service.open(), 0);
    }
}
