// Graph widget - Single-writer event loop feeding one graph tile
use crate::application::history_provider::HistoryProvider;
use crate::application::subscription_manager::{SubscriptionManager, TemplateContext};
use crate::application::template_service::{SlotEvent, TemplateService};
use crate::domain::coordinates;
use crate::domain::error::{FetchError, WidgetClosed};
use crate::domain::history::{self, HistoryWindow};
use crate::domain::resample;
use crate::domain::telemetry::{ProjectedPoint, Sample};
use crate::domain::template::TemplateSlot;
use crate::infrastructure::config::{GraphCardConfig, GraphMode};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Canvas width the polyline is projected into
pub const GRAPH_WIDTH: f64 = 500.0;

/// Minimum time between two resampling passes driven by ticks
pub const RESAMPLE_INTERVAL_SECS: i64 = 60;

/// Everything the renderer needs, published after every state change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphView {
    pub entity: Option<String>,
    pub points: Vec<ProjectedPoint>,
    pub graph_height: f64,
    pub graph_mode: GraphMode,
    pub graph_color: Option<String>,
    pub slots: BTreeMap<TemplateSlot, String>,
    pub retained_samples: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

pub enum WidgetEvent {
    Tick {
        now: DateTime<Utc>,
    },
    Configure {
        config: GraphCardConfig,
        now: DateTime<Utc>,
    },
    Attach,
    Detach,
    HistoryFetched {
        entity_id: String,
        epoch: u64,
        end: DateTime<Utc>,
        result: Result<Vec<Sample>, FetchError>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable access to a running widget
#[derive(Clone)]
pub struct GraphHandle {
    events: mpsc::Sender<WidgetEvent>,
    view: watch::Receiver<GraphView>,
}

impl GraphHandle {
    pub fn view(&self) -> GraphView {
        self.view.borrow().clone()
    }

    /// Receiver that observes every published view
    pub fn subscribe(&self) -> watch::Receiver<GraphView> {
        self.view.clone()
    }

    pub fn polyline(&self) -> Vec<ProjectedPoint> {
        self.view.borrow().points.clone()
    }

    pub fn slot_value(&self, slot: TemplateSlot) -> Option<String> {
        self.view.borrow().slots.get(&slot).cloned()
    }

    pub async fn tick(&self) -> Result<(), WidgetClosed> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<(), WidgetClosed> {
        self.send(WidgetEvent::Tick { now }).await
    }

    pub async fn configure(&self, config: GraphCardConfig) -> Result<(), WidgetClosed> {
        self.configure_at(config, Utc::now()).await
    }

    pub async fn configure_at(
        &self,
        config: GraphCardConfig,
        now: DateTime<Utc>,
    ) -> Result<(), WidgetClosed> {
        self.send(WidgetEvent::Configure { config, now }).await
    }

    pub async fn attach(&self) -> Result<(), WidgetClosed> {
        self.send(WidgetEvent::Attach).await
    }

    pub async fn detach(&self) -> Result<(), WidgetClosed> {
        self.send(WidgetEvent::Detach).await
    }

    /// Detach every template and stop the event loop
    pub async fn shutdown(&self) -> Result<(), WidgetClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(WidgetEvent::Shutdown(tx)).await?;
        rx.await.map_err(|_| WidgetClosed)
    }

    async fn send(&self, event: WidgetEvent) -> Result<(), WidgetClosed> {
        self.events.send(event).await.map_err(|_| WidgetClosed)
    }
}

pub struct GraphWidget {
    provider: Arc<dyn HistoryProvider>,
    subscriptions: SubscriptionManager,
    user: String,
    config: Option<GraphCardConfig>,
    window: Option<HistoryWindow>,
    // Bumped on every window reset so fetches issued before it are discarded.
    epoch: u64,
    points: Vec<ProjectedPoint>,
    last_fetch: Option<DateTime<Utc>>,
    fetching: bool,
    refetch_at: Option<DateTime<Utc>>,
    // Weak so the loop ends once every handle is gone.
    events: mpsc::WeakSender<WidgetEvent>,
    view: watch::Sender<GraphView>,
}

impl GraphWidget {
    /// Start the widget's event loop on the current runtime
    pub fn spawn(
        provider: Arc<dyn HistoryProvider>,
        templates: Arc<dyn TemplateService>,
        user: impl Into<String>,
    ) -> (GraphHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(GraphView::default());

        let widget = GraphWidget {
            provider,
            subscriptions: SubscriptionManager::new(templates, slot_tx),
            user: user.into(),
            config: None,
            window: None,
            epoch: 0,
            points: Vec::new(),
            last_fetch: None,
            fetching: false,
            refetch_at: None,
            events: events_tx.downgrade(),
            view: view_tx,
        };

        let task = tokio::spawn(widget.run(events_rx, slot_rx));
        let handle = GraphHandle {
            events: events_tx,
            view: view_rx,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<WidgetEvent>,
        mut slot_events: mpsc::UnboundedReceiver<SlotEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WidgetEvent::Shutdown(done)) => {
                        self.detach().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::debug!("All graph handles dropped");
                        self.detach().await;
                        break;
                    }
                },
                Some(event) = slot_events.recv() => {
                    if let Err(e) = self.subscriptions.handle_event(event).await {
                        tracing::error!("Failed to release template subscription: {}", e);
                    }
                    self.connect_templates();
                }
            }
            self.publish();
        }
        tracing::info!("Graph widget stopped");
    }

    async fn handle_event(&mut self, event: WidgetEvent) {
        match event {
            WidgetEvent::Tick { now } => {
                let due = self
                    .last_fetch
                    .is_none_or(|last| now - last >= Duration::seconds(RESAMPLE_INTERVAL_SECS));
                if due && !self.fetching {
                    self.start_fetch(now);
                }
                self.connect_templates();
            }
            WidgetEvent::Configure { config, now } => self.configure(config, now).await,
            WidgetEvent::Attach => {
                self.subscriptions.attach();
                self.connect_templates();
            }
            WidgetEvent::Detach => self.detach().await,
            WidgetEvent::HistoryFetched {
                entity_id,
                epoch,
                end,
                result,
            } => self.apply_history(entity_id, epoch, end, result),
            WidgetEvent::Shutdown(_) => {}
        }
    }

    async fn configure(&mut self, config: GraphCardConfig, now: DateTime<Utc>) {
        if let Err(e) = config.validate() {
            tracing::warn!("Ignoring graph configuration: {}", e);
            return;
        }
        let previous = self.config.take();

        for slot in TemplateSlot::ALL {
            let changed = previous.as_ref().is_none_or(|old| {
                old.expression(slot) != config.expression(slot) || old.entity != config.entity
            });
            if changed {
                if let Err(e) = self.subscriptions.disconnect(slot).await {
                    tracing::error!("Failed to close {} template: {}", slot, e);
                }
            }
        }

        match config.entity.as_deref() {
            Some(entity) => {
                let changed = if let Some(window) = self.window.as_mut() {
                    window.retarget(entity)
                } else {
                    self.window = Some(HistoryWindow::new(entity, config.hours_to_show));
                    true
                };
                if changed {
                    tracing::info!("Graph entity set to {}", entity);
                    self.reset_history();
                }
            }
            None => {
                self.window = None;
                self.reset_history();
            }
        }

        // A longer look-back needs the full range again; merging dedupes the overlap.
        if previous
            .as_ref()
            .is_some_and(|old| config.hours_to_show > old.hours_to_show)
        {
            self.last_fetch = None;
        }

        self.config = Some(config);
        self.connect_templates();

        if self.fetching {
            self.refetch_at = Some(now);
        } else {
            self.start_fetch(now);
        }
    }

    async fn detach(&mut self) {
        if let Err(e) = self.subscriptions.detach().await {
            tracing::error!("Failed to detach templates: {}", e);
        }
    }

    fn reset_history(&mut self) {
        self.epoch += 1;
        self.last_fetch = None;
        self.points.clear();
        if let Some(window) = self.window.as_mut() {
            window.reset();
        }
    }

    fn connect_templates(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        let context = TemplateContext {
            entity_id: config.entity.clone(),
            variables: serde_json::json!({
                "config": config,
                "user": self.user,
                "entity": config.entity,
            }),
        };
        for slot in TemplateSlot::ALL {
            self.subscriptions
                .connect(slot, config.expression(slot), &context);
        }
    }

    /// Issue one history fetch for the current entity; never more than one at a time.
    fn start_fetch(&mut self, now: DateTime<Utc>) {
        let (Some(config), Some(window)) = (self.config.as_ref(), self.window.as_mut()) else {
            return;
        };
        if self.fetching {
            return;
        }

        let hours = config.hours_to_show;
        window.refresh(Vec::new(), hours, now);

        let incremental = !window.is_empty() && self.last_fetch.is_some();
        let start = match self.last_fetch {
            Some(last) if incremental => last,
            _ => history::window_start(now, hours),
        };

        let Some(events) = self.events.upgrade() else {
            return;
        };
        let entity_id = window.entity_id().to_string();
        let epoch = self.epoch;
        let provider = self.provider.clone();
        self.fetching = true;

        tracing::debug!(
            "Fetching history for {} from {} (incremental: {})",
            entity_id,
            start,
            incremental
        );
        tokio::spawn(async move {
            let result = provider
                .fetch_history(&entity_id, start, now, incremental)
                .await;
            let _ = events
                .send(WidgetEvent::HistoryFetched {
                    entity_id,
                    epoch,
                    end: now,
                    result,
                })
                .await;
        });
    }

    fn apply_history(
        &mut self,
        entity_id: String,
        epoch: u64,
        end: DateTime<Utc>,
        result: Result<Vec<Sample>, FetchError>,
    ) {
        self.fetching = false;

        let current = self.window.as_ref().map(HistoryWindow::entity_id);
        if current != Some(entity_id.as_str()) || epoch != self.epoch {
            tracing::debug!("Discarding stale history for {}", entity_id);
        } else {
            match result {
                Ok(batch) => {
                    if let (Some(window), Some(config)) = (self.window.as_mut(), self.config.as_ref()) {
                        window.refresh(batch, config.hours_to_show, end);
                    }
                    self.last_fetch = Some(end);
                    self.resample(end);
                }
                Err(e) => {
                    tracing::warn!("Failed to fetch history for {}: {}", entity_id, e);
                }
            }
        }

        if let Some(requested) = self.refetch_at.take() {
            self.start_fetch(requested.max(end));
        }
    }

    fn resample(&mut self, now: DateTime<Utc>) {
        let (Some(window), Some(config)) = (self.window.as_ref(), self.config.as_ref()) else {
            return;
        };
        let buckets = resample::bucket(
            window.samples(),
            config.hours_to_show,
            config.points_per_hour,
            now,
        );
        self.points = coordinates::project(
            &buckets,
            config.hours_to_show,
            GRAPH_WIDTH,
            config.display_mode.plot_height(),
            config.points_per_hour,
        );
    }

    fn publish(&self) {
        let view = self.build_view();
        self.view.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn build_view(&self) -> GraphView {
        let Some(config) = self.config.as_ref() else {
            return GraphView::default();
        };

        let slots: BTreeMap<TemplateSlot, String> = TemplateSlot::ALL
            .into_iter()
            .filter_map(|slot| {
                self.subscriptions
                    .value(slot, config.expression(slot))
                    .map(|value| (slot, value))
            })
            .collect();
        let graph_color = config
            .graph_color
            .clone()
            .or_else(|| slots.get(&TemplateSlot::IconColor).cloned());

        GraphView {
            entity: config.entity.clone(),
            points: self.points.clone(),
            graph_height: config.display_mode.graph_height(),
            graph_mode: config.graph_mode,
            graph_color,
            slots,
            retained_samples: self.window.as_ref().map_or(0, HistoryWindow::len),
            updated_at: self.last_fetch,
        }
    }
}
