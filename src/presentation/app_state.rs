// Application state for HTTP handlers
use crate::application::graph_widget::GraphHandle;

#[derive(Clone)]
pub struct AppState {
    pub graph: GraphHandle,
}
