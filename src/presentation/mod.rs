// Presentation layer - HTTP surface for the renderer
pub mod app_state;
pub mod handlers;
