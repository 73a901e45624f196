// Application layer - Collaborator ports and the widget event loop
pub mod graph_widget;
pub mod history_provider;
pub mod subscription_manager;
pub mod template_service;
