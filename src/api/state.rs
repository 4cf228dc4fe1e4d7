use crate::app::App;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub app: App,
}

impl AppState {
    pub fn new(app: App) -> Self {
        Self { app }
    }
}
