use std::sync::Arc;

use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Bearer token for `/api/admin`; `None` leaves the admin routes open.
    pub admin_api_token: Option<String>,
}
