use server_api::ApiContext;
use shared::protocol::ServerEvent;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) events: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, broadcast_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(broadcast_capacity.max(1));
        Self { api, events }
    }

    /// Fans an event out to every open socket. Having no listeners is fine.
    pub(crate) fn publish(&self, event: ServerEvent) {
        if let Err(error) = self.events.send(event) {
            debug!(session_id = ?error.0.session_id(), "no websocket listeners for event");
        }
    }
}
