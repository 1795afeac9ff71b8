use std::sync::{Arc, Weak};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Response};
use shared::{
    domain::{DrawPhase, SessionId},
    error::{ApiError, ApiException, ErrorCode},
    frame::Frame,
    protocol::{DrawAction, DrawEventRecord, DrawSnapshot, ServerEvent},
    reducer::DrawState,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

mod auto_pick;
mod replica;

pub use auto_pick::{AutoPickTimer, PickSubmitter};
pub use replica::{DrawReplica, IngestOutcome};

#[derive(Debug, Error)]
pub enum DrawClientError {
    #[error("server rejected the request: {0}")]
    Api(#[from] ApiException),
    #[error("server_url must start with http:// or https://")]
    InvalidServerUrl,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub type ClientResult<T> = std::result::Result<T, DrawClientError>;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Server(ServerEvent),
    StateChanged {
        step: u32,
        phase: DrawPhase,
        outcome: IngestOutcome,
    },
    Resynced {
        events: usize,
    },
    Disconnected,
    Error(String),
}

struct DrawClientState {
    replica: DrawReplica,
    auto_pick: AutoPickTimer,
    auto_pick_enabled: bool,
    ws_task: Option<JoinHandle<()>>,
}

impl DrawClientState {
    fn sync_auto_pick(&mut self) {
        if self.auto_pick_enabled {
            self.auto_pick.sync(self.replica.state());
        } else {
            self.auto_pick.cancel();
        }
    }
}

/// Follows one draw session over HTTP and WebSocket and keeps a folded
/// replica of its log.
pub struct DrawClient {
    http: Client,
    server_url: String,
    session_id: SessionId,
    inner: Mutex<DrawClientState>,
    events: broadcast::Sender<ClientEvent>,
}

/// Posts `auto_pick` for the timer. The server drops it once the step has a
/// pick or was superseded.
struct HttpPickSubmitter {
    http: Client,
    server_url: String,
}

#[async_trait]
impl PickSubmitter for HttpPickSubmitter {
    async fn submit_pick(&self, session_id: SessionId, step: u32) -> anyhow::Result<()> {
        let action = DrawAction::AutoPick { step };
        match post_action(&self.http, &self.server_url, session_id, &action).await {
            Ok(_) => Ok(()),
            Err(DrawClientError::Api(err)) if err.code == ErrorCode::Conflict => {
                debug!(%session_id, step, message = %err.message, "auto-pick no longer needed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl DrawClient {
    /// Loads the session snapshot and starts following its event stream.
    pub async fn connect(
        server_url: impl Into<String>,
        session_id: SessionId,
    ) -> ClientResult<Arc<Self>> {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        let ws_url = ws_url_for(&server_url, session_id)?;
        let http = Client::new();

        let snapshot = fetch_snapshot(&http, &server_url, session_id).await?;
        let submitter = Arc::new(HttpPickSubmitter {
            http: http.clone(),
            server_url: server_url.clone(),
        });
        let (events, _) = broadcast::channel(1024);
        let client = Arc::new(Self {
            http,
            server_url,
            session_id,
            inner: Mutex::new(DrawClientState {
                replica: DrawReplica::from_snapshot(snapshot),
                auto_pick: AutoPickTimer::new(submitter),
                auto_pick_enabled: false,
                ws_task: None,
            }),
            events,
        });

        client.spawn_ws_events(&ws_url).await?;
        // Catch anything appended between the first fetch and the subscription.
        // On failure the client drops here, which stops the reader task.
        client.resync().await?;
        info!(%session_id, "draw client connected");
        Ok(client)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> DrawState {
        self.inner.lock().await.replica.state().clone()
    }

    pub async fn events(&self) -> Vec<DrawEventRecord> {
        self.inner.lock().await.replica.events().to_vec()
    }

    pub async fn frame_at(&self, now: DateTime<Utc>) -> Option<Frame> {
        self.inner.lock().await.replica.frame_at(now)
    }

    pub async fn set_auto_pick(&self, enabled: bool) {
        let mut guard = self.inner.lock().await;
        guard.auto_pick_enabled = enabled;
        guard.sync_auto_pick();
    }

    pub async fn auto_pick_armed_step(&self) -> Option<u32> {
        self.inner.lock().await.auto_pick.armed_step()
    }

    /// Submits an action and folds the appended record right away; the
    /// websocket copy that follows is dropped as a duplicate.
    pub async fn submit(&self, action: DrawAction) -> ClientResult<DrawEventRecord> {
        let record = post_action(&self.http, &self.server_url, self.session_id, &action).await?;
        self.ingest(record.clone()).await;
        Ok(record)
    }

    /// Re-fetches the snapshot and merges it into the replica.
    pub async fn resync(&self) -> ClientResult<()> {
        let snapshot = fetch_snapshot(&self.http, &self.server_url, self.session_id).await?;
        let mut guard = self.inner.lock().await;
        guard.replica.reset(snapshot);
        guard.sync_auto_pick();
        let events = guard.replica.events().len();
        drop(guard);
        let _ = self.events.send(ClientEvent::Resynced { events });
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.ws_task.take() {
            task.abort();
        }
        guard.auto_pick.cancel();
        guard.auto_pick_enabled = false;
        info!(session_id = %self.session_id, "draw client disconnected");
    }

    async fn ingest(&self, record: DrawEventRecord) -> IngestOutcome {
        let mut guard = self.inner.lock().await;
        let outcome = guard.replica.ingest(record);
        if outcome.changed() {
            guard.sync_auto_pick();
            let state = guard.replica.state();
            let _ = self.events.send(ClientEvent::StateChanged {
                step: state.current_step,
                phase: state.phase,
                outcome,
            });
        }
        outcome
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        let _ = self.events.send(ClientEvent::Server(event.clone()));
        match event {
            ServerEvent::DrawEventAppended { event } => {
                let outcome = self.ingest(event).await;
                debug!(session_id = %self.session_id, ?outcome, "ingested draw event");
            }
            ServerEvent::SessionUpdated { session } => {
                let mut guard = self.inner.lock().await;
                if guard.replica.update_session(session) {
                    guard.sync_auto_pick();
                    let state = guard.replica.state();
                    let _ = self.events.send(ClientEvent::StateChanged {
                        step: state.current_step,
                        phase: state.phase,
                        outcome: IngestOutcome::Refolded,
                    });
                }
            }
            ServerEvent::Error(err) => {
                warn!(session_id = %self.session_id, message = %err.message, "server reported an error");
                let _ = self.events.send(ClientEvent::Error(err.message));
                if let Err(err) = self.resync().await {
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                }
            }
        }
    }

    async fn spawn_ws_events(self: &Arc<Self>, ws_url: &str) -> ClientResult<()> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => {
                            let _ = client
                                .events
                                .send(ClientEvent::Error(format!("invalid server event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = client.events.send(ClientEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
            if let Some(client) = weak.upgrade() {
                let _ = client.events.send(ClientEvent::Disconnected);
            }
        });

        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.ws_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for DrawClient {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(task) = inner.ws_task.take() {
            task.abort();
        }
        inner.auto_pick.cancel();
    }
}

fn ws_url_for(server_url: &str, session_id: SessionId) -> ClientResult<String> {
    let mut url = Url::parse(server_url).map_err(|_| DrawClientError::InvalidServerUrl)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(DrawClientError::InvalidServerUrl),
    };
    url.set_scheme(scheme)
        .map_err(|_| DrawClientError::InvalidServerUrl)?;
    url.set_path("/ws");
    url.set_query(Some(&format!("session_id={session_id}")));
    Ok(url.to_string())
}

async fn fetch_snapshot(
    http: &Client,
    server_url: &str,
    session_id: SessionId,
) -> ClientResult<DrawSnapshot> {
    let response = http
        .get(format!("{server_url}/sessions/{session_id}"))
        .send()
        .await
        .context("failed to fetch session snapshot")?;
    decode(response).await
}

async fn post_action(
    http: &Client,
    server_url: &str,
    session_id: SessionId,
    action: &DrawAction,
) -> ClientResult<DrawEventRecord> {
    let response = http
        .post(format!("{server_url}/sessions/{session_id}/actions"))
        .json(action)
        .send()
        .await
        .context("failed to submit draw action")?;
    decode(response).await
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> ClientResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await.context("failed to read error body")?;
        return Err(match serde_json::from_slice::<ApiError>(&body) {
            Ok(err) => DrawClientError::Api(err.into()),
            Err(_) => DrawClientError::Transport(anyhow!(
                "server returned {status}: {}",
                String::from_utf8_lossy(&body)
            )),
        });
    }
    Ok(response
        .json::<T>()
        .await
        .context("failed to decode server response")?)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
