use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use runtime::JobEvent;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::state::AppState;

/// `?runId=` narrows the stream to one run; lifecycle events of other runs are dropped.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    run_id: Option<String>,
}

impl EventFilter {
    fn admits(&self, event: &JobEvent) -> bool {
        match (&self.run_id, event.run_id()) {
            (Some(wanted), Some(run_id)) => wanted == run_id,
            _ => true,
        }
    }
}

pub async fn events_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state, filter))
}

async fn stream_events(mut socket: WebSocket, state: AppState, filter: EventFilter) {
    // Subscribe before greeting so nothing emitted in between is lost.
    let mut events = state.subscribe_events();
    if send_event(&mut socket, &state.connected_event()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };
                if filter.admits(&event) && send_event(&mut socket, &event).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &JobEvent) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    socket.send(Message::Text(payload)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use runtime::JobEvent;

    use super::EventFilter;

    #[test]
    fn filter_keeps_greetings_and_the_selected_run() {
        let filter = EventFilter {
            run_id: Some("a".to_string()),
        };

        assert!(filter.admits(&JobEvent::connected(1)));
        assert!(filter.admits(&JobEvent::Removed { run_id: "a".to_string() }));
        assert!(!filter.admits(&JobEvent::Removed { run_id: "b".to_string() }));
        assert!(EventFilter::default().admits(&JobEvent::Removed { run_id: "b".to_string() }));
    }
}
