// Request dispatch: commandId registry, per-command validation, reason
// policing and response construction.

use crate::domain::errors::{CommandError, reason};
use crate::interface_adapters::protocol::{
    self, Envelope, MessageType, commands,
};
use crate::use_cases::adapter::AutohostService;
use crate::use_cases::buffer::UpdateSink;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const COMMON_REASONS: &[&str] = &[reason::INVALID_REQUEST, reason::INTERNAL_ERROR];
const START_REASONS: &[&str] = &[
    reason::BATTLE_ALREADY_EXISTS,
    reason::INVALID_REQUEST,
    reason::INTERNAL_ERROR,
];

/// Per-connection request dispatcher. Owns the outbound frame channel so
/// `subscribeUpdates` can attach the buffer to this connection.
pub struct Dispatcher {
    service: Arc<AutohostService>,
    outbound: mpsc::Sender<String>,
}

impl Dispatcher {
    pub fn new(service: Arc<AutohostService>, outbound: mpsc::Sender<String>) -> Self {
        Self { service, outbound }
    }

    /// Handle one parsed envelope. Returns a response frame for requests;
    /// inbound responses and events are tolerated and ignored.
    pub async fn handle(&self, envelope: Envelope) -> Option<String> {
        match envelope.kind {
            MessageType::Request => {
                let response = self.handle_request(envelope).await;
                Some(response.to_string())
            }
            MessageType::Response | MessageType::Event => {
                // The controller never sends requests, so nothing inbound of
                // these kinds is expected.
                debug!(command_id = %envelope.command_id, kind = ?envelope.kind, "ignoring frame");
                None
            }
        }
    }

    async fn handle_request(&self, envelope: Envelope) -> Value {
        debug!(command_id = %envelope.command_id, message_id = %envelope.message_id, "request");
        match envelope.command_id.as_str() {
            commands::START => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.start(request).await.map(|response| {
                        Some(serde_json::to_value(response).unwrap_or(Value::Null))
                    }),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, START_REASONS)
            }
            commands::KILL => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.kill(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::ADD_PLAYER => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.add_player(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::KICK_PLAYER => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.kick_player(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::MUTE_PLAYER => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.mute_player(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::SPEC_PLAYERS => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.spec_players(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::SEND_COMMAND => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.send_command(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::SEND_MESSAGE => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.send_message(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::SUBSCRIBE_UPDATES => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self
                        .service
                        .subscribe_updates(request, self.update_sink())
                        .await
                        .map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            commands::INSTALL_ENGINE => {
                let result = match parse_data(&envelope) {
                    Ok(request) => self.service.install_engine(request).await.map(|()| None),
                    Err(e) => Err(e),
                };
                respond(&envelope, result, COMMON_REASONS)
            }
            other => {
                warn!(command_id = %other, "unimplemented command");
                protocol::failed_response(&envelope, reason::COMMAND_UNIMPLEMENTED, None)
            }
        }
    }

    /// Sink that forwards buffered updates as event frames on this
    /// connection, preserving the buffer's backpressure.
    fn update_sink(&self) -> UpdateSink {
        let outbound = self.outbound.clone();
        Box::new(move |event| {
            let outbound = outbound.clone();
            Box::pin(async move {
                let frame = protocol::event_frame(
                    commands::UPDATE_EVENT,
                    protocol::update_event_data(&event),
                );
                if outbound.send(frame.to_string()).await.is_err() {
                    // The connection died; the supervisor unsubscribes on
                    // disconnect, this delivery just raced it.
                    warn!("dropping update for closed lobby connection");
                }
            })
        })
    }
}

fn parse_data<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, CommandError> {
    serde_json::from_value(envelope.data.clone().unwrap_or(Value::Null))
        .map_err(|e| CommandError::invalid_request(format!("invalid request data: {e}")))
}

fn respond(envelope: &Envelope, result: Result<Option<Value>, CommandError>, allowed: &[&str]) -> Value {
    match result {
        Ok(data) => protocol::success_response(envelope, data),
        Err(error) => {
            let error = if allowed.contains(&error.reason) {
                error
            } else {
                // A reason outside the command's contract must not leak.
                warn!(
                    command_id = %envelope.command_id,
                    reason = error.reason,
                    details = ?error.details,
                    "folding out-of-contract failure to internal_error"
                );
                CommandError::new(reason::INTERNAL_ERROR)
            };
            protocol::failed_response(envelope, error.reason, error.details.as_deref())
        }
    }
}
