//! Demo protocol engine streaming log notifications from a tool call.

use std::time::Duration;

use async_trait::async_trait;
use mcp_stream_core::{
    EngineError, JsonRpcMessage, ProtocolEngine, RequestId, SessionMessage, SessionStreams,
    message::{INVALID_PARAMS, JsonRpcRequest, METHOD_NOT_FOUND},
};
use serde::Deserialize;
use serde_json::{Number, Value, json};
use tokio::{sync::mpsc, task::JoinSet};

pub const SERVER_NAME: &str = "mcp-streamable-http-demo";
pub const TOOL_NAME: &str = "start-notification-stream";
const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";
const RESOURCE_URI: &str = "http:///test_resource";

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: StreamArgs,
}

#[derive(Debug, Deserialize)]
struct StreamArgs {
    #[serde(default = "default_interval")]
    interval: Number,
    #[serde(default = "default_count")]
    count: u64,
    #[serde(default = "default_caller")]
    caller: String,
}

impl Default for StreamArgs {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            count: default_count(),
            caller: default_caller(),
        }
    }
}

fn default_interval() -> Number {
    Number::from_f64(1.0).unwrap_or_else(|| Number::from(1))
}

const fn default_count() -> u64 {
    5
}

fn default_caller() -> String {
    "unknown".to_string()
}

impl StreamArgs {
    fn pause(&self) -> Duration {
        self.interval
            .as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_default()
    }
}

/// Engine serving `initialize`, `ping`, `tools/list` and `tools/call`.
///
/// Each tool call runs as its own task so a long notification stream does
/// not hold up other requests on the session. Dropping `run` aborts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationEngine;

#[async_trait]
impl ProtocolEngine for NotificationEngine {
    async fn run(&self, mut streams: SessionStreams) -> Result<(), EngineError> {
        let mut calls = JoinSet::new();
        loop {
            tokio::select! {
                incoming = streams.inbound.recv() => {
                    let Some(incoming) = incoming else { break };
                    match incoming.message {
                        JsonRpcMessage::Request(req) => {
                            handle_request(req, &streams.outbound, &mut calls).await?;
                        }
                        JsonRpcMessage::Notification(note) => {
                            tracing::debug!(method = %note.method, "Client notification");
                        }
                        JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {}
                    }
                }
                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    match joined {
                        Ok(Err(e)) => tracing::warn!(error = %e, "Tool call ended early"),
                        Err(e) if e.is_panic() => tracing::error!("Tool call panicked"),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_request(
    req: JsonRpcRequest,
    outbound: &mpsc::Sender<SessionMessage>,
    calls: &mut JoinSet<Result<(), EngineError>>,
) -> Result<(), EngineError> {
    let reply = match req.method.as_str() {
        "initialize" => {
            let version = req
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_PROTOCOL_VERSION);
            JsonRpcMessage::response(
                req.id,
                json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {}, "logging": {}, "resources": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
                }),
            )
        }
        "ping" => JsonRpcMessage::response(req.id, json!({})),
        "tools/list" => JsonRpcMessage::response(req.id, json!({ "tools": [tool_definition()] })),
        "tools/call" => {
            let params = req.params.unwrap_or(Value::Null);
            match serde_json::from_value::<CallParams>(params) {
                Ok(call) if call.name == TOOL_NAME => {
                    let outbound = outbound.clone();
                    calls.spawn(stream_notifications(req.id, call.arguments, outbound));
                    return Ok(());
                }
                Ok(call) => JsonRpcMessage::error(
                    Some(req.id),
                    INVALID_PARAMS,
                    format!("Unknown tool: {}", call.name),
                ),
                Err(e) => JsonRpcMessage::error(Some(req.id), INVALID_PARAMS, e.to_string()),
            }
        }
        other => JsonRpcMessage::error(
            Some(req.id),
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };

    outbound
        .send(SessionMessage::new(reply))
        .await
        .map_err(|_| EngineError::ChannelClosed)
}

fn tool_definition() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Sends a stream of notifications with configurable count and interval",
        "inputSchema": {
            "type": "object",
            "required": ["interval", "count", "caller"],
            "properties": {
                "interval": {
                    "type": "number",
                    "description": "Interval between notifications in seconds",
                },
                "count": {
                    "type": "number",
                    "description": "Number of notifications to send",
                },
                "caller": {
                    "type": "string",
                    "description": "Identifier of the caller to include in notifications",
                },
            },
        },
    })
}

async fn stream_notifications(
    request_id: RequestId,
    args: StreamArgs,
    outbound: mpsc::Sender<SessionMessage>,
) -> Result<(), EngineError> {
    let send = |message: SessionMessage| {
        let outbound = outbound.clone();
        async move {
            outbound
                .send(message)
                .await
                .map_err(|_| EngineError::ChannelClosed)
        }
    };

    for i in 1..=args.count {
        let data = format!(
            "[{i}/{}] Event from '{}' - Use Last-Event-ID to resume if disconnected",
            args.count, args.caller
        );
        send(SessionMessage::related_to(
            JsonRpcMessage::notification(
                "notifications/message",
                Some(json!({ "level": "info", "logger": "notification_stream", "data": data })),
            ),
            request_id.clone(),
        ))
        .await?;
        tracing::debug!(caller = %args.caller, sent = i, total = args.count, "Sent notification");

        if i < args.count {
            tokio::time::sleep(args.pause()).await;
        }
    }

    // Not tied to the request, so it goes to the standalone stream.
    send(SessionMessage::new(JsonRpcMessage::notification(
        "notifications/resources/updated",
        Some(json!({ "uri": RESOURCE_URI })),
    )))
    .await?;

    let text = format!(
        "Sent {} notifications with {}s interval for caller: {}",
        args.count, args.interval, args.caller
    );
    send(SessionMessage::new(JsonRpcMessage::response(
        request_id,
        json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
    )))
    .await
}
