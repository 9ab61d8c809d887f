//! Gemini Live API transport
//!
//! Implements [`Connector`] over the BidiGenerateContent WebSocket: sends the
//! setup message, waits for `setupComplete`, then runs a writer task that
//! serializes [`Outbound`] messages and a reader task that turns server frames
//! into [`ServerEvent`]s.

use crate::channel::{ChannelHandle, ChannelPair, ConnectError, Connector, Outbound};
use crate::codec::EncodedChunk;
use crate::config::SessionConfig;
use crate::events::{ServerEvent, ToolCallRequest};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection settings for the Live API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub url: String,
    pub model: String,
    /// How long to wait for `setupComplete` after sending the setup message.
    pub setup_timeout: Duration,
}

impl GeminiConfig {
    pub fn from_api_key(api_key: &str, model: &str) -> Self {
        Self {
            url: format!("{}?key={}", LIVE_ENDPOINT, api_key),
            model: model.to_string(),
            setup_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool<'a> {
    function_declarations: &'a [Value],
}

/// Session setup message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BidiGenerateContentSetup<'a> {
    model: &'a str,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<Value>,
}

#[derive(Debug, Serialize)]
struct SetupMessage<'a> {
    setup: BidiGenerateContentSetup<'a>,
}

/// Build the setup message for a session.
pub fn encode_setup(model: &str, session: &SessionConfig) -> Result<String, serde_json::Error> {
    let system_instruction = (!session.system_instruction.is_empty())
        .then(|| json!({ "parts": [{ "text": session.system_instruction }] }));
    let tools = if session.tools.is_empty() {
        Vec::new()
    } else {
        vec![Tool {
            function_declarations: &session.tools,
        }]
    };

    let message = SetupMessage {
        setup: BidiGenerateContentSetup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![session.response_modality.as_str()],
                speech_config: json!({
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": session.voice } }
                }),
            },
            system_instruction,
            tools,
            output_audio_transcription: session.transcription_enabled.then(|| json!({})),
        },
    };
    serde_json::to_string(&message)
}

/// Serialize an outbound message. `Close` has no JSON form.
pub fn encode_outbound(msg: &Outbound) -> Result<Option<String>, serde_json::Error> {
    let value = match msg {
        Outbound::Audio(chunk) => json!({ "realtimeInput": { "audio": chunk } }),
        Outbound::ToolResult { id, name, result } => json!({
            "toolResponse": {
                "functionResponses": [{
                    "id": id,
                    "name": name,
                    "response": result.to_response()
                }]
            }
        }),
        Outbound::Close => return Ok(None),
    };
    serde_json::to_string(&value).map(Some)
}

/// Decode one server frame into events, in wire order.
pub fn decode_server_message(text: &str) -> Vec<ServerEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return vec![ServerEvent::Error {
                detail: format!("malformed server message: {}", e),
            }]
        }
    };
    let Some(message) = value.as_object() else {
        return vec![ServerEvent::Error {
            detail: "server message is not a JSON object".to_string(),
        }];
    };

    let mut events = Vec::new();
    if let Some(content) = message.get("serverContent") {
        decode_server_content(content, &mut events);
    }
    if let Some(tool_call) = message.get("toolCall") {
        decode_tool_call(tool_call, &mut events);
    }
    if let Some(go_away) = message.get("goAway") {
        info!("Server will disconnect soon: {}", go_away);
    }
    if let Some(cancellation) = message.get("toolCallCancellation") {
        debug!("Tool call cancellation ignored: {}", cancellation);
    }
    if message.contains_key("setupComplete") {
        debug!("Duplicate setupComplete ignored");
    }
    events
}

fn decode_server_content(content: &Value, events: &mut Vec<ServerEvent>) {
    if let Some(text) = content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
    {
        if !text.is_empty() {
            events.push(ServerEvent::TranscriptDelta {
                text: text.to_string(),
            });
        }
    }

    if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
        events.push(ServerEvent::Interrupted);
    }

    let parts = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(Value::as_array);
    for part in parts.into_iter().flatten() {
        let Some(inline) = part.get("inlineData") else {
            continue;
        };
        match inline.get("data").and_then(Value::as_str) {
            Some(data) => events.push(ServerEvent::AudioChunk {
                chunk: EncodedChunk {
                    data: data.to_string(),
                    mime_type: inline
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
            }),
            None => warn!("Inline data without payload: {}", inline),
        }
    }

    if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
        events.push(ServerEvent::TurnComplete);
    }
}

fn decode_tool_call(tool_call: &Value, events: &mut Vec<ServerEvent>) {
    let calls = tool_call.get("functionCalls").and_then(Value::as_array);
    for call in calls.into_iter().flatten() {
        let Some(id) = call.get("id").and_then(Value::as_str) else {
            warn!("Function call without id cannot be acknowledged: {}", call);
            continue;
        };
        events.push(ServerEvent::ToolCall(ToolCallRequest {
            id: id.to_string(),
            name: call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            args: call.get("args").cloned().unwrap_or(Value::Null),
        }));
    }
}

/// Text carried by a data frame; Live sometimes sends JSON as binary frames.
fn frame_text(message: &Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text.as_str().to_string()),
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                None
            }
        },
        _ => None,
    }
}

async fn wait_for_setup_complete(stream: &mut WsSource) -> Result<(), ConnectError> {
    while let Some(message) = stream.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.as_str().to_string())
                .filter(|r| !r.is_empty());
            return Err(match reason {
                Some(reason) => ConnectError::Rejected(reason),
                None => ConnectError::Closed,
            });
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        let value: Value = serde_json::from_str(&text)?;
        if value.get("setupComplete").is_some() {
            return Ok(());
        }
        debug!("Message before setupComplete ignored: {}", text);
    }
    Err(ConnectError::Closed)
}

async fn write_loop(mut sink: WsSink, mut outbound: UnboundedReceiver<Outbound>) {
    while let Some(msg) = outbound.recv().await {
        let json = match encode_outbound(&msg) {
            Ok(Some(json)) => json,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::text(json)).await {
            error!("Failed to send to Gemini: {}", e);
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("WebSocket close: {}", e);
    }
    info!("Gemini writer stopped");
}

async fn read_loop(mut stream: WsSource, events: UnboundedSender<ServerEvent>) {
    let last = loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                break ServerEvent::Error {
                    detail: format!("WebSocket error: {}", e),
                }
            }
            None => break ServerEvent::Closed,
        };
        if let Message::Close(frame) = &message {
            info!("Gemini closed the connection: {:?}", frame);
            break ServerEvent::Closed;
        }
        let Some(text) = frame_text(&message) else {
            continue;
        };
        for event in decode_server_message(&text) {
            debug!("<<< {}", event.kind());
            if events.send(event).is_err() {
                return;
            }
        }
    };
    let _ = events.send(last);
    info!("Gemini reader stopped");
}

/// Opens Live API sessions.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, session: &SessionConfig) -> Result<ChannelPair, ConnectError> {
        info!("Connecting to Gemini Live with model {}", self.config.model);
        let (ws, response) = connect_async(self.config.url.as_str()).await?;
        debug!("WebSocket handshake status: {}", response.status());
        let (mut sink, mut stream) = ws.split();

        let setup = encode_setup(&self.config.model, session)?;
        sink.send(Message::text(setup)).await?;

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| ConnectError::Timeout(self.config.setup_timeout))??;
        info!("Gemini session ready (voice {})", session.voice);

        let (handle, outbound) = ChannelHandle::pair();
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, outbound));
        tokio::spawn(read_loop(stream, events_tx));

        Ok(ChannelPair { handle, events })
    }
}

impl Connector for GeminiConnector {
    fn open(
        &self,
        config: &SessionConfig,
    ) -> impl std::future::Future<Output = Result<ChannelPair, ConnectError>> + Send {
        let session = config.clone();
        async move { self.connect(&session).await }
    }
}
