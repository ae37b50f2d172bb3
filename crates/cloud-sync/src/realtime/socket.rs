//! Websocket change feed speaking the Phoenix channel protocol.
//!
//! One socket per channel. Frames are JSON objects
//! `{topic, event, payload, ref}`; the join carries a `postgres_changes`
//! config filtered to one table and one column equality.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::{ChangeFeed, ChangeKind, ChannelSignal, ChannelSpec, FeedChannel, RowChange};
use crate::config::SyncConfig;
use crate::error::{CloudSyncError, Result};

const PROTOCOL_VERSION: &str = "1.0.0";
const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

impl PhoenixMessage {
    fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Change feed over the backend's realtime websocket.
#[derive(Debug, Clone)]
pub struct RealtimeSocketFeed {
    socket_url: String,
    access_token: Option<String>,
    heartbeat_interval: Duration,
    next_ref: Arc<AtomicU64>,
}

impl RealtimeSocketFeed {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let (Some(base_url), Some(api_key)) = (&config.backend_url, &config.api_key) else {
            return Err(CloudSyncError::not_configured(
                config.missing_reason().unwrap_or("backend not configured"),
            ));
        };
        Ok(Self {
            socket_url: websocket_url(base_url, api_key),
            access_token: config.bearer_token().map(str::to_string),
            heartbeat_interval: config.heartbeat_interval.max(Duration::from_millis(10)),
            next_ref: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

/// `https://host` -> `wss://host/realtime/v1/websocket?apikey=..&vsn=1.0.0`
fn websocket_url(base_url: &str, api_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!(
        "{}/realtime/v1/websocket?apikey={}&vsn={}",
        ws_base,
        urlencoding::encode(api_key),
        PROTOCOL_VERSION
    )
}

fn join_message(
    spec: &ChannelSpec,
    topic: &str,
    reference: &str,
    access_token: Option<&str>,
) -> PhoenixMessage {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "*",
                "schema": "public",
                "table": spec.table,
                "filter": spec.server_filter(),
            }],
        },
    });
    if let Some(token) = access_token {
        payload["access_token"] = json!(token);
    }
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload,
        reference: Some(reference.to_string()),
    }
}

fn parse_change(spec: &ChannelSpec, payload: &serde_json::Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let kind = serde_json::from_value::<ChangeKind>(data.get("type")?.clone()).ok()?;
    let non_empty = |value: Option<&serde_json::Value>| {
        value
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .cloned()
    };
    let change = RowChange {
        table: data
            .get("table")
            .and_then(|v| v.as_str())
            .unwrap_or(&spec.table)
            .to_string(),
        kind,
        new: non_empty(data.get("record")),
        old: non_empty(data.get("old_record")),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };

    // The server filtered on the sub-resource column; the owner is checked here.
    if spec.resource.is_some() && change.kind != ChangeKind::Delete {
        let row = change.row()?;
        if !spec.matches(&change.table, row) {
            return None;
        }
    }
    Some(change)
}

/// Maps one inbound frame to a channel signal. Frames for other topics and
/// replies to anything but our join are ignored.
fn decode_frame(
    text: &str,
    spec: &ChannelSpec,
    topic: &str,
    join_ref: &str,
) -> Option<ChannelSignal> {
    let message = match serde_json::from_str::<PhoenixMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("[Realtime] Ignoring undecodable frame: {}", e);
            return None;
        }
    };
    if message.topic != topic {
        return None;
    }

    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(join_ref) => {
            match message.payload.get("status").and_then(|v| v.as_str()) {
                Some("ok") => Some(ChannelSignal::Subscribed),
                _ => Some(ChannelSignal::Error(format!(
                    "join rejected: {}",
                    message.payload.get("response").unwrap_or(&serde_json::Value::Null)
                ))),
            }
        }
        "phx_error" => Some(ChannelSignal::Error("channel error".to_string())),
        "phx_close" => Some(ChannelSignal::Closed),
        "system" => match message.payload.get("status").and_then(|v| v.as_str()) {
            Some("error") => Some(ChannelSignal::Error(
                message
                    .payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("system error")
                    .to_string(),
            )),
            Some("timeout") => Some(ChannelSignal::TimedOut),
            _ => None,
        },
        "postgres_changes" => parse_change(spec, &message.payload).map(ChannelSignal::Change),
        _ => None,
    }
}

#[async_trait]
impl ChangeFeed for RealtimeSocketFeed {
    async fn open_channel(&self, spec: &ChannelSpec) -> Result<Box<dyn FeedChannel>> {
        let (stream, _) = connect_async(self.socket_url.as_str())
            .await
            .map_err(|e| CloudSyncError::backend(format!("websocket connect failed: {}", e)))?;
        let (mut sink, mut source) = stream.split();

        let topic = format!("realtime:{}", spec.channel_key());
        let join_ref = self.next_ref();
        let join = join_message(spec, &topic, &join_ref, self.access_token.as_deref());
        sink.send(join.to_frame()?)
            .await
            .map_err(|e| CloudSyncError::backend(format!("join send failed: {}", e)))?;
        debug!("[Realtime] Sent join for {} (ref {})", topic, join_ref);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let heartbeat_every = self.heartbeat_interval;
        let refs = Arc::clone(&self.next_ref);
        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    _ = heartbeat.tick() => {
                        let beat = PhoenixMessage {
                            topic: "phoenix".to_string(),
                            event: "heartbeat".to_string(),
                            payload: json!({}),
                            reference: Some(refs.fetch_add(1, Ordering::SeqCst).to_string()),
                        };
                        let Ok(frame) = beat.to_frame() else { break };
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let reader_spec = spec.clone();
        let reader_topic = topic.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let signal = match frame {
                    Ok(Message::Text(text)) => {
                        decode_frame(&text, &reader_spec, &reader_topic, &join_ref)
                    }
                    Ok(Message::Close(_)) => Some(ChannelSignal::Closed),
                    Ok(_) => None,
                    Err(e) => Some(ChannelSignal::Error(format!("websocket error: {}", e))),
                };
                let Some(signal) = signal else { continue };
                let terminal = matches!(signal, ChannelSignal::Closed | ChannelSignal::Error(_));
                if signal_tx.send(signal).is_err() || terminal {
                    break;
                }
            }
        });

        Ok(Box::new(SocketChannel {
            topic,
            leave_ref: self.next_ref(),
            signals: signal_rx,
            outbound: Some(outbound_tx),
            reader,
            writer: Some(writer),
        }))
    }
}

struct SocketChannel {
    topic: String,
    leave_ref: String,
    signals: mpsc::UnboundedReceiver<ChannelSignal>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

#[async_trait]
impl FeedChannel for SocketChannel {
    async fn next_signal(&mut self) -> Option<ChannelSignal> {
        self.signals.recv().await
    }

    async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let leave = PhoenixMessage {
                topic: self.topic.clone(),
                event: "phx_leave".to_string(),
                payload: json!({}),
                reference: Some(self.leave_ref.clone()),
            };
            if let Ok(frame) = leave.to_frame() {
                let _ = outbound.send(frame);
            }
            // Dropping the sender makes the writer flush the leave and close.
        }
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(LEAVE_FLUSH_TIMEOUT, writer).await.is_err() {
                debug!("[Realtime] Timed out flushing leave for {}", self.topic);
            }
        }
        self.signals.close();
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn spec() -> ChannelSpec {
        ChannelSpec::new("workspace-sync", "workspace_sync", "owner-1")
    }

    #[test]
    fn websocket_url_switches_scheme_and_encodes_key() {
        assert_eq!(
            websocket_url("https://sync.example.com/", "key with space"),
            "wss://sync.example.com/realtime/v1/websocket?apikey=key%20with%20space&vsn=1.0.0"
        );
        assert!(websocket_url("http://127.0.0.1:4000", "k").starts_with("ws://127.0.0.1:4000/"));
    }

    #[test]
    fn join_message_filters_on_owner() {
        let message = join_message(&spec(), "realtime:workspace-sync:owner-1", "1", Some("tok"));
        assert_eq!(message.event, "phx_join");
        let change_config = &message.payload["config"]["postgres_changes"][0];
        assert_eq!(change_config["table"], "workspace_sync");
        assert_eq!(change_config["filter"], "user_id=eq.owner-1");
        assert_eq!(message.payload["access_token"], "tok");
    }

    #[test]
    fn decode_frame_maps_protocol_events() {
        let topic = "realtime:workspace-sync:owner-1";
        let frame = |event: &str, payload: serde_json::Value, reference: &str| {
            json!({ "topic": topic, "event": event, "payload": payload, "ref": reference })
                .to_string()
        };

        assert_eq!(
            decode_frame(&frame("phx_reply", json!({ "status": "ok" }), "1"), &spec(), topic, "1"),
            Some(ChannelSignal::Subscribed)
        );
        // Heartbeat or leave replies carry other refs.
        assert_eq!(
            decode_frame(&frame("phx_reply", json!({ "status": "ok" }), "7"), &spec(), topic, "1"),
            None
        );
        assert!(matches!(
            decode_frame(&frame("phx_reply", json!({ "status": "error" }), "1"), &spec(), topic, "1"),
            Some(ChannelSignal::Error(_))
        ));
        assert_eq!(
            decode_frame(&frame("phx_close", json!({}), "1"), &spec(), topic, "1"),
            Some(ChannelSignal::Closed)
        );
        assert_eq!(
            decode_frame(&frame("system", json!({ "status": "timeout" }), ""), &spec(), topic, "1"),
            Some(ChannelSignal::TimedOut)
        );
        assert_eq!(decode_frame("not json", &spec(), topic, "1"), None);
    }

    #[test]
    fn decode_frame_extracts_row_change() {
        let topic = "realtime:workspace-sync:owner-1";
        let text = json!({
            "topic": topic,
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "UPDATE",
                    "table": "workspace_sync",
                    "record": { "user_id": "owner-1", "data_type": "tabs", "data": [] },
                    "old_record": {},
                    "commit_timestamp": "2026-01-01T00:00:00Z"
                }
            },
            "ref": null
        })
        .to_string();

        match decode_frame(&text, &spec(), topic, "1") {
            Some(ChannelSignal::Change(change)) => {
                assert_eq!(change.kind, ChangeKind::Update);
                assert_eq!(change.table, "workspace_sync");
                assert!(change.old.is_none());
                assert_eq!(change.new.expect("record")["data_type"], "tabs");
            }
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn socket_channel_joins_streams_changes_and_leaves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(tcp).await.expect("handshake");

            let join = match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    serde_json::from_str::<PhoenixMessage>(&text).expect("join frame")
                }
                other => panic!("expected join, got {:?}", other),
            };
            assert_eq!(join.event, "phx_join");

            let reply = PhoenixMessage {
                topic: join.topic.clone(),
                event: "phx_reply".to_string(),
                payload: json!({ "status": "ok", "response": {} }),
                reference: join.reference.clone(),
            };
            ws.send(reply.to_frame().expect("frame")).await.expect("reply");

            let change = PhoenixMessage {
                topic: join.topic.clone(),
                event: "postgres_changes".to_string(),
                payload: json!({
                    "data": {
                        "type": "INSERT",
                        "table": "workspace_sync",
                        "record": { "user_id": "owner-1", "data_type": "layout", "data": {} }
                    }
                }),
                reference: None,
            };
            ws.send(change.to_frame().expect("frame")).await.expect("change");

            let mut events = Vec::new();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let message: PhoenixMessage = serde_json::from_str(&text).expect("frame");
                events.push(message.event);
            }
            events
        });

        let mut config = SyncConfig::new(format!("http://{}", addr), "anon-key");
        config.heartbeat_interval = Duration::from_secs(60);
        let feed = RealtimeSocketFeed::new(&config).expect("feed");

        let mut channel = feed.open_channel(&spec()).await.expect("open");
        assert_eq!(channel.next_signal().await, Some(ChannelSignal::Subscribed));
        match channel.next_signal().await {
            Some(ChannelSignal::Change(change)) => {
                assert_eq!(change.kind, ChangeKind::Insert);
                assert_eq!(change.new.expect("record")["data_type"], "layout");
            }
            other => panic!("expected change, got {:?}", other),
        }
        channel.close().await;

        let events = server.await.expect("server task");
        assert_eq!(events, vec!["phx_leave".to_string()]);
    }
}
