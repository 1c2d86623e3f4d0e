//! Realtime change feed over the backend's Phoenix websocket.
//!
//! One channel is joined per table (`realtime:public:<table>`) with a
//! `postgres_changes` subscription. The socket must see a heartbeat at least
//! every 30s or the server drops it. When the connection ends the listener
//! reconnects after a back-off; missed changes are covered by the poll loop.

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChangeEvent, RowChange, Table};
use crate::error::{AppError, AppResult};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_secs(5);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// What the listener reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Connected,
    Change(ChangeEvent),
    Disconnected(String),
}

pub fn topic(table: Table) -> String {
    format!("realtime:public:{}", table.name())
}

pub fn join_message(table: Table, msg_ref: u64, access_token: Option<&str>) -> String {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [
                { "event": "*", "schema": "public", "table": table.name() }
            ]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": payload,
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

/// Hand a refreshed JWT to an already joined channel.
pub fn access_token_message(table: Table, msg_ref: u64, access_token: &str) -> String {
    json!({
        "topic": topic(table),
        "event": "access_token",
        "payload": { "access_token": access_token },
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

/// Messages needed to move joined channels from `current` to `latest`.
/// Updates `current` and `msg_ref` when anything is sent.
pub fn token_updates(
    tables: &[Table],
    current: &mut Option<String>,
    latest: Option<String>,
    msg_ref: &mut u64,
) -> Vec<String> {
    let Some(latest) = latest else {
        return Vec::new();
    };
    if current.as_deref() == Some(latest.as_str()) {
        return Vec::new();
    }
    let messages = tables
        .iter()
        .map(|table| {
            *msg_ref += 1;
            access_token_message(*table, *msg_ref, &latest)
        })
        .collect();
    *current = Some(latest);
    messages
}

pub fn heartbeat_message(msg_ref: u64) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref.to_string(),
    })
    .to_string()
}

/// Decode one text frame. Frames that are not row changes (join replies,
/// heartbeats, presence) yield `Ok(None)`.
pub fn parse_frame(text: &str) -> AppResult<Option<ChangeEvent>> {
    let frame: Value = serde_json::from_str(text)?;
    let event = frame.get("event").and_then(Value::as_str).unwrap_or_default();

    if event == "phx_reply" {
        let status = frame
            .pointer("/payload/status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status == "error" {
            let topic = frame.get("topic").and_then(Value::as_str).unwrap_or("?");
            warn!(topic, payload = %frame["payload"], "realtime join rejected");
        }
        return Ok(None);
    }
    if event != "postgres_changes" {
        return Ok(None);
    }

    let data = frame
        .pointer("/payload/data")
        .ok_or_else(|| AppError::Decode("postgres_changes frame without data".into()))?;
    let table_name = data.get("table").and_then(Value::as_str).unwrap_or_default();
    let Some(table) = Table::parse(table_name) else {
        debug!(table = table_name, "ignoring change for unknown table");
        return Ok(None);
    };
    let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();

    let change = match table {
        Table::Sales => ChangeEvent::Sales(row_change(kind, data)?),
        Table::Payments => ChangeEvent::Payments(row_change(kind, data)?),
        Table::Deliveries => ChangeEvent::Deliveries(row_change(kind, data)?),
    };
    Ok(Some(change))
}

fn row_change<T: DeserializeOwned>(kind: &str, data: &Value) -> AppResult<RowChange<T>> {
    match kind {
        "INSERT" => Ok(RowChange::Inserted(serde_json::from_value(
            data.get("record").cloned().unwrap_or(Value::Null),
        )?)),
        "UPDATE" => Ok(RowChange::Updated(serde_json::from_value(
            data.get("record").cloned().unwrap_or(Value::Null),
        )?)),
        "DELETE" => data
            .pointer("/old_record/id")
            .and_then(Value::as_i64)
            .map(RowChange::Deleted)
            .ok_or_else(|| AppError::Decode("DELETE change without old_record.id".into())),
        other => Err(AppError::Decode(format!("unknown change type {other:?}"))),
    }
}

/// Run the feed until `cancel` fires, reconnecting after failures.
///
/// `access_token` is read when each session joins and again on every
/// heartbeat, so a refreshed session reaches the open channels.
pub async fn listen<F, T>(
    url: String,
    tables: Vec<Table>,
    access_token: T,
    cancel: CancellationToken,
    mut on_incoming: F,
) where
    F: FnMut(Incoming) + Send,
    T: Fn() -> Option<String> + Send + Sync,
{
    let mut backoff = RECONNECT_MIN;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = run_session(&url, &tables, &access_token, &cancel, &mut on_incoming) => outcome,
        };
        match outcome {
            SessionEnd::Cancelled => return,
            SessionEnd::Closed { joined, reason } => {
                warn!(reason = %reason, "realtime connection lost");
                on_incoming(Incoming::Disconnected(reason));
                if joined {
                    backoff = RECONNECT_MIN;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

enum SessionEnd {
    Cancelled,
    Closed { joined: bool, reason: String },
}

async fn run_session<F, T>(
    url: &str,
    tables: &[Table],
    access_token: &T,
    cancel: &CancellationToken,
    on_incoming: &mut F,
) -> SessionEnd
where
    F: FnMut(Incoming) + Send,
    T: Fn() -> Option<String> + Send + Sync,
{
    let mut joined_token = access_token();
    let (socket, _) = match connect_async(url).await {
        Ok(pair) => pair,
        Err(e) => {
            return SessionEnd::Closed {
                joined: false,
                reason: format!("connect failed: {e}"),
            }
        }
    };
    let (mut sink, mut stream) = socket.split();

    let mut msg_ref: u64 = 0;
    for table in tables {
        msg_ref += 1;
        if let Err(e) = sink
            .send(Message::Text(join_message(*table, msg_ref, joined_token.as_deref())))
            .await
        {
            return SessionEnd::Closed {
                joined: false,
                reason: format!("join failed: {e}"),
            };
        }
    }
    info!(tables = tables.len(), "realtime channels joined");
    on_incoming(Incoming::Connected);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Cancelled;
            }
            _ = heartbeat.tick() => {
                msg_ref += 1;
                if let Err(e) = sink.send(Message::Text(heartbeat_message(msg_ref))).await {
                    return SessionEnd::Closed { joined: true, reason: format!("heartbeat failed: {e}") };
                }
                let updates = token_updates(tables, &mut joined_token, access_token(), &mut msg_ref);
                if !updates.is_empty() {
                    debug!(channels = updates.len(), "pushing refreshed access token");
                }
                for update in updates {
                    if let Err(e) = sink.send(Message::Text(update)).await {
                        return SessionEnd::Closed { joined: true, reason: format!("token update failed: {e}") };
                    }
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(Some(change)) => on_incoming(Incoming::Change(change)),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping undecodable realtime frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".into());
                    return SessionEnd::Closed { joined: true, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SessionEnd::Closed { joined: true, reason: e.to_string() };
                }
                None => {
                    return SessionEnd::Closed { joined: true, reason: "stream ended".into() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStatus;

    #[test]
    fn test_join_message_shape() {
        let msg: Value = serde_json::from_str(&join_message(Table::Deliveries, 3, Some("jwt"))).unwrap();
        assert_eq!(msg["topic"], "realtime:public:deliveries");
        assert_eq!(msg["event"], "phx_join");
        assert_eq!(msg["ref"], "3");
        assert_eq!(
            msg["payload"]["config"]["postgres_changes"][0]["table"],
            "deliveries"
        );
        assert_eq!(msg["payload"]["access_token"], "jwt");
    }

    #[test]
    fn test_refreshed_token_is_sent_once_per_channel() {
        let tables = [Table::Sales, Table::Deliveries];
        let mut current = Some("old-jwt".to_string());
        let mut msg_ref = 4;

        assert!(token_updates(&tables, &mut current, Some("old-jwt".into()), &mut msg_ref).is_empty());
        assert!(token_updates(&tables, &mut current, None, &mut msg_ref).is_empty());
        assert_eq!(msg_ref, 4);

        let sent = token_updates(&tables, &mut current, Some("new-jwt".into()), &mut msg_ref);
        assert_eq!(sent.len(), 2);
        let first: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(first["topic"], "realtime:public:sales");
        assert_eq!(first["event"], "access_token");
        assert_eq!(first["payload"]["access_token"], "new-jwt");
        assert_eq!(first["ref"], "5");
        let second: Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(second["topic"], "realtime:public:deliveries");
        assert_eq!(current.as_deref(), Some("new-jwt"));
        assert_eq!(msg_ref, 6);

        assert!(token_updates(&tables, &mut current, Some("new-jwt".into()), &mut msg_ref).is_empty());
    }

    #[test]
    fn test_first_token_after_anonymous_join_is_sent() {
        let mut current = None;
        let mut msg_ref = 1;
        let sent = token_updates(&[Table::Payments], &mut current, Some("jwt".into()), &mut msg_ref);
        assert_eq!(sent.len(), 1);
        assert_eq!(current.as_deref(), Some("jwt"));
    }

    #[test]
    fn test_heartbeat_targets_phoenix_topic() {
        let msg: Value = serde_json::from_str(&heartbeat_message(9)).unwrap();
        assert_eq!(msg["topic"], "phoenix");
        assert_eq!(msg["event"], "heartbeat");
    }

    #[test]
    fn test_parse_delivery_insert() {
        let frame = r#"{
            "topic": "realtime:public:deliveries",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "deliveries",
                    "commit_timestamp": "2025-03-14T10:00:01Z",
                    "type": "INSERT",
                    "record": {
                        "id": 42, "order_id": "77", "address": "Rua X, 10",
                        "status": "in_route", "start_time": "2025-03-14T10:00:00Z",
                        "delivered_at": null, "created_at": "2025-03-14T10:00:01Z",
                        "driver_email": "moto@bellaflor.test", "delivery_fee": 8
                    },
                    "old_record": null
                }
            }
        }"#;
        match parse_frame(frame).unwrap() {
            Some(ChangeEvent::Deliveries(RowChange::Inserted(d))) => {
                assert_eq!(d.id, 42);
                assert_eq!(d.status, DeliveryStatus::InRoute);
                assert_eq!(d.delivery_fee, Some(8.0));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_payment_delete_uses_old_record() {
        let frame = r#"{"topic":"realtime:public:payments","event":"postgres_changes","payload":{"data":{"table":"payments","type":"DELETE","record":null,"old_record":{"id":5}}}}"#;
        assert_eq!(
            parse_frame(frame).unwrap(),
            Some(ChangeEvent::Payments(RowChange::Deleted(5)))
        );
    }

    #[test]
    fn test_non_change_frames_are_ignored() {
        let reply = r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        assert_eq!(parse_frame(reply).unwrap(), None);
        let system = r#"{"topic":"realtime:public:sales","event":"system","payload":{"status":"ok"}}"#;
        assert_eq!(parse_frame(system).unwrap(), None);
        let other_table = r#"{"event":"postgres_changes","payload":{"data":{"table":"flowers","type":"INSERT","record":{}}}}"#;
        assert_eq!(parse_frame(other_table).unwrap(), None);
    }

    #[test]
    fn test_malformed_change_is_decode_error() {
        let frame = r#"{"event":"postgres_changes","payload":{"data":{"table":"sales","type":"UPDATE","record":{"id":"x"}}}}"#;
        assert!(matches!(parse_frame(frame), Err(AppError::Decode(_))));
        assert!(parse_frame("not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_stops_on_cancel_while_backing_off() {
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        listen(
            "ws://127.0.0.1:9/realtime/v1/websocket".into(),
            vec![Table::Deliveries],
            || None,
            cancel,
            |incoming| seen.push(incoming),
        )
        .await;
        assert!(seen
            .iter()
            .all(|i| matches!(i, Incoming::Disconnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_reconnect_reads_the_current_token() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let reads = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            stopper.cancel();
        });
        let counter = reads.clone();
        // Rejected before any socket I/O, so only the paused clock moves.
        listen(
            "ftp://localhost/realtime/v1/websocket".into(),
            vec![Table::Deliveries],
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some("jwt".to_string())
            },
            cancel,
            |_| {},
        )
        .await;
        // Attempts at 0s, 5s and 15s before the cancel at 20s.
        assert_eq!(reads.load(Ordering::SeqCst), 3);
    }
}
