// =============================================================================
// StreamConnector — one live candle channel, fanned out to subscribers
// =============================================================================
//
// Two cooperating tasks per series: the read loop (connect + subscribe +
// parse) and the fan-out loop (drain the FIFO queue into the broadcast
// channel). Updates reach subscribers in exact parser order. Reconnection is
// a continuous retry loop wrapping connect + read, bounded per connect call
// by the retry policy's elapsed-time budget; budget exhaustion propagates to
// the owning task and ends the stream for all subscribers.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::retry::RetryPolicy;
use crate::types::{Candle, ConnectionState, Series};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast capacity per subscriber. A subscriber that falls further behind
/// than this observes `Lagged` and must resynchronize (LiveSync reloads from
/// history when that happens).
const BROADCAST_CAPACITY: usize = 1024;

/// Cap on the ordered in-memory buffer the reconciler snapshots. Old entries
/// are already persisted by the time they rotate out.
const LIVE_BUFFER_CAP: usize = 2880;

pub struct StreamConnector {
    series: Series,
    ws_url: String,
    retry: RetryPolicy,
    /// Ordered buffer of observed candles, newest last; same-open-time
    /// updates are merged in place.
    buffer: Arc<RwLock<Vec<Candle>>>,
    /// Strict-FIFO handoff from the parser to the fan-out task.
    queue_tx: mpsc::UnboundedSender<Candle>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Candle>>>,
    /// Dropped when the connector shuts down so subscribers see end-of-stream.
    broadcast: RwLock<Option<broadcast::Sender<Candle>>>,
    state: RwLock<ConnectionState>,
    stop_tx: watch::Sender<bool>,
}

impl StreamConnector {
    pub fn new(series: Series, ws_url: impl Into<String>, connect_budget: Duration) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Arc::new(Self {
            series,
            ws_url: ws_url.into(),
            retry: RetryPolicy::new(connect_budget),
            buffer: Arc::new(RwLock::new(Vec::new())),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            broadcast: RwLock::new(Some(broadcast_tx)),
            state: RwLock::new(ConnectionState::Disconnected),
            stop_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(series = %self.series, from = %*state, to = %next, "connection state");
            *state = next;
        }
    }

    /// Subscribe to the candle update stream. Updates arrive in parser order;
    /// the receiver ends once the connector shuts down.
    pub fn subscribe(&self) -> broadcast::Receiver<Candle> {
        match self.broadcast.read().as_ref() {
            Some(tx) => tx.subscribe(),
            // Already shut down: hand out a receiver that is immediately closed.
            None => broadcast::channel(1).1,
        }
    }

    /// Handle to the ordered observed-candle buffer (the reconciler snapshots
    /// this each pass).
    pub fn live_buffer(&self) -> Arc<RwLock<Vec<Candle>>> {
        self.buffer.clone()
    }

    /// Request shutdown. Both loops observe the flag at their next iteration
    /// boundary; the pending socket read is unblocked by cancelling and
    /// dropping the connection.
    pub fn stop(&self) {
        info!(series = %self.series, "stopping connector");
        self.set_state(ConnectionState::Stopping);
        let _ = self.stop_tx.send(true);
    }

    /// Run until stopped or the connect retry budget is exhausted.
    ///
    /// Spawns the fan-out task, then loops connect + read; any read or parse
    /// failure re-enters `connect()` under the retry policy.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let fan = self.clone();
        let fan_task = tokio::spawn(async move { fan.fan_out().await });

        // wait_for also covers a stop() issued before run() started.
        let mut stop_rx = self.stop_tx.subscribe();
        let result = tokio::select! {
            r = self.reconnect_loop() => r,
            _ = stop_rx.wait_for(|stopped| *stopped) => Ok(()),
        };

        // Wake the fan-out loop and drop the broadcast sender so every
        // subscriber observes end-of-stream.
        let _ = self.stop_tx.send(true);
        let _ = fan_task.await;
        *self.broadcast.write() = None;
        self.set_state(ConnectionState::Disconnected);

        result
    }

    async fn reconnect_loop(&self) -> Result<()> {
        loop {
            let ws = self
                .retry
                .run("candle channel connect", || self.connect())
                .await?;

            let (_write, read) = ws.split();
            match self.read_loop(read).await {
                Ok(()) => warn!(series = %self.series, "candle channel closed by remote, reconnecting"),
                Err(e) => warn!(series = %self.series, error = %e, "candle channel read failed, reconnecting"),
            }
        }
    }

    /// Establish the transport connection and send the channel subscription.
    /// The acknowledgement arrives on the stream and is handled by the read
    /// loop.
    async fn connect(&self) -> Result<WsStream> {
        self.set_state(ConnectionState::Connecting);
        info!(series = %self.series, url = %self.ws_url, "connecting candle channel");

        let (mut ws, _response) = connect_async(&self.ws_url)
            .await
            .map_err(|e| FeedError::Connection(e.to_string()))
            .context("failed to connect candle channel")?;

        let sub = serde_json::json!({
            "op": "subscribe",
            "args": [{
                "channel": self.series.interval.channel(),
                "instId": self.series.symbol,
            }]
        });
        ws.send(Message::Text(sub.to_string()))
            .await
            .map_err(|e| FeedError::Subscription(e.to_string()))
            .context("failed to send channel subscription")?;

        Ok(ws)
    }

    /// Read raw messages until the connection fails or closes. A malformed
    /// message is treated as a transient I/O error: the loop aborts and the
    /// caller reconnects. Generic over the message source so a scripted
    /// session can be driven through it.
    async fn read_loop<S>(&self, mut read: S) -> Result<()>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => self.handle_message(&text)?,
                // Ping/pong/binary frames are handled by the library or ignored.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(FeedError::Connection(e.to_string()).into()),
                None => return Ok(()),
            }
        }
    }

    /// Parse one raw channel message: subscription acks are logged, error
    /// events abort the connection, data messages are normalized and queued.
    fn handle_message(&self, text: &str) -> Result<()> {
        let root: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| FeedError::Parse(format!("invalid channel JSON: {e}")))?;

        if let Some(event) = root["event"].as_str() {
            match event {
                "subscribe" => {
                    info!(
                        series = %self.series,
                        channel = root["arg"]["channel"].as_str().unwrap_or("?"),
                        "channel subscription acknowledged"
                    );
                    self.set_state(ConnectionState::Subscribed);
                }
                "error" => {
                    let msg = root["msg"].as_str().unwrap_or("unknown").to_string();
                    return Err(FeedError::Subscription(msg).into());
                }
                other => debug!(series = %self.series, event = other, "ignoring channel event"),
            }
            return Ok(());
        }

        if root["data"].is_array() {
            let candle = parse_candle_update(&root)?;
            self.set_state(ConnectionState::Streaming);
            self.ingest(candle);
        }

        Ok(())
    }

    /// Apply the merge rule to the ordered buffer, then enqueue the post-merge
    /// update for fan-out.
    fn ingest(&self, candle: Candle) {
        {
            let mut buf = self.buffer.write();
            merge_update(&mut buf, &candle);
        }
        // Fails only when the fan-out task is gone, i.e. during shutdown.
        let _ = self.queue_tx.send(candle);
    }

    /// Drain the FIFO queue, delivering each update to every subscriber.
    /// Delivery is push, in arrival order, shared across subscribers.
    async fn fan_out(&self) {
        let mut rx = match self.queue_rx.lock().take() {
            Some(rx) => rx,
            None => return, // run() called twice; second fan-out has nothing to do
        };
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
                item = rx.recv() => match item {
                    Some(candle) => {
                        if let Some(tx) = self.broadcast.read().as_ref() {
                            // No receivers is fine; updates still fill the buffer.
                            let _ = tx.send(candle);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(series = %self.series, "fan-out loop exited");
    }
}

/// Merge rule: an update whose open time equals the last buffered item
/// overwrites that item's OHLCV in place (the exchange resends the still-open
/// bar); otherwise it is appended. The buffer is capped; oldest entries
/// rotate out once persisted history has long covered them.
fn merge_update(buffer: &mut Vec<Candle>, candle: &Candle) {
    match buffer.last_mut() {
        Some(last) if last.open_time == candle.open_time => last.refine_from(candle),
        _ => buffer.push(candle.clone()),
    }
    if buffer.len() > LIVE_BUFFER_CAP {
        let excess = buffer.len() - LIVE_BUFFER_CAP;
        buffer.drain(..excess);
    }
}

/// Parse a candle data message.
///
/// Expected shape:
/// ```json
/// { "arg": { "channel": "candle1m", "instId": "BTC-USDT-SWAP" },
///   "data": [["1700000000000", "37000.1", "37050.2", "36990.3", "37020.4", "123.5", "..."]] }
/// ```
fn parse_candle_update(root: &serde_json::Value) -> Result<Candle> {
    let row = root["data"][0]
        .as_array()
        .ok_or_else(|| FeedError::Parse("data message missing candle row".into()))?;
    if row.len() < 6 {
        return Err(FeedError::Parse(format!("candle row has {} fields", row.len())).into());
    }

    Ok(Candle::new(
        field_i64(&row[0], "ts")?,
        field_f64(&row[1], "open")?,
        field_f64(&row[2], "high")?,
        field_f64(&row[3], "low")?,
        field_f64(&row[4], "close")?,
        field_f64(&row[5], "volume")?,
    ))
}

/// The exchange sends numeric candle fields as JSON strings.
fn field_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| FeedError::Parse(format!("field {name} is not a valid f64: {s}")).into()),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FeedError::Parse(format!("field {name} is not a valid f64")).into()),
        _ => Err(FeedError::Parse(format!("field {name} has unexpected JSON type")).into()),
    }
}

fn field_i64(val: &serde_json::Value, name: &str) -> Result<i64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| FeedError::Parse(format!("field {name} is not a valid i64: {s}")).into()),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| FeedError::Parse(format!("field {name} is not a valid i64")).into()),
        _ => Err(FeedError::Parse(format!("field {name} has unexpected JSON type")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connector() -> Arc<StreamConnector> {
        StreamConnector::new(
            Series::new("BTC-USDT-SWAP", "1m".parse().unwrap()),
            "wss://example.invalid/ws",
            Duration::from_secs(5),
        )
    }

    fn data_message(ts: i64, close: f64) -> String {
        format!(
            r#"{{ "arg": {{ "channel": "candle1m", "instId": "BTC-USDT-SWAP" }},
                 "data": [["{ts}", "100.0", "101.0", "99.0", "{close}", "12.5", "0", "0"]] }}"#
        )
    }

    #[test]
    fn merge_overwrites_equal_open_time() {
        let mut buf = Vec::new();
        merge_update(&mut buf, &Candle::new(0, 1.0, 1.0, 1.0, 1.0, 1.0));
        merge_update(&mut buf, &Candle::new(0, 1.0, 2.0, 0.5, 1.8, 3.0));
        merge_update(&mut buf, &Candle::new(60_000, 1.8, 1.9, 1.7, 1.85, 1.0));

        assert_eq!(buf.len(), 2);
        assert!((buf[0].close - 1.8).abs() < f64::EPSILON);
        assert!((buf[0].volume - 3.0).abs() < f64::EPSILON);
        assert_eq!(buf[1].open_time, 60_000);
    }

    #[test]
    fn ack_message_moves_state_to_subscribed() {
        let conn = test_connector();
        let ack = r#"{ "event": "subscribe", "arg": { "channel": "candle1m", "instId": "BTC-USDT-SWAP" } }"#;
        conn.handle_message(ack).unwrap();
        assert_eq!(conn.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn error_event_aborts_the_read_loop() {
        let conn = test_connector();
        let err = conn
            .handle_message(r#"{ "event": "error", "msg": "channel does not exist" }"#)
            .unwrap_err();
        assert!(format!("{err}").contains("channel does not exist"));
    }

    #[test]
    fn malformed_message_is_an_error() {
        let conn = test_connector();
        assert!(conn.handle_message("not json").is_err());
        assert!(conn
            .handle_message(r#"{ "data": [["bad-ts", "1", "1", "1", "1", "1"]] }"#)
            .is_err());
    }

    #[tokio::test]
    async fn dedup_single_entry_and_latest_values_reach_subscribers() {
        let conn = test_connector();
        let mut rx = conn.subscribe();

        let fan = conn.clone();
        tokio::spawn(async move { fan.fan_out().await });

        conn.handle_message(&data_message(60_000, 100.5)).unwrap();
        conn.handle_message(&data_message(60_000, 100.9)).unwrap();

        // One buffered entry after the in-place merge.
        assert_eq!(conn.live_buffer().read().len(), 1);

        // Each update produced exactly one enqueue; the second carries the
        // refined values.
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.open_time, 60_000);
        assert!((second.close - 100.9).abs() < f64::EPSILON);

        conn.stop();
        assert_eq!(conn.state(), ConnectionState::Stopping);
    }

    #[tokio::test]
    async fn fan_out_preserves_arrival_order_for_all_subscribers() {
        let conn = test_connector();
        let mut rx_a = conn.subscribe();
        let mut rx_b = conn.subscribe();

        let fan = conn.clone();
        tokio::spawn(async move { fan.fan_out().await });

        for i in 0..5 {
            conn.handle_message(&data_message(i * 60_000, 100.0 + i as f64))
                .unwrap();
        }

        for i in 0..5 {
            assert_eq!(rx_a.recv().await.unwrap().open_time, i * 60_000);
            assert_eq!(rx_b.recv().await.unwrap().open_time, i * 60_000);
        }
    }

    #[tokio::test]
    async fn read_failure_reconnect_resumes_without_duplicate_delivery() {
        use futures_util::stream;
        use tokio_tungstenite::tungstenite::error::ProtocolError;

        let conn = test_connector();
        let mut rx = conn.subscribe();
        let fan = conn.clone();
        tokio::spawn(async move { fan.fan_out().await });

        let ack = r#"{ "event": "subscribe", "arg": { "channel": "candle1m", "instId": "BTC-USDT-SWAP" } }"#;

        // First session: ack, one update, then the transport drops mid-stream.
        let first = stream::iter(vec![
            Ok(Message::Text(ack.to_string())),
            Ok(Message::Text(data_message(60_000, 100.5))),
            Err(tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake,
            )),
        ]);
        assert!(conn.read_loop(first).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Streaming);

        // Reconnect path: connect() re-enters Connecting, the fresh session
        // acks, then data flows again.
        conn.set_state(ConnectionState::Connecting);
        let ack_only = stream::iter(vec![Ok(Message::Text(ack.to_string()))]);
        conn.read_loop(ack_only).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Subscribed);

        let second = stream::iter(vec![Ok(Message::Text(data_message(120_000, 101.0)))]);
        conn.read_loop(second).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Streaming);

        // Each update reached the subscriber exactly once; nothing from the
        // first session was re-delivered after the reconnect.
        assert_eq!(rx.recv().await.unwrap().open_time, 60_000);
        assert_eq!(rx.recv().await.unwrap().open_time, 120_000);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn stop_before_run_still_shuts_down() {
        let conn = test_connector();
        conn.stop();

        let run_result = tokio::time::timeout(Duration::from_secs(5), conn.clone().run())
            .await
            .expect("run must observe the pre-set stop flag");
        assert!(run_result.is_ok());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // Late subscribers observe end-of-stream.
        let mut rx = conn.subscribe();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn parse_candle_update_reads_fields() {
        let root: serde_json::Value = serde_json::from_str(&data_message(1_700_000_000_000, 37020.4)).unwrap();
        let candle = parse_candle_update(&root).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.close - 37020.4).abs() < f64::EPSILON);
        assert!((candle.volume - 12.5).abs() < f64::EPSILON);
    }
}
