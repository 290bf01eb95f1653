use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use crate::utils::is_truthy;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_500);

/// Callback for decoded frames. Errors and panics are logged and never reach
/// other handlers.
pub type Handler = Arc<dyn Fn(&JsonValue) -> Result<()> + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&JsonValue) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Text frames in both directions of one open connection. The connection is
/// considered closed once `inbound` yields `None`.
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>>;
}

/// WebSocket transport; text and binary messages are both surfaced as text.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>> {
        let url = url.to_string();
        Box::pin(async move {
            let (ws, response) = connect_async(url.as_str())
                .await
                .with_context(|| format!("websocket connect {url}"))?;
            log::debug!("live.handshake url={} status={}", url, response.status());

            let (mut writer, mut reader) = ws.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if writer.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = writer.close().await;
            });

            tokio::spawn(async move {
                while let Some(msg) = reader.next().await {
                    let text = match msg {
                        Ok(WsMessage::Text(t)) => t.as_str().to_owned(),
                        Ok(WsMessage::Binary(b)) => String::from_utf8_lossy(&b).into_owned(),
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            log::warn!("live.read.error err={}", e);
                            break;
                        }
                    };
                    if in_tx.send(text).is_err() {
                        break;
                    }
                }
            });

            Ok(Transport {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: ControlKind,
    pub channel: String,
}

impl ControlFrame {
    pub fn subscribe(channel: &str) -> Self {
        Self {
            kind: ControlKind::Subscribe,
            channel: channel.to_string(),
        }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self {
            kind: ControlKind::Unsubscribe,
            channel: channel.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames that are not JSON are delivered as a JSON string.
pub fn decode_frame(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Channel(&'a str),
    Broadcast,
    Nobody,
}

/// A non-empty string `channel` targets that channel; a missing or falsy one
/// reaches every handler; anything else reaches no one.
pub fn route(frame: &JsonValue) -> Route<'_> {
    match frame.get("channel") {
        Some(JsonValue::String(s)) if !s.is_empty() => Route::Channel(s),
        None => Route::Broadcast,
        Some(v) if !is_truthy(v) => Route::Broadcast,
        Some(_) => Route::Nobody,
    }
}

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct ConnState {
    handlers: HashMap<String, Vec<HandlerEntry>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl ConnState {
    fn send(&self, frame: ControlFrame) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(frame.encode());
        }
    }

    fn targets(&self, route: Route<'_>) -> Vec<(String, u64, Handler)> {
        match route {
            Route::Channel(ch) => self
                .handlers
                .get(ch)
                .map(|list| list.iter().map(|e| (ch.to_string(), e.id, e.handler.clone())).collect())
                .unwrap_or_default(),
            Route::Broadcast => self
                .handlers
                .iter()
                .flat_map(|(ch, list)| list.iter().map(move |e| (ch.clone(), e.id, e.handler.clone())))
                .collect(),
            Route::Nobody => Vec::new(),
        }
    }
}

struct Connection {
    state: Arc<Mutex<ConnState>>,
    task: JoinHandle<()>,
}

/// Owns every live connection. Construct once and share it.
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    reconnect_delay: Duration,
    connections: Mutex<HashMap<String, Connection>>,
    next_id: AtomicU64,
}

/// Handle returned by [`ChannelManager::subscribe`]. Dropping it keeps the
/// handler registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    url: String,
    channel: String,
    id: u64,
    state: Arc<Mutex<ConnState>>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn unsubscribe(self) {
        let mut st = self.state.lock();
        let Some(list) = st.handlers.get_mut(&self.channel) else {
            return;
        };
        list.retain(|e| e.id != self.id);
        if list.is_empty() {
            st.handlers.remove(&self.channel);
            st.send(ControlFrame::unsubscribe(&self.channel));
            log::debug!("live.unsubscribe url={} channel={}", self.url, self.channel);
        }
    }
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn Connector>, reconnect_delay: Duration) -> Self {
        Self {
            connector,
            reconnect_delay,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn websocket(reconnect_delay: Duration) -> Self {
        Self::new(Arc::new(WsConnector), reconnect_delay)
    }

    /// Registers `handler` for `channel` on `url`, opening the connection on
    /// first use. Must be called from within a tokio runtime.
    pub fn subscribe(&self, url: &str, channel: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = {
            let mut conns = self.connections.lock();
            let conn = conns.entry(url.to_string()).or_insert_with(|| self.open(url));
            conn.state.clone()
        };

        {
            let mut st = state.lock();
            let list = st.handlers.entry(channel.to_string()).or_default();
            let first = list.is_empty();
            list.push(HandlerEntry { id, handler });
            if first {
                st.send(ControlFrame::subscribe(channel));
            }
        }
        log::debug!("live.subscribe url={} channel={} id={}", url, channel, id);

        Subscription {
            url: url.to_string(),
            channel: channel.to_string(),
            id,
            state,
        }
    }

    pub fn is_connected(&self, url: &str) -> bool {
        let state = match self.connections.lock().get(url) {
            Some(conn) => conn.state.clone(),
            None => return false,
        };
        let connected = state.lock().outbound.is_some();
        connected
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, url: &str, channel: &str) -> usize {
        let state = match self.connections.lock().get(url) {
            Some(conn) => conn.state.clone(),
            None => return 0,
        };
        let n = state.lock().handlers.get(channel).map(Vec::len).unwrap_or(0);
        n
    }

    /// Stops every connection task and forgets all handlers.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Connection)> = self.connections.lock().drain().collect();
        for (url, conn) in drained {
            conn.task.abort();
            let mut st = conn.state.lock();
            st.handlers.clear();
            st.outbound = None;
            log::info!("live.shutdown url={}", url);
        }
    }

    fn open(&self, url: &str) -> Connection {
        let state = Arc::new(Mutex::new(ConnState::default()));
        let task = tokio::spawn(run_connection(
            url.to_string(),
            self.connector.clone(),
            state.clone(),
            self.reconnect_delay,
        ));
        Connection { state, task }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        for conn in self.connections.get_mut().values() {
            conn.task.abort();
        }
    }
}

async fn run_connection(url: String, connector: Arc<dyn Connector>, state: Arc<Mutex<ConnState>>, delay: Duration) {
    loop {
        match connector.connect(&url).await {
            Ok(Transport { outbound, mut inbound }) => {
                let channels = {
                    let mut st = state.lock();
                    for ch in st.handlers.keys() {
                        let _ = outbound.send(ControlFrame::subscribe(ch).encode());
                    }
                    st.outbound = Some(outbound);
                    st.handlers.len()
                };
                log::info!("live.connect url={} channels={}", url, channels);

                while let Some(text) = inbound.recv().await {
                    dispatch(&state, &text);
                }

                state.lock().outbound = None;
                log::warn!("live.closed url={} retry_ms={}", url, delay.as_millis());
            }
            Err(e) => {
                log::warn!("live.connect.error url={} err={:#} retry_ms={}", url, e, delay.as_millis());
            }
        }
        tokio::time::sleep(delay).await;
    }
}

/// Delivers one frame and returns how many handlers were invoked. Handlers run
/// outside the state lock so they may subscribe or unsubscribe.
fn dispatch(state: &Mutex<ConnState>, text: &str) -> usize {
    let frame = decode_frame(text);
    let targets = state.lock().targets(route(&frame));
    for (channel, id, h) in &targets {
        match std::panic::catch_unwind(AssertUnwindSafe(|| h(&frame))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("live.handler.error channel={} id={} err={:#}", channel, id, e),
            Err(_) => log::error!("live.handler.panic channel={} id={}", channel, id),
        }
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const URL: &str = "ws://feed.test";

    struct ServerConn {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl ServerConn {
        async fn recv(&mut self) -> JsonValue {
            let text = timeout(WAIT, self.from_client.recv()).await.unwrap().unwrap();
            serde_json::from_str(&text).unwrap()
        }

        async fn assert_silent(&mut self) {
            assert!(timeout(Duration::from_millis(50), self.from_client.recv()).await.is_err());
        }

        fn push(&self, text: &str) {
            self.to_client.send(text.to_string()).unwrap();
        }
    }

    struct MockConnector {
        accepted: mpsc::UnboundedSender<ServerConn>,
        refuse: AtomicUsize,
    }

    impl Connector for MockConnector {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Transport>> {
            if self.refuse.load(Ordering::SeqCst) > 0 {
                self.refuse.fetch_sub(1, Ordering::SeqCst);
                return Box::pin(async { Err(anyhow::anyhow!("connection refused")) });
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let _ = self.accepted.send(ServerConn {
                to_client: in_tx,
                from_client: out_rx,
            });
            Box::pin(async move {
                Ok(Transport {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            })
        }
    }

    fn manager(refuse: usize) -> (ChannelManager, mpsc::UnboundedReceiver<ServerConn>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MockConnector {
            accepted: tx,
            refuse: AtomicUsize::new(refuse),
        };
        (ChannelManager::new(Arc::new(connector), Duration::from_millis(10)), rx)
    }

    async fn accept(rx: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn recorder(tag: &'static str, tx: &mpsc::UnboundedSender<(&'static str, JsonValue)>) -> Handler {
        let tx = tx.clone();
        handler(move |v| {
            let _ = tx.send((tag, v.clone()));
            Ok(())
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(&'static str, JsonValue)>) -> (&'static str, JsonValue) {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_route_policy() {
        assert_eq!(route(&json!({"channel": "symbol:IBM"})), Route::Channel("symbol:IBM"));
        assert_eq!(route(&json!({"price": 1})), Route::Broadcast);
        assert_eq!(route(&json!({"channel": null})), Route::Broadcast);
        assert_eq!(route(&json!({"channel": ""})), Route::Broadcast);
        assert_eq!(route(&json!({"channel": false})), Route::Broadcast);
        assert_eq!(route(&json!({"channel": 0})), Route::Broadcast);
        assert_eq!(route(&json!({"channel": 5})), Route::Nobody);
        assert_eq!(route(&json!({"channel": {"a": 1}})), Route::Nobody);
        assert_eq!(route(&json!("plain text")), Route::Broadcast);
    }

    #[test]
    fn test_control_frame_encoding() {
        let v: JsonValue = serde_json::from_str(&ControlFrame::subscribe("symbol:IBM").encode()).unwrap();
        assert_eq!(v, json!({"type": "subscribe", "channel": "symbol:IBM"}));
        assert_eq!(decode_frame("not json"), json!("not json"));
        assert_eq!(decode_frame("{\"a\":1}"), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_handlers_share_one_subscription() {
        let (mgr, mut accepted) = manager(0);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let a = mgr.subscribe(URL, "symbol:IBM", recorder("a", &tx));
        let mut server = accept(&mut accepted).await;
        assert_eq!(server.recv().await, json!({"type": "subscribe", "channel": "symbol:IBM"}));

        let b = mgr.subscribe(URL, "symbol:IBM", recorder("b", &tx));
        server.assert_silent().await;
        assert_eq!(mgr.connection_count(), 1);

        server.push(r#"{"channel":"symbol:IBM","price":101.5}"#);
        let mut tags = vec![next(&mut rx).await.0, next(&mut rx).await.0];
        tags.sort();
        assert_eq!(tags, vec!["a", "b"]);

        a.unsubscribe();
        server.assert_silent().await;
        server.push(r#"{"channel":"symbol:IBM","price":102}"#);
        assert_eq!(next(&mut rx).await, ("b", json!({"channel": "symbol:IBM", "price": 102})));

        b.unsubscribe();
        assert_eq!(server.recv().await, json!({"type": "unsubscribe", "channel": "symbol:IBM"}));
        server.assert_silent().await;
        mgr.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_and_unroutable_frames() {
        let (mgr, mut accepted) = manager(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _a = mgr.subscribe(URL, "symbol:A", recorder("a", &tx));
        let _b = mgr.subscribe(URL, "symbol:B", recorder("b", &tx));
        let mut server = accept(&mut accepted).await;
        server.recv().await;
        server.recv().await;

        server.push(r#"{"channel":7,"price":1}"#);
        server.push(r#"{"channel":"","price":2}"#);
        let mut got = vec![next(&mut rx).await, next(&mut rx).await];
        got.sort_by_key(|(tag, _)| *tag);
        assert_eq!(got[0], ("a", json!({"channel": "", "price": 2})));
        assert_eq!(got[1], ("b", json!({"channel": "", "price": 2})));

        server.push(r#"{"channel":"symbol:B","price":3}"#);
        assert_eq!(next(&mut rx).await.0, "b");

        server.push("heartbeat");
        let mut raw = vec![next(&mut rx).await, next(&mut rx).await];
        raw.sort_by_key(|(tag, _)| *tag);
        assert_eq!(raw[0], ("a", json!("heartbeat")));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_delivery() {
        let (mgr, mut accepted) = manager(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _bad = mgr.subscribe(URL, "c", handler(|_| Err(anyhow::anyhow!("boom"))));
        let _panics = mgr.subscribe(URL, "c", handler(|_| panic!("handler panic")));
        let _good = mgr.subscribe(URL, "c", recorder("good", &tx));
        let mut server = accept(&mut accepted).await;
        server.recv().await;

        server.push(r#"{"channel":"c","value":1}"#);
        server.push(r#"{"channel":"c","value":2}"#);
        assert_eq!(next(&mut rx).await.1["value"], json!(1));
        assert_eq!(next(&mut rx).await.1["value"], json!(2));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let (mgr, mut accepted) = manager(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = mgr.subscribe(URL, "symbol:IBM", recorder("a", &tx));

        let mut first = accept(&mut accepted).await;
        assert_eq!(first.recv().await["type"], json!("subscribe"));
        assert!(mgr.is_connected(URL));
        drop(first);

        let mut second = accept(&mut accepted).await;
        assert_eq!(second.recv().await, json!({"type": "subscribe", "channel": "symbol:IBM"}));
        second.push(r#"{"channel":"symbol:IBM","last":7}"#);
        assert_eq!(next(&mut rx).await.1["last"], json!(7));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (mgr, mut accepted) = manager(0);
        let _sub = mgr.subscribe(URL, "x", handler(|_| Ok(())));
        let mut server = accept(&mut accepted).await;
        server.recv().await;

        mgr.shutdown();
        assert!(!mgr.is_connected(URL));
        assert_eq!(mgr.connection_count(), 0);
        assert!(timeout(WAIT, server.from_client.recv()).await.unwrap().is_none());
    }
}
