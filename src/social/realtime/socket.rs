//! 托管实时服务的 WebSocket 实现（Phoenix channel 协议）
//!
//! 每个订阅对应一个 topic `realtime:{channel}`：发送 `phx_join` 并等待 `phx_reply`，
//! 之后服务端推送的 `postgres_changes` 按 topic 路由给订阅者；订阅 drop 时发送 `phx_leave`。
//! 连接在第一次订阅时建立，断开后下一次订阅会重连。
//! 会话刷新出新的 JWT 后，通过 `access_token` 事件推给所有已加入的 topic。

use crate::social::config::ClientConfig;
use crate::social::error::StoreError;
use crate::social::realtime::{
    AbortOnDrop, ChangeEvent, ChangeFilter, Changefeed, RawChange, Subscription, Unsubscribe,
};
use crate::social::session::auth::AuthSession;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const PHOENIX_TOPIC: &str = "phoenix";

/// Phoenix 协议帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
        }
    }

    fn to_ws(&self) -> Option<WsMessage> {
        match serde_json::to_string(self) {
            Ok(text) => Some(WsMessage::Text(text)),
            Err(e) => {
                error!("[Realtime] 序列化 Phoenix 帧失败: {}", e);
                None
            }
        }
    }

    /// 从推送帧中取出行变更（新旧两种推送格式）
    pub fn into_change(self) -> Option<RawChange> {
        let data = match self.event.as_str() {
            "postgres_changes" => self.payload.get("data")?.clone(),
            "INSERT" | "UPDATE" | "DELETE" => self.payload,
            _ => return None,
        };
        match serde_json::from_value(data) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("[Realtime] ⚠️ 无法解析变更载荷: {}", e);
                None
            }
        }
    }
}

/// 加入频道时的载荷
pub fn join_payload(filter: &ChangeFilter, access_token: &str) -> Value {
    let mut change = json!({
        "event": filter.event_name(),
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(expr) = filter.filter_expr() {
        change["filter"] = Value::String(expr);
    }
    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        },
        "access_token": access_token,
    })
}

struct Route {
    topic: String,
    filter: ChangeFilter,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

type JoinReply = oneshot::Sender<Result<(), String>>;

/// 连接内共享的路由表
#[derive(Default)]
struct ChannelRegistry {
    routes: Mutex<HashMap<u64, Route>>,
    pending_joins: Mutex<HashMap<String, JoinReply>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    next_ref: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChannelRegistry {
    fn next_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn send(&self, message: PhoenixMessage) -> bool {
        let Some(frame) = message.to_ws() else {
            return false;
        };
        match locked(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        locked(&self.outbound)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// 发送 `phx_join` 并等待对应的 `phx_reply`；超时后移除等待项
    async fn join(&self, topic: &str, payload: Value, timeout: Duration) -> Result<(), StoreError> {
        let join_ref = self.next_ref();
        let (reply_tx, reply_rx) = oneshot::channel();
        locked(&self.pending_joins).insert(join_ref.clone(), reply_tx);
        self.send(PhoenixMessage::new(topic, "phx_join", payload, join_ref.clone()));

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(StoreError::Channel(format!(
                "加入频道 {} 被拒绝: {}",
                topic, reason
            ))),
            Ok(Err(_)) => Err(StoreError::Channel(format!("加入频道 {} 时连接断开", topic))),
            Err(_) => {
                locked(&self.pending_joins).remove(&join_ref);
                Err(StoreError::Timeout(format!("加入频道 {}", topic)))
            }
        }
    }

    /// 把新的 JWT 推给每个已加入的 topic，返回推送的 topic 数
    fn push_access_token(&self, token: &str) -> usize {
        let topics: BTreeSet<String> = locked(&self.routes)
            .values()
            .map(|route| route.topic.clone())
            .collect();
        topics
            .iter()
            .filter(|topic| {
                let message = PhoenixMessage::new(
                    topic,
                    "access_token",
                    json!({ "access_token": token }),
                    self.next_ref(),
                );
                self.send(message)
            })
            .count()
    }

    fn dispatch(&self, message: PhoenixMessage) {
        match message.event.as_str() {
            "phx_reply" => {
                let Some(reference) = message.reference.clone() else {
                    return;
                };
                if let Some(reply) = locked(&self.pending_joins).remove(&reference) {
                    let status = message
                        .payload
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("error");
                    let result = if status == "ok" {
                        Ok(())
                    } else {
                        Err(message.payload.get("response").cloned().unwrap_or_default().to_string())
                    };
                    let _ = reply.send(result);
                }
            }
            "phx_error" | "phx_close" => {
                warn!("[Realtime] ⚠️ 频道 {} 收到 {}", message.topic, message.event);
            }
            "system" | "presence_state" | "presence_diff" => {
                debug!("[Realtime] {} {}: {}", message.topic, message.event, message.payload);
            }
            _ => {
                let topic = message.topic.clone();
                let Some(raw) = message.into_change() else {
                    return;
                };
                let targets: Vec<_> = locked(&self.routes)
                    .values()
                    .filter(|route| route.topic == topic && route.filter.accepts(&raw))
                    .map(|route| route.sender.clone())
                    .collect();
                if targets.is_empty() {
                    return;
                }
                match ChangeEvent::try_from(raw) {
                    Ok(event) => {
                        for tx in targets {
                            let _ = tx.send(event.clone());
                        }
                    }
                    Err(e) => warn!("[Realtime] ⚠️ 丢弃无法解析的变更 ({}): {}", topic, e),
                }
            }
        }
    }

    /// 连接断开：关闭所有订阅，调用方的视图退化为打开时拉取
    fn disconnect(&self) {
        locked(&self.outbound).take();
        locked(&self.pending_joins).clear();
        let dropped = std::mem::take(&mut *locked(&self.routes));
        if !dropped.is_empty() {
            warn!("[Realtime] 🔌 连接断开，关闭 {} 个订阅", dropped.len());
        }
    }
}

impl Unsubscribe for ChannelRegistry {
    fn unsubscribe(&self, id: u64) {
        let Some(route) = locked(&self.routes).remove(&id) else {
            return;
        };
        let still_used = locked(&self.routes)
            .values()
            .any(|other| other.topic == route.topic);
        if !still_used {
            let leave = PhoenixMessage::new(&route.topic, "phx_leave", json!({}), self.next_ref());
            self.send(leave);
        }
    }
}

/// 托管实时服务客户端
pub struct RealtimeSocket {
    url: String,
    anon_key: String,
    heartbeat: Duration,
    join_timeout: Duration,
    session: watch::Receiver<Option<AuthSession>>,
    registry: Arc<ChannelRegistry>,
    next_id: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    token_watcher: Mutex<Option<AbortOnDrop>>,
}

impl RealtimeSocket {
    pub fn new(config: &ClientConfig, session: watch::Receiver<Option<AuthSession>>) -> Self {
        Self {
            url: config.realtime_url(),
            anon_key: config.anon_key.clone(),
            heartbeat: config.heartbeat_interval,
            join_timeout: config.join_timeout,
            session,
            registry: Arc::new(ChannelRegistry::default()),
            next_id: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            token_watcher: Mutex::new(None),
        }
    }

    fn access_token(&self) -> String {
        self.session
            .borrow()
            .as_ref()
            .map(|s| s.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    async fn ensure_connected(&self) -> Result<(), StoreError> {
        let _guard = self.connect_lock.lock().await;
        if self.registry.is_connected() {
            return Ok(());
        }

        info!("[Realtime] 🔗 连接实时服务");
        let (ws_stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| StoreError::Channel(format!("WebSocket 连接失败: {}", e)))?;
        info!("[Realtime] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&self.registry.outbound) = Some(tx);

        tokio::spawn(write_loop(write, rx));

        // 启动心跳
        let registry = self.registry.clone();
        let period = self.heartbeat;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let heartbeat =
                    PhoenixMessage::new(PHOENIX_TOPIC, "heartbeat", json!({}), registry.next_ref());
                if !registry.send(heartbeat) {
                    break;
                }
            }
        });

        // 替换旧连接的监听任务
        let watcher = spawn_token_refresh(self.registry.clone(), self.session.clone());
        *locked(&self.token_watcher) = Some(AbortOnDrop(watcher));

        let registry = self.registry.clone();
        tokio::spawn(async move {
            handle_messages(read, &registry).await;
            registry.disconnect();
        });
        Ok(())
    }
}

/// 监听会话变化，把刷新后的 JWT 推给已加入的频道；连接断开后退出
fn spawn_token_refresh(
    registry: Arc<ChannelRegistry>,
    mut session: watch::Receiver<Option<AuthSession>>,
) -> JoinHandle<()> {
    session.borrow_and_update();
    tokio::spawn(async move {
        while session.changed().await.is_ok() {
            let token = session
                .borrow_and_update()
                .as_ref()
                .map(|s| s.access_token.clone());
            // 登出时订阅由各视图拆除
            let Some(token) = token else {
                continue;
            };
            if !registry.is_connected() {
                break;
            }
            let topics = registry.push_access_token(&token);
            debug!("[Realtime] 🔑 已向 {} 个频道推送新的访问令牌", topics);
        }
    })
}

async fn write_loop(mut write: WsWriter, mut rx: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.send(frame).await {
            error!("[Realtime] 发送失败: {}", e);
            break;
        }
    }
    let _ = write.close().await;
}

/// 处理接收消息（事件循环）
async fn handle_messages(mut read: WsReader, registry: &ChannelRegistry) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                Ok(message) => registry.dispatch(message),
                Err(e) => warn!("[Realtime] 无法解析的帧: {} ({})", text, e),
            },
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Close(frame)) => {
                warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                break;
            }
            Err(e) => {
                error!("[Realtime] WebSocket 错误: {}", e);
                break;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Changefeed for RealtimeSocket {
    async fn subscribe(
        &self,
        channel: &str,
        filter: ChangeFilter,
    ) -> Result<Subscription, StoreError> {
        self.ensure_connected().await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let topic = format!("realtime:{}", channel);
        let (tx, rx) = mpsc::unbounded_channel();
        let payload = join_payload(&filter, &self.access_token());
        locked(&self.registry.routes).insert(
            id,
            Route {
                topic: topic.clone(),
                filter,
                sender: tx,
            },
        );

        info!("[Realtime] 📡 加入频道: {}", topic);
        let subscription = Subscription::new(id, channel, rx, self.registry.clone());
        self.registry
            .join(&topic, payload, self.join_timeout)
            .await?;
        debug!("[Realtime] ✅ 已加入频道: {}", topic);
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::realtime::ChangeKind;
    use crate::social::session::auth::AuthUser;

    #[test]
    fn test_join_payload() {
        let filter = ChangeFilter::table("messages")
            .on(ChangeKind::Insert)
            .where_eq("receiver_id", "u1");
        let payload = join_payload(&filter, "jwt");
        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["event"], "INSERT");
        assert_eq!(change["table"], "messages");
        assert_eq!(change["filter"], "receiver_id=eq.u1");
        assert_eq!(payload["access_token"], "jwt");

        let all = join_payload(&ChangeFilter::table("friend_requests"), "jwt");
        assert!(all["config"]["postgres_changes"][0].get("filter").is_none());
    }

    #[test]
    fn test_postgres_changes_frame() {
        let frame: PhoenixMessage = serde_json::from_str(
            r#"{"topic":"realtime:chat_room:u2","event":"postgres_changes","ref":null,
                "payload":{"ids":[1],"data":{"schema":"public","table":"messages","type":"INSERT",
                "commit_timestamp":"2024-05-01T10:00:00Z","columns":[],
                "record":{"id":"m1","sender_id":"u2","receiver_id":"u1","content":"hola","is_read":false,"created_at":"2024-05-01T10:00:00Z"},
                "old_record":null,"errors":null}}}"#,
        )
        .unwrap();
        let raw = frame.into_change().unwrap();
        assert_eq!(raw.kind, ChangeKind::Insert);
        assert_eq!(raw.record()["content"], "hola");
    }

    #[test]
    fn test_reply_routing() {
        let registry = ChannelRegistry::default();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        locked(&registry.pending_joins).insert("7".into(), reply_tx);
        registry.dispatch(PhoenixMessage {
            topic: "realtime:x".into(),
            event: "phx_reply".into(),
            payload: json!({"status": "error", "response": {"reason": "unauthorized"}}),
            reference: Some("7".into()),
        });
        let result = reply_rx.try_recv().unwrap();
        assert!(result.unwrap_err().contains("unauthorized"));
    }

    #[tokio::test]
    async fn test_changes_routed_by_topic() {
        let registry = Arc::new(ChannelRegistry::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        locked(&registry.routes).insert(
            1,
            Route {
                topic: "realtime:notifications:u1".into(),
                filter: ChangeFilter::table("notifications").where_eq("user_id", "u1"),
                sender: tx,
            },
        );
        let frame = |topic: &str| PhoenixMessage {
            topic: topic.into(),
            event: "postgres_changes".into(),
            payload: json!({"data": {"schema": "public", "table": "notifications", "type": "INSERT",
                "record": {"id": "n1", "user_id": "u1", "type": "message", "is_read": false}}}),
            reference: None,
        };
        registry.dispatch(frame("realtime:other"));
        registry.dispatch(frame("realtime:notifications:u1"));
        assert!(matches!(rx.recv().await, Some(ChangeEvent::Notification(_))));
        assert!(rx.try_recv().is_err());

        let subscription = Subscription::new(1, "notifications:u1", mpsc::unbounded_channel().1, registry.clone());
        drop(subscription);
        assert!(locked(&registry.routes).is_empty());
    }

    fn connected_registry() -> (Arc<ChannelRegistry>, mpsc::UnboundedReceiver<WsMessage>) {
        let registry = Arc::new(ChannelRegistry::default());
        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&registry.outbound) = Some(tx);
        (registry, rx)
    }

    fn add_route(registry: &ChannelRegistry, id: u64, topic: &str) {
        locked(&registry.routes).insert(
            id,
            Route {
                topic: topic.into(),
                filter: ChangeFilter::table("messages"),
                sender: mpsc::unbounded_channel().0,
            },
        );
    }

    fn frame(message: WsMessage) -> PhoenixMessage {
        match message {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_timeout_clears_pending() {
        let (registry, mut outbound) = connected_registry();
        let err = registry
            .join("realtime:chat_room:u2", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(locked(&registry.pending_joins).is_empty());
        assert_eq!(frame(outbound.recv().await.unwrap()).event, "phx_join");
    }

    #[tokio::test]
    async fn test_refreshed_token_reaches_joined_topics() {
        let (registry, mut outbound) = connected_registry();
        add_route(&registry, 1, "realtime:notifications:u1");
        add_route(&registry, 2, "realtime:notifications:u1");
        add_route(&registry, 3, "realtime:friendship:u1");

        let (session_tx, session_rx) = watch::channel(None);
        let watcher = spawn_token_refresh(registry.clone(), session_rx);
        let session = |token: &str| AuthSession {
            access_token: token.into(),
            refresh_token: "r".into(),
            expires_at: None,
            user: AuthUser {
                id: "u1".into(),
                email: "u1@space.io".into(),
            },
        };
        session_tx.send(Some(session("jwt-2"))).unwrap();

        let mut topics = BTreeSet::new();
        for _ in 0..2 {
            let pushed = tokio::time::timeout(Duration::from_secs(1), outbound.recv())
                .await
                .unwrap()
                .map(frame)
                .unwrap();
            assert_eq!(pushed.event, "access_token");
            assert_eq!(pushed.payload["access_token"], "jwt-2");
            topics.insert(pushed.topic);
        }
        assert_eq!(
            topics.into_iter().collect::<Vec<_>>(),
            vec!["realtime:friendship:u1", "realtime:notifications:u1"]
        );

        // 连接断开后监听任务退出
        registry.disconnect();
        session_tx.send(Some(session("jwt-3"))).unwrap();
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }
}
