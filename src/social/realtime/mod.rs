//! 实时变更通道接缝
//!
//! `Changefeed::subscribe` 返回一个 `Subscription`，drop 时自动取消订阅；
//! 视图模型通过 `ChannelTask` 持有订阅与处理任务，二者生命周期绑定。

pub mod payload;
pub mod socket;

pub use payload::{Change, ChangeEvent, ChangeKind, RawChange};
pub use socket::RealtimeSocket;

use crate::social::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// 订阅哪些事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(ChangeKind),
}

/// 订阅条件：表 + 事件类型 + 可选的等值过滤
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub event: EventFilter,
    pub schema: String,
    pub table: String,
    /// `(列名, 值)`，对应 `列名=eq.值`
    pub filter: Option<(String, String)>,
}

impl ChangeFilter {
    pub fn table(table: &str) -> Self {
        Self {
            event: EventFilter::All,
            schema: "public".to_string(),
            table: table.to_string(),
            filter: None,
        }
    }

    pub fn on(mut self, kind: ChangeKind) -> Self {
        self.event = EventFilter::Only(kind);
        self
    }

    pub fn where_eq(mut self, column: &str, value: &str) -> Self {
        self.filter = Some((column.to_string(), value.to_string()));
        self
    }

    pub fn event_name(&self) -> &'static str {
        match self.event {
            EventFilter::All => "*",
            EventFilter::Only(kind) => kind.as_str(),
        }
    }

    /// 过滤表达式，例如 `receiver_id=eq.u1`
    pub fn filter_expr(&self) -> Option<String> {
        self.filter
            .as_ref()
            .map(|(column, value)| format!("{}=eq.{}", column, value))
    }

    pub fn accepts(&self, raw: &RawChange) -> bool {
        if raw.table != self.table {
            return false;
        }
        if !raw.schema.is_empty() && raw.schema != self.schema {
            return false;
        }
        if let EventFilter::Only(kind) = self.event {
            if raw.kind != kind {
                return false;
            }
        }
        match &self.filter {
            None => true,
            Some((column, expected)) => match raw.record().get(column) {
                Some(Value::String(s)) => s == expected,
                Some(other) => other.to_string() == *expected,
                None => false,
            },
        }
    }
}

/// 由变更流实现提供的取消订阅能力
pub trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

/// 订阅凭据，drop 时取消订阅
pub struct SubscriptionGuard {
    id: u64,
    channel: String,
    owner: Arc<dyn Unsubscribe>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        debug!("[Realtime] 取消订阅通道: {} (#{})", self.channel, self.id);
        self.owner.unsubscribe(self.id);
    }
}

/// 一次实时订阅
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(
        id: u64,
        channel: &str,
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        owner: Arc<dyn Unsubscribe>,
    ) -> Self {
        Self {
            events,
            guard: SubscriptionGuard {
                id,
                channel: channel.to_string(),
                owner,
            },
        }
    }

    pub fn channel(&self) -> &str {
        &self.guard.channel
    }

    /// 下一个事件；通道关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// 非阻塞读取，没有待处理事件时返回 `None`
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChangeEvent>, SubscriptionGuard) {
        (self.events, self.guard)
    }
}

#[async_trait]
pub trait Changefeed: Send + Sync {
    /// 订阅指定通道；返回前订阅已生效
    async fn subscribe(&self, channel: &str, filter: ChangeFilter)
        -> Result<Subscription, StoreError>;
}

/// 视图持有的通道任务：drop 时立即取消订阅并中止事件处理
pub struct ChannelTask {
    guard: SubscriptionGuard,
    handle: JoinHandle<()>,
}

impl ChannelTask {
    /// 逐个处理事件；处理函数返回 `false` 时停止
    pub fn spawn<F, Fut>(subscription: Subscription, mut handler: F) -> Self
    where
        F: FnMut(ChangeEvent) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (mut events, guard) = subscription.into_parts();
        let channel = guard.channel.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !handler(event).await {
                    break;
                }
            }
            debug!("[Realtime] 通道任务结束: {}", channel);
        });
        Self { guard, handle }
    }

    pub fn channel(&self) -> &str {
        &self.guard.channel
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ChannelTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 后台任务句柄，drop 时中止
pub struct AbortOnDrop(pub JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
