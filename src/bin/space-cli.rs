//! Space Community CLI
//!
//! 非交互式 CLI，用于演示和观察客户端行为：
//! - `demo`：在进程内后端上跑一遍 好友申请 → 私信 → 已读 → 点赞 的完整流程
//! - `watch`：登录托管后端，输出所有监听器回调

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use space_community_sdk::social::conversation::{ConversationListener, Message};
use space_community_sdk::social::feed::{Comment, FeedListener, Post, PostDraft};
use space_community_sdk::social::friend::{Friend, FriendListener, PendingRequest};
use space_community_sdk::social::notification::{NotificationListener, NotificationSnapshot};
use space_community_sdk::social::session::{Identity, Registration, SessionListener};
use space_community_sdk::{ClientConfig, MemoryBackend, SocialClient};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Space Community CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "space-cli")]
#[command(about = "Space Community CLI - 演示好友、私信、通知与社区动态", long_about = None)]
struct Args {
    /// 日志级别（默认: info,space_community_sdk=debug）
    #[arg(long, default_value = "info,space_community_sdk=debug", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在进程内后端上演示完整流程
    Demo,
    /// 登录托管后端（SUPABASE_URL / SUPABASE_ANON_KEY）并输出实时回调
    Watch {
        #[arg(short, long)]
        email: String,

        #[arg(short, long)]
        password: String,

        /// 运行时长（秒），0 表示持续运行
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .context("无法创建日志文件 debug.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
    Ok(())
}

/// 把所有回调输出到日志，`who` 用于区分演示中的多个客户端
struct CliListener {
    who: String,
}

#[async_trait]
impl SessionListener for CliListener {
    async fn on_identity_changed(&self, identity: Option<Identity>) {
        match identity {
            Some(identity) => info!(
                "[CLI/{}] 🪪 当前身份: {} ({})",
                self.who, identity.handle, identity.role
            ),
            None => info!("[CLI/{}] 🪪 已登出", self.who),
        }
    }
}

#[async_trait]
impl NotificationListener for CliListener {
    async fn on_notifications_changed(&self, snapshot: NotificationSnapshot) {
        for n in snapshot.notifications.iter().take(3) {
            info!(
                "[CLI/{}] 🔔 {} | {} | {}",
                self.who,
                n.title,
                n.content,
                if n.is_read { "已读" } else { "未读" }
            );
        }
    }

    async fn on_unread_count_changed(&self, unread_count: usize) {
        info!("[CLI/{}] 📬 未读通知: {}", self.who, unread_count);
    }
}

#[async_trait]
impl FriendListener for CliListener {
    async fn on_friend_list_changed(&self, friends: Vec<Friend>) {
        let summary: Vec<String> = friends
            .iter()
            .map(|f| format!("{}({})", f.handle, f.unread_count))
            .collect();
        info!("[CLI/{}] 👥 好友: [{}]", self.who, summary.join(", "));
    }

    async fn on_friend_request_list_changed(&self, requests: Vec<PendingRequest>) {
        for r in &requests {
            info!("[CLI/{}] 📝 待处理申请: {} ({})", self.who, r.sender.handle, r.request.id);
        }
    }

    async fn on_selected_peer_removed(&self, peer_id: String) {
        warn!("[CLI/{}] ⚠️ 聊天对象已解除好友关系: {}", self.who, peer_id);
    }
}

#[async_trait]
impl ConversationListener for CliListener {
    async fn on_messages_changed(&self, peer_id: String, messages: Vec<Message>) {
        info!("[CLI/{}] 💬 与 {} 的会话: {} 条", self.who, peer_id, messages.len());
    }

    async fn on_new_message(&self, message: Message) {
        info!("[CLI/{}] 📨 新私信: {}", self.who, message.content);
    }
}

#[async_trait]
impl FeedListener for CliListener {
    async fn on_posts_changed(&self, posts: Vec<Post>) {
        for p in posts.iter().take(3) {
            info!(
                "[CLI/{}] 🚀 {} ❤️{} 💬{} | {}",
                self.who, p.author_handle, p.likes, p.comments, p.content
            );
        }
    }

    async fn on_comments_changed(&self, post_id: String, comments: Vec<Comment>) {
        info!("[CLI/{}] 💭 帖子 {} 的评论: {} 条", self.who, post_id, comments.len());
    }
}

fn client_with_listeners(
    config: ClientConfig,
    who: &str,
    backend: Option<&Arc<MemoryBackend>>,
) -> Result<SocialClient> {
    let mut client = match backend {
        Some(memory) => SocialClient::new(config, memory.backend()),
        None => SocialClient::connect(config)?,
    };
    let listener = Arc::new(CliListener { who: who.to_string() });
    client.set_session_listener(listener.clone());
    client.set_notification_listener(listener.clone());
    client.set_friend_listener(listener.clone());
    client.set_conversation_listener(listener.clone());
    client.set_feed_listener(listener);
    Ok(client)
}

fn registration(name: &str, handle: &str, email: &str) -> Registration {
    Registration {
        email: email.to_string(),
        password: "orbit42".to_string(),
        name: name.to_string(),
        handle: handle.to_string(),
        bio: "Explorando el cosmos".to_string(),
        avatar: format!("https://api.dicebear.com/7.x/bottts/svg?seed={}", handle),
        role: String::new(),
    }
}

async fn run_demo() -> Result<()> {
    let memory = MemoryBackend::new();
    let nova_client = client_with_listeners(ClientConfig::local(), "nova", Some(&memory))?;
    let luna_client = client_with_listeners(ClientConfig::local(), "luna", Some(&memory))?;

    info!("[CLI] 📝 注册两个用户");
    let nova = nova_client
        .register(registration("Nova", "nova", "nova@space.io"))
        .await?;
    let luna = luna_client
        .register(registration("Luna", "luna", "luna@space.io"))
        .await?;

    info!("[CLI] 🤝 nova 发送好友申请");
    nova.friends.send_request(&luna.identity.id).await?;
    sleep(Duration::from_millis(100)).await;
    let request = luna
        .friends
        .requests()
        .into_iter()
        .next()
        .context("luna 没有收到好友申请")?;
    luna.friends.accept_request(&request.request.id).await?;

    info!("[CLI] 💬 nova 打开会话并发送私信");
    nova.conversation.open(&luna.identity.id).await?;
    nova.conversation.send("¿Viste el lanzamiento de anoche?").await?;
    nova.conversation.send("¡Fue espectacular!").await?;
    sleep(Duration::from_millis(100)).await;
    info!("[CLI] 📬 luna 的未读通知: {}", luna.notifications.unread_count());

    info!("[CLI] 📖 luna 打开会话");
    luna.conversation.open(&nova.identity.id).await?;
    info!("[CLI] 📬 luna 的未读通知: {}", luna.notifications.unread_count());

    info!("[CLI] 🚀 luna 发帖，nova 点赞");
    let post = luna
        .feed
        .publish(PostDraft {
            content: "Mañana despega Artemis".to_string(),
            ..PostDraft::default()
        })
        .await?;
    nova.feed.fetch_posts().await?;
    let outcome = nova.feed.toggle_like(&post.id).await?;
    info!("[CLI] ❤️ 点赞结果: {:?}", outcome);
    nova.feed.add_comment(&post.id, "¡Allí estaré!").await?;

    sleep(Duration::from_millis(100)).await;
    nova_client.sign_out().await?;
    luna_client.sign_out().await?;
    info!("[CLI] ✅ 演示结束，剩余订阅: {}", memory.subscriber_count());
    Ok(())
}

async fn run_watch(email: &str, password: &str, duration: u64) -> Result<()> {
    let config = ClientConfig::from_env()?;
    info!("[CLI] 🌐 托管后端: {}", config.supabase_url);
    let client = client_with_listeners(config, "watch", None)?;

    info!("[CLI] 🔐 正在登录...");
    let active = client.sign_in(email, password).await?;
    info!(
        "[CLI] ✅ 登录成功！{} ({})，未读通知: {}，好友: {}",
        active.identity.handle,
        active.identity.id,
        active.notifications.unread_count(),
        active.friends.friends().len()
    );

    info!("[CLI] 📥 开始监听实时事件...");
    if duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", duration);
        sleep(Duration::from_secs(duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        tokio::signal::ctrl_c().await.context("等待 Ctrl+C 失败")?;
    }

    client.sign_out().await?;
    info!("[CLI] 👋 程序退出");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;

    match args.command {
        Command::Demo => run_demo().await,
        Command::Watch {
            email,
            password,
            duration,
        } => run_watch(&email, &password, duration).await,
    }
}
