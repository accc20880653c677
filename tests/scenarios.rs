//! 端到端场景：两个客户端共享同一个进程内后端

use space_community_sdk::social::error::{social_error, SocialError};
use space_community_sdk::social::feed::{LikeOutcome, PostDraft};
use space_community_sdk::social::friend::Relationship;
use space_community_sdk::social::memory::StoreOp;
use space_community_sdk::social::session::Registration;
use space_community_sdk::social::store::{rpc, tables, Query};
use space_community_sdk::{ActiveSession, ClientConfig, MemoryBackend, SocialClient};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .with_test_writer()
            .try_init();
    });
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn registration(handle: &str) -> Registration {
    Registration {
        email: format!("{}@space.io", handle),
        password: "orbit42".into(),
        name: handle.to_uppercase(),
        handle: handle.into(),
        bio: "Explorando el cosmos".into(),
        avatar: format!("https://cdn.space/{}.png", handle),
        role: String::new(),
    }
}

async fn two_users() -> (
    Arc<MemoryBackend>,
    (SocialClient, ActiveSession),
    (SocialClient, ActiveSession),
) {
    init_logger();
    let memory = MemoryBackend::new();
    let nova_client = SocialClient::new(ClientConfig::local(), memory.backend());
    let luna_client = SocialClient::new(ClientConfig::local(), memory.backend());
    let nova = nova_client.register(registration("nova")).await.unwrap();
    let luna = luna_client.register(registration("luna")).await.unwrap();
    (memory, (nova_client, nova), (luna_client, luna))
}

async fn befriend(nova: &ActiveSession, luna: &ActiveSession) {
    nova.friends.send_request(&luna.identity.id).await.unwrap();
    assert!(wait_until(|| luna.friends.requests().len() == 1).await);
    let request = luna.friends.requests()[0].request.id.clone();
    luna.friends.accept_request(&request).await.unwrap();
    assert!(wait_until(|| nova.friends.friends().len() == 1).await);
}

#[tokio::test]
async fn friendship_then_conversation_keeps_badges_consistent() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    befriend(&nova, &luna).await;

    // 接受通知送达发起方
    assert!(wait_until(|| nova.notifications.unread_count() == 1).await);
    assert_eq!(
        nova.friends.relationship_with(&luna.identity.id).await.unwrap(),
        Relationship::Accepted
    );

    nova.conversation.open(&luna.identity.id).await.unwrap();
    nova.conversation.send("¿Viste el lanzamiento?").await.unwrap();
    nova.conversation.send("¡Increíble!").await.unwrap();
    assert_eq!(nova.conversation.messages().len(), 2);

    // 好友申请通知 + 两条私信通知
    assert!(wait_until(|| luna.notifications.unread_count() == 3).await);
    assert!(wait_until(|| {
        luna.friends
            .friends()
            .first()
            .is_some_and(|f| f.unread_count == 2)
    })
    .await);

    let thread = luna.conversation.open(&nova.identity.id).await.unwrap();
    assert_eq!(thread.len(), 2);
    assert_eq!(luna.notifications.unread_count(), 1);
    assert_eq!(luna.friends.friends()[0].unread_count, 0);
    let unread = Query::new()
        .eq("receiver_id", luna.identity.id.as_str())
        .eq("is_read", false);
    assert_eq!(memory.count(tables::MESSAGES, &unread), 0);
}

#[tokio::test]
async fn open_conversation_receives_messages_live() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    befriend(&nova, &luna).await;
    luna.conversation.open(&nova.identity.id).await.unwrap();

    nova.conversation
        .send_direct(&luna.identity.id, "Houston, ¿me copias?")
        .await
        .unwrap();
    assert!(wait_until(|| luna.conversation.messages().len() == 1).await);
    assert_eq!(luna.conversation.messages()[0].content, "Houston, ¿me copias?");

    // 打开的会话里收到的私信立即标记已读，徽标保持为 0
    let unread = Query::new()
        .eq("receiver_id", luna.identity.id.as_str())
        .eq("is_read", false);
    assert!(wait_until(|| memory.count(tables::MESSAGES, &unread) == 0).await);
    assert!(wait_until(|| {
        luna.friends
            .friends()
            .first()
            .is_some_and(|f| f.unread_count == 0)
    })
    .await);
}

#[tokio::test]
async fn pair_has_at_most_one_relationship_row() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    nova.friends.send_request(&luna.identity.id).await.unwrap();

    let reverse = luna
        .friends
        .send_request(&nova.identity.id)
        .await
        .unwrap_err();
    assert_eq!(social_error(&reverse), Some(&SocialError::Conflict));

    let pair = Query::new().pair(
        "sender_id",
        "receiver_id",
        &nova.identity.id,
        &luna.identity.id,
    );
    assert_eq!(memory.count(tables::FRIEND_REQUESTS, &pair), 1);
}

#[tokio::test]
async fn rejected_request_can_be_sent_again() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    nova.friends.send_request(&luna.identity.id).await.unwrap();
    assert!(wait_until(|| luna.friends.requests().len() == 1).await);

    let request = luna.friends.requests()[0].request.id.clone();
    let by_sender = nova.friends.accept_request(&request).await.unwrap_err();
    assert!(matches!(
        social_error(&by_sender),
        Some(SocialError::Forbidden(_))
    ));

    luna.friends.reject_request(&request).await.unwrap();
    assert!(luna.friends.requests().is_empty());
    assert!(memory.rows(tables::FRIEND_REQUESTS).is_empty());

    nova.friends.send_request(&luna.identity.id).await.unwrap();
    assert!(wait_until(|| luna.friends.requests().len() == 1).await);
}

#[tokio::test]
async fn likes_are_counted_once_and_roll_back() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    let post = luna
        .feed
        .publish(PostDraft {
            content: "Mañana despega Artemis".into(),
            ..PostDraft::default()
        })
        .await
        .unwrap();
    nova.feed.fetch_posts().await.unwrap();

    assert_eq!(nova.feed.toggle_like(&post.id).await.unwrap(), LikeOutcome::Liked);
    assert_eq!(nova.feed.like_post(&post.id).await.unwrap(), LikeOutcome::AlreadyLiked);
    luna.feed.fetch_posts().await.unwrap();
    assert_eq!(luna.feed.post(&post.id).unwrap().likes, 1);

    memory.fail_next(StoreOp::Rpc, rpc::DECREMENT_LIKES);
    assert!(nova.feed.toggle_like(&post.id).await.is_err());
    assert!(nova.feed.is_liked(&post.id));
    assert_eq!(nova.feed.post(&post.id).unwrap().likes, 1);
    assert_eq!(memory.rows(tables::POST_LIKES).len(), 1);

    assert_eq!(nova.feed.toggle_like(&post.id).await.unwrap(), LikeOutcome::Unliked);
    luna.feed.fetch_posts().await.unwrap();
    assert_eq!(luna.feed.post(&post.id).unwrap().likes, 0);
}

#[tokio::test]
async fn clearing_notifications_rolls_back_on_failure() {
    let (memory, (_nc, nova), (_lc, luna)) = two_users().await;
    nova.friends.send_request(&luna.identity.id).await.unwrap();
    assert!(wait_until(|| luna.notifications.unread_count() == 1).await);
    let before = luna.notifications.snapshot();

    memory.fail_next(StoreOp::Delete, tables::NOTIFICATIONS);
    assert!(luna.notifications.clear_all_notifications().await.is_err());
    assert_eq!(luna.notifications.snapshot(), before);

    luna.notifications.clear_all_notifications().await.unwrap();
    assert_eq!(luna.notifications.unread_count(), 0);
}

#[tokio::test]
async fn sign_out_releases_every_subscription() {
    let (memory, (nova_client, nova), (luna_client, luna)) = two_users().await;
    befriend(&nova, &luna).await;
    nova.conversation.open(&luna.identity.id).await.unwrap();
    assert!(memory.subscriber_count() > 0);

    nova_client.sign_out().await.unwrap();
    luna_client.sign_out().await.unwrap();
    assert_eq!(memory.subscriber_count(), 0);
    assert!(nova_client.active().is_none());
}
