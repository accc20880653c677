//! 社区动态数据结构

use crate::social::serialization::deserialize_null_default;
use crate::social::session::models::{ProfileSummary, BASIC_ROLE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub label: String,
    pub color: String,
}

/// `posts` 表的一行
#[derive(Debug, Clone, Deserialize)]
pub struct PostRow {
    pub id: String,
    pub author_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub likes_count: i64,
    #[serde(default)]
    pub bg_image: Option<String>,
    #[serde(default)]
    pub tags: Value,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub link_url: Option<String>,
    #[serde(default)]
    pub link_title: Option<String>,
    #[serde(default)]
    pub link_description: Option<String>,
}

/// 展示用的帖子（已关联作者与评论数）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_handle: String,
    pub avatar: String,
    pub content: String,
    pub created_at: String,
    pub likes: i64,
    pub comments: usize,
    pub tags: Vec<Tag>,
    pub bg_image: Option<String>,
    /// 作者角色不是普通用户
    pub is_verified: bool,
    pub media_url: Option<String>,
    pub media_type: Option<MediaType>,
    pub link_url: Option<String>,
    pub link_title: Option<String>,
    pub link_description: Option<String>,
}

impl Post {
    pub fn assemble(row: PostRow, author: Option<&ProfileSummary>, comments: usize) -> Self {
        // tags 列不是数组时按空处理
        let tags = match row.tags {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
            _ => Vec::new(),
        };
        Self {
            id: row.id,
            author_id: row.author_id,
            author_name: author
                .map(|a| a.name.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            author_handle: author
                .map(|a| a.handle.clone())
                .unwrap_or_else(|| "@unknown".to_string()),
            avatar: author.map(|a| a.avatar.clone()).unwrap_or_default(),
            content: row.content,
            created_at: row.created_at,
            likes: row.likes_count.max(0),
            comments,
            tags,
            bg_image: row.bg_image,
            is_verified: author.is_some_and(|a| a.role != BASIC_ROLE),
            media_url: row.media_url,
            media_type: row.media_type,
            link_url: row.link_url,
            link_title: row.link_title,
            link_description: row.link_description,
        }
    }
}

/// `comments` 表的一行
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub created_at: String,
}

/// 展示用的评论
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub content: String,
    pub created_at: String,
    pub author: ProfileSummary,
}

impl Comment {
    pub fn assemble(row: CommentRow, author: Option<&ProfileSummary>) -> Self {
        Self {
            author: author
                .cloned()
                .unwrap_or_else(|| ProfileSummary::unknown(&row.author_id)),
            id: row.id,
            post_id: row.post_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

/// 新帖子
#[derive(Debug, Clone, Default)]
pub struct PostDraft {
    pub content: String,
    pub media_url: Option<String>,
    pub media_type: Option<MediaType>,
    pub link_url: Option<String>,
}

/// 帖子列表的排序 / 过滤方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedFilter {
    /// 按点赞数降序
    #[default]
    Trending,
    /// 按发布时间降序
    Recent,
    /// 只看认证作者，按点赞数降序
    Verified,
}

impl FeedFilter {
    pub fn apply(&self, posts: &[Post]) -> Vec<Post> {
        let mut selected: Vec<Post> = match self {
            FeedFilter::Verified => posts.iter().filter(|p| p.is_verified).cloned().collect(),
            _ => posts.to_vec(),
        };
        match self {
            FeedFilter::Recent => selected.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            FeedFilter::Trending | FeedFilter::Verified => {
                selected.sort_by(|a, b| b.likes.cmp(&a.likes))
            }
        }
        selected
    }
}

/// 点赞 / 取消点赞的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeOutcome {
    Liked,
    /// 服务端已有点赞记录，本地状态已对齐，计数不变
    AlreadyLiked,
    Unliked,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(role: &str) -> ProfileSummary {
        ProfileSummary {
            id: "u1".into(),
            name: "Nova".into(),
            handle: "@nova".into(),
            avatar: "a.png".into(),
            role: role.into(),
        }
    }

    fn row(id: &str, likes: i64, created_at: &str) -> PostRow {
        serde_json::from_value(serde_json::json!({
            "id": id, "author_id": "u1", "content": "hola", "created_at": created_at,
            "likes_count": likes, "tags": [{"label": "Marte", "color": "red"}, 42],
            "media_type": "image"
        }))
        .unwrap()
    }

    #[test]
    fn test_assemble_post() {
        let post = Post::assemble(row("p1", 3, "2024-01-01T00:00:00Z"), Some(&author("Cadete Espacial")), 2);
        assert_eq!(post.author_handle, "@nova");
        assert_eq!(post.tags.len(), 1);
        assert_eq!(post.media_type, Some(MediaType::Image));
        assert!(post.is_verified);
        assert_eq!(post.comments, 2);

        let orphan = Post::assemble(row("p2", 0, "2024-01-01T00:00:00Z"), None, 0);
        assert_eq!(orphan.author_name, "Unknown");
        assert!(!orphan.is_verified);
    }

    #[test]
    fn test_null_like_count() {
        let row: PostRow = serde_json::from_value(serde_json::json!({
            "id": "p1", "author_id": "u1", "likes_count": null, "tags": null
        }))
        .unwrap();
        let post = Post::assemble(row, None, 0);
        assert_eq!(post.likes, 0);
        assert!(post.tags.is_empty());
    }

    #[test]
    fn test_feed_filters() {
        let posts = vec![
            Post::assemble(row("old-popular", 9, "2024-01-01T00:00:00Z"), Some(&author("user")), 0),
            Post::assemble(row("new", 1, "2024-03-01T00:00:00Z"), Some(&author("Director de Misión")), 0),
            Post::assemble(row("mid", 5, "2024-02-01T00:00:00Z"), Some(&author("Cadete Espacial")), 0),
        ];
        let ids = |list: Vec<Post>| list.into_iter().map(|p| p.id).collect::<Vec<_>>();

        assert_eq!(ids(FeedFilter::Trending.apply(&posts)), vec!["old-popular", "mid", "new"]);
        assert_eq!(ids(FeedFilter::Recent.apply(&posts)), vec!["new", "mid", "old-popular"]);
        assert_eq!(ids(FeedFilter::Verified.apply(&posts)), vec!["mid", "new"]);
    }
}
