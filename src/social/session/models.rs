//! 用户资料相关的数据结构

use crate::social::error::SocialError;
use crate::social::serialization::deserialize_null_default;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 注册时的默认角色
pub const DEFAULT_ROLE: &str = "Cadete Espacial";

/// 普通用户角色（资料缺失时的占位身份使用）
pub const BASIC_ROLE: &str = "user";

const MIN_PASSWORD_LEN: usize = 6;

/// 当前登录用户的身份（账号 + 资料）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    /// 以 "@" 开头，全局唯一
    pub handle: String,
    pub email: String,
    pub role: String,
    pub bio: String,
    pub avatar: String,
}

impl Identity {
    /// 资料拉取失败时使用的占位身份
    pub fn guest(id: &str, email: &str) -> Self {
        Self {
            id: id.to_string(),
            name: "User".to_string(),
            handle: "@user".to_string(),
            email: email.to_string(),
            role: BASIC_ROLE.to_string(),
            bio: String::new(),
            avatar: String::new(),
        }
    }

    pub fn from_profile(row: ProfileRow, fallback_email: &str) -> Self {
        let avatar = row.avatar_or_url();
        let email = if row.email.is_empty() {
            fallback_email.to_string()
        } else {
            row.email
        };
        Self {
            avatar,
            id: row.id,
            name: row.name,
            handle: normalize_handle(&row.handle),
            email,
            role: if row.role.is_empty() {
                BASIC_ROLE.to_string()
            } else {
                row.role
            },
            bio: row.bio,
        }
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            handle: self.handle.clone(),
            avatar: self.avatar.clone(),
            role: self.role.clone(),
        }
    }
}

/// 补全 handle 前缀 "@"
pub fn normalize_handle(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        format!("@{}", trimmed)
    }
}

/// `profiles` 表的一行
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileRow {
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub handle: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub email: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub role: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub bio: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub avatar: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub avatar_url: String,
}

impl ProfileRow {
    fn avatar_or_url(&self) -> String {
        if self.avatar.is_empty() {
            self.avatar_url.clone()
        } else {
            self.avatar.clone()
        }
    }
}

/// 其他用户的公开资料（好友卡片、搜索结果、帖子作者）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub handle: String,
    pub avatar: String,
    pub role: String,
}

impl ProfileSummary {
    /// 资料缺失时的占位
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: "Unknown".to_string(),
            handle: "@unknown".to_string(),
            avatar: String::new(),
            role: BASIC_ROLE.to_string(),
        }
    }
}

impl From<ProfileRow> for ProfileSummary {
    fn from(row: ProfileRow) -> Self {
        let avatar = row.avatar_or_url();
        Self {
            id: row.id,
            name: row.name,
            handle: normalize_handle(&row.handle),
            avatar,
            role: row.role,
        }
    }
}

/// 注册表单
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub name: String,
    pub handle: String,
    pub bio: String,
    pub avatar: String,
    /// 为空时使用 `DEFAULT_ROLE`
    pub role: String,
}

impl Registration {
    /// 表单校验，失败时返回第一条错误
    pub fn validate(&self) -> Result<(), SocialError> {
        let required = [
            (&self.email, "邮箱"),
            (&self.password, "密码"),
            (&self.name, "名字"),
            (&self.handle, "用户名"),
        ];
        if let Some((_, label)) = required.iter().find(|(value, _)| value.trim().is_empty()) {
            return Err(SocialError::Validation(format!("{}不能为空", label)));
        }
        if !self.email.contains('@') {
            return Err(SocialError::Validation("邮箱格式不正确".to_string()));
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SocialError::Validation(format!(
                "密码至少需要 {} 个字符",
                MIN_PASSWORD_LEN
            )));
        }
        if self.avatar.trim().is_empty() {
            return Err(SocialError::Validation("请选择头像".to_string()));
        }
        if self.bio.trim().is_empty() {
            return Err(SocialError::Validation("个人简介不能为空".to_string()));
        }
        Ok(())
    }

    pub fn normalized_handle(&self) -> String {
        normalize_handle(&self.handle)
    }

    pub fn role_or_default(&self) -> String {
        if self.role.trim().is_empty() {
            DEFAULT_ROLE.to_string()
        } else {
            self.role.trim().to_string()
        }
    }

    /// 写入账号元数据的字段
    pub fn metadata(&self) -> Value {
        serde_json::json!({
            "name": self.name.trim(),
            "handle": self.normalized_handle(),
            "avatar_url": self.avatar.trim(),
            "bio": self.bio.trim(),
        })
    }
}

/// 资料的部分更新，只有非空字段会被写入
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub handle: Option<String>,
    pub bio: Option<String>,
    pub avatar: Option<String>,
}

impl ProfileUpdate {
    fn fields(&self) -> [(&'static str, Option<String>); 4] {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        [
            ("name", non_empty(&self.name)),
            ("handle", non_empty(&self.handle).map(|h| normalize_handle(&h))),
            ("bio", non_empty(&self.bio)),
            ("avatar", non_empty(&self.avatar)),
        ]
    }

    /// 要写入 `profiles` 的补丁
    pub fn to_patch(&self) -> Map<String, Value> {
        self.fields()
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key.to_string(), Value::String(v))))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.to_patch().is_empty()
    }

    /// 写入成功后合并到本地身份
    pub fn apply_to(&self, identity: &mut Identity) {
        for (key, value) in self.fields() {
            let Some(value) = value else { continue };
            match key {
                "name" => identity.name = value,
                "handle" => identity.handle = value,
                "bio" => identity.bio = value,
                "avatar" => identity.avatar = value,
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_registration() -> Registration {
        Registration {
            email: "nova@space.io".into(),
            password: "orbit42".into(),
            name: "Nova".into(),
            handle: "nova".into(),
            bio: "Mirando estrellas".into(),
            avatar: "https://cdn/avatar.png".into(),
            role: String::new(),
        }
    }

    #[test]
    fn test_normalize_handle() {
        assert_eq!(normalize_handle("nova"), "@nova");
        assert_eq!(normalize_handle(" @nova "), "@nova");
        assert_eq!(normalize_handle(""), "");
    }

    #[test]
    fn test_registration_validation() {
        assert!(valid_registration().validate().is_ok());

        let mut r = valid_registration();
        r.email = "nova.space.io".into();
        assert!(matches!(r.validate(), Err(SocialError::Validation(_))));

        let mut r = valid_registration();
        r.password = "12345".into();
        assert!(matches!(r.validate(), Err(SocialError::Validation(_))));

        let mut r = valid_registration();
        r.avatar = " ".into();
        assert!(matches!(r.validate(), Err(SocialError::Validation(_))));

        let mut r = valid_registration();
        r.bio.clear();
        assert!(matches!(r.validate(), Err(SocialError::Validation(_))));

        let mut r = valid_registration();
        r.name.clear();
        assert_eq!(
            r.validate(),
            Err(SocialError::Validation("名字不能为空".into()))
        );
    }

    #[test]
    fn test_registration_defaults() {
        let r = valid_registration();
        assert_eq!(r.normalized_handle(), "@nova");
        assert_eq!(r.role_or_default(), DEFAULT_ROLE);
        assert_eq!(r.metadata()["avatar_url"], "https://cdn/avatar.png");
    }

    #[test]
    fn test_profile_update_skips_empty_fields() {
        let update = ProfileUpdate {
            name: Some("Nova Prime".into()),
            handle: Some("prime".into()),
            bio: Some("   ".into()),
            avatar: None,
        };
        let patch = update.to_patch();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["handle"], "@prime");

        let mut identity = Identity::guest("u1", "nova@space.io");
        update.apply_to(&mut identity);
        assert_eq!(identity.name, "Nova Prime");
        assert_eq!(identity.handle, "@prime");
        assert_eq!(identity.bio, "");

        assert!(ProfileUpdate::default().is_empty());
    }

    #[test]
    fn test_identity_from_profile_row() {
        let row: ProfileRow = serde_json::from_value(serde_json::json!({
            "id": "u1", "name": "Nova", "handle": "nova", "email": null,
            "role": "Ingeniero de Vuelo", "bio": null, "avatar": null,
            "avatar_url": "https://cdn/a.png"
        }))
        .unwrap();
        let identity = Identity::from_profile(row, "nova@space.io");
        assert_eq!(identity.handle, "@nova");
        assert_eq!(identity.email, "nova@space.io");
        assert_eq!(identity.avatar, "https://cdn/a.png");
        assert_eq!(identity.bio, "");

        let row: ProfileRow = serde_json::from_value(serde_json::json!({
            "id": "u2", "name": "Luna", "handle": "@luna", "email": "luna@space.io",
            "role": "", "avatar": "https://cdn/l.png", "avatar_url": "https://cdn/old.png"
        }))
        .unwrap();
        let identity = Identity::from_profile(row, "otra@space.io");
        assert_eq!(identity.email, "luna@space.io");
        assert_eq!(identity.avatar, "https://cdn/l.png");
        assert_eq!(identity.role, BASIC_ROLE);
    }
}
