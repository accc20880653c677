//! 表查询条件
//!
//! 同一个 `Query` 既能编码为 PostgREST 的 URL 参数，也能在内存中对 JSON 行求值，
//! 保证远端与进程内后端的过滤语义一致。

use serde_json::Value;
use std::cmp::Ordering;

/// 单个过滤条件
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `col = value`（value 为 null 时表示 `IS NULL`）
    Eq(String, Value),
    /// `col ILIKE pattern`，`%` 为通配符
    Ilike(String, String),
    /// `col IN (values)`
    In(String, Vec<Value>),
    /// 多个 AND 组之间取 OR
    Or(Vec<Vec<Filter>>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq(column, expected) => match row.get(column) {
                Some(actual) => values_equal(actual, expected),
                None => expected.is_null(),
            },
            Filter::Ilike(column, pattern) => row
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|text| like_match(text, pattern)),
            Filter::In(column, values) => row
                .get(column)
                .is_some_and(|actual| values.iter().any(|v| values_equal(actual, v))),
            Filter::Or(groups) => groups
                .iter()
                .any(|group| group.iter().all(|filter| filter.matches(row))),
        }
    }

    /// 顶层参数形式：`(列名, 操作符.值)`
    fn to_param(&self) -> (String, String) {
        match self {
            Filter::Eq(column, value) => (column.clone(), eq_operand(value)),
            Filter::Ilike(column, pattern) => {
                (column.clone(), format!("ilike.{}", pattern.replace('%', "*")))
            }
            Filter::In(column, values) => (column.clone(), in_operand(values)),
            Filter::Or(groups) => ("or".to_string(), format!("({})", or_operand(groups))),
        }
    }

    /// 嵌套在 `or=(...)` 内的形式：`列名.操作符.值`
    fn to_inner(&self) -> String {
        match self {
            Filter::Or(groups) => format!("or({})", or_operand(groups)),
            other => {
                let (column, operand) = other.to_param();
                format!("{}.{}", column, operand)
            }
        }
    }
}

/// 排序
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// 查询：过滤条件（AND）+ 排序 + 条数限制 + 列投影
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只返回指定列，例如 `"post_id"`
    pub fn columns(mut self, columns: &str) -> Self {
        self.columns = Some(columns.to_string());
        self
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.filters
            .push(Filter::Ilike(column.to_string(), pattern.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn or(mut self, groups: Vec<Vec<Filter>>) -> Self {
        self.filters.push(Filter::Or(groups));
        self
    }

    /// 无向的两人关系：`(left=a AND right=b) OR (left=b AND right=a)`
    pub fn pair(self, left: &str, right: &str, a: &str, b: &str) -> Self {
        self.or(vec![
            vec![Filter::eq(left, a), Filter::eq(right, b)],
            vec![Filter::eq(left, b), Filter::eq(right, a)],
        ])
    }

    /// 任意一列等于 `id`
    pub fn involving(self, columns: &[&str], id: &str) -> Self {
        self.or(columns
            .iter()
            .map(|column| vec![Filter::eq(column, id)])
            .collect())
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }

    /// 在内存中执行查询：过滤、排序、截断、投影
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Value>) -> Vec<Value> {
        let mut selected: Vec<Value> = rows
            .into_iter()
            .filter(|row| self.matches(row))
            .cloned()
            .collect();

        if let Some(order) = &self.order {
            // 稳定排序，相同键保持插入顺序
            selected.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        if let Some(columns) = self.columns.as_deref().filter(|c| c.trim() != "*") {
            let keep: Vec<&str> = columns.split(',').map(str::trim).collect();
            for row in &mut selected {
                if let Value::Object(map) = row {
                    map.retain(|key, _| keep.contains(&key.as_str()));
                }
            }
        }
        selected
    }

    /// 编码为 PostgREST URL 参数
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(columns) = &self.columns {
            params.push(("select".to_string(), columns.clone()));
        }
        params.extend(self.filters.iter().map(Filter::to_param));
        if let Some(order) = &self.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push((
                "order".to_string(),
                format!("{}.{}", order.column, direction),
            ));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn eq_operand(value: &Value) -> String {
    if value.is_null() {
        "is.null".to_string()
    } else {
        format!("eq.{}", format_value(value))
    }
}

fn in_operand(values: &[Value]) -> String {
    let items: Vec<String> = values.iter().map(format_value).collect();
    format!("in.({})", items.join(","))
}

fn or_operand(groups: &[Vec<Filter>]) -> String {
    groups
        .iter()
        .map(|group| match group.as_slice() {
            [single] => single.to_inner(),
            many => {
                let inner: Vec<String> = many.iter().map(Filter::to_inner).collect();
                format!("and({})", inner.join(","))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// PostgREST 值格式：含保留字符的字符串需要加双引号
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => {
            if s.contains([',', '(', ')', '"', ':', '\\']) {
                format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                s.clone()
            }
        }
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// 列值比较：null 最小，数字按数值，字符串按字典序
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// 大小写不敏感的 LIKE 匹配，`%` 匹配任意长度
fn like_match(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    let parts: Vec<&str> = pattern.split('%').collect();

    if parts.len() == 1 {
        return text == pattern;
    }

    let mut rest = text.as_str();
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pair_query_params() {
        let query = Query::new()
            .pair("sender_id", "receiver_id", "a", "b")
            .order("created_at", true);
        let params = query.to_params();
        assert_eq!(
            params,
            vec![
                (
                    "or".to_string(),
                    "(and(sender_id.eq.a,receiver_id.eq.b),and(sender_id.eq.b,receiver_id.eq.a))"
                        .to_string()
                ),
                ("order".to_string(), "created_at.asc".to_string()),
            ]
        );
    }

    #[test]
    fn test_simple_params() {
        let query = Query::new()
            .columns("post_id")
            .eq("receiver_id", "me")
            .eq("is_read", false)
            .ilike("handle", "%ast%")
            .is_in("id", ["x", "y"])
            .involving(&["sender_id", "receiver_id"], "me")
            .order("likes_count", false)
            .limit(5);
        let params = query.to_params();
        assert_eq!(params[0], ("select".into(), "post_id".into()));
        assert_eq!(params[1], ("receiver_id".into(), "eq.me".into()));
        assert_eq!(params[2], ("is_read".into(), "eq.false".into()));
        assert_eq!(params[3], ("handle".into(), "ilike.*ast*".into()));
        assert_eq!(params[4], ("id".into(), "in.(x,y)".into()));
        assert_eq!(
            params[5],
            ("or".into(), "(sender_id.eq.me,receiver_id.eq.me)".into())
        );
        assert_eq!(params[6], ("order".into(), "likes_count.desc".into()));
        assert_eq!(params[7], ("limit".into(), "5".into()));
    }

    #[test]
    fn test_reserved_characters_are_quoted() {
        let query = Query::new().eq("content", "hola, (mundo)");
        assert_eq!(
            query.to_params()[0].1,
            "eq.\"hola, (mundo)\"".to_string()
        );
    }

    #[test]
    fn test_in_memory_matching() {
        let rows = vec![
            json!({"id": "1", "sender_id": "a", "receiver_id": "b", "created_at": "2024-01-01T00:00:02Z"}),
            json!({"id": "2", "sender_id": "b", "receiver_id": "a", "created_at": "2024-01-01T00:00:01Z"}),
            json!({"id": "3", "sender_id": "a", "receiver_id": "c", "created_at": "2024-01-01T00:00:03Z"}),
        ];
        let thread = Query::new()
            .pair("sender_id", "receiver_id", "a", "b")
            .order("created_at", true)
            .apply(&rows);
        let ids: Vec<&str> = thread.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["2", "1"]);

        let latest = Query::new().order("created_at", false).limit(1).apply(&rows);
        assert_eq!(latest[0]["id"], "3");
    }

    #[test]
    fn test_ilike_and_projection() {
        let rows = vec![
            json!({"id": "1", "handle": "@AstroNova"}),
            json!({"id": "2", "handle": "@rocket"}),
        ];
        let found = Query::new().ilike("handle", "%astro%").columns("id").apply(&rows);
        assert_eq!(found, vec![json!({"id": "1"})]);

        assert!(like_match("@rocket", "@rock%"));
        assert!(!like_match("@rocket", "rock%"));
        assert!(like_match("@rocket", "%ket"));
        assert!(like_match("@Rocket", "@rocket"));
    }

    #[test]
    fn test_null_and_numeric_equality() {
        let row = json!({"likes_count": 3, "bg_image": null});
        assert!(Filter::eq("likes_count", 3.0).matches(&row));
        assert!(Filter::Eq("bg_image".into(), Value::Null).matches(&row));
        assert!(Filter::Eq("missing".into(), Value::Null).matches(&row));
        assert!(!Filter::eq("missing", "x").matches(&row));
    }
}
