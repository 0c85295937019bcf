use chrono::NaiveDateTime;
use dbx::{ColType, DbModel, TableMeta};
use serde::{Deserialize, Serialize};

#[dbx::model(table = "user", pk = "uid")]
#[derive(Debug, Serialize, Deserialize)]
struct User {
    uid: i64,
    gid: i64,
    name: String,
    #[serde(rename = "createDate")]
    create_date: NaiveDateTime,
}

#[dbx::model(table_name = "article_tag", auto_increment = false)]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArticleTag {
    id: String,
    article_id: u32,
    weight: Option<f64>,
    pinned: bool,
    labels: Vec<String>,
    #[serde(skip)]
    scratch: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[test]
fn test_columns_follow_serde_names() {
    assert_eq!(User::TABLE_NAME, "user");
    assert_eq!(User::PRIMARY_KEY, "uid");
    let names: Vec<&str> = User::columns().iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["uid", "gid", "name", "createDate"]);
    assert_eq!(User::columns()[3].ty, ColType::Timestamp);
    assert!(User::auto_increment());
}

#[test]
fn test_rename_all_skip_and_type_mapping() {
    assert_eq!(ArticleTag::table_name(), "article_tag");
    assert_eq!(ArticleTag::primary_key(), "id");
    assert!(!ArticleTag::auto_increment());
    let cols: Vec<(&str, ColType)> = ArticleTag::columns().iter().map(|c| (c.name, c.ty)).collect();
    assert_eq!(
        cols,
        vec![
            ("id", ColType::Text),
            ("articleId", ColType::Int64),
            ("weight", ColType::Float64),
            ("pinned", ColType::Bool),
            ("labels", ColType::Json),
            ("publishedAt", ColType::Timestamp),
        ]
    );
}

#[test]
fn test_table_meta_from_macro() {
    let meta = TableMeta::of::<ArticleTag>();
    assert_eq!(meta.resolve("ARTICLEID"), "articleId");
    assert_eq!(meta.col_type("labels"), Some(ColType::Json));
    assert!(meta.column("scratch").is_none());
}

#[test]
fn test_entity_values_skip_missing_columns() {
    let tag = ArticleTag {
        id: "t1".into(),
        article_id: 9,
        weight: None,
        pinned: true,
        labels: vec!["a".into()],
        scratch: Some(1),
        published_at: None,
    };
    let vals = dbx::entity_values(&tag).unwrap();
    assert_eq!(vals.len(), 6);
    assert_eq!(vals[1], ("articleId", serde_json::json!(9)));
    assert_eq!(vals[2], ("weight", serde_json::Value::Null));
    // skip_serializing_if 省略的列按 null 处理
    assert_eq!(vals[5], ("publishedAt", serde_json::Value::Null));
}
