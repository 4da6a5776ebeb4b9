//! Input files, records and configurations for integration tests

use std::path::{Path, PathBuf};
use std::time::Duration;

use keyset_export::{Config, Fields, LookupKey, Record};
use serde_json::json;

/// Conversation ids `conv-00`, `conv-01`, ... in order
pub fn conversation_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("conv-{i:02}")).collect()
}

pub fn key(raw: &str) -> LookupKey {
    LookupKey::parse(raw).unwrap()
}

/// Conversation record owned by `user_id`
pub fn conversation(id: &str, user_id: &str, title: &str) -> Record {
    let mut fields = Fields::new();
    fields.insert("conversation_id".into(), json!(id));
    fields.insert("user_id".into(), json!(user_id));
    fields.insert("title".into(), json!(title));
    fields.insert("messages".into(), json!(id.len()));
    Record::new(key(id), fields)
}

/// One conversation per id, owners cycling through `users`
pub fn conversations(ids: &[String], users: &[&str]) -> Vec<Record> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| conversation(id, users[i % users.len()], &format!("Chat {i}")))
        .collect()
}

/// Write a `conversation_id,source` input file
pub fn write_input(dir: &Path, ids: &[String]) -> PathBuf {
    let path = dir.join("conversation_ids.csv");
    let mut body = String::from("conversation_id,source\n");
    for id in ids {
        body.push_str(id);
        body.push_str(",search\n");
    }
    std::fs::write(&path, body).unwrap();
    path
}

/// Configuration with short delays, keyed on `conversation_id`, writing to `dir/out.csv`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.backend.table = "Conversations".into();
    config.input.key_column = "conversation_id".into();
    config.fetch.inter_batch_delay = Duration::from_millis(1);
    config.retry.base_delay = Duration::from_millis(2);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter_max = Duration::from_millis(1);
    config.output.path = Some(dir.join("out.csv"));
    config
}

/// Data rows of a CSV file, header excluded
pub fn read_rows(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|row| row.unwrap().iter().map(str::to_string).collect())
        .collect()
}

/// Header of a CSV file
pub fn read_header(path: &Path) -> Vec<String> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.headers().unwrap().iter().map(str::to_string).collect()
}
