//! Raw event fixtures.
//!
//! Builders for the two raw document shapes the compactor accepts, and
//! helpers to drop them into a date bucket.

use bytes::Bytes;
use chatlake_core::{ContextDate, StorageLayout};
use serde_json::{Value, json};

use crate::storage::TracingMemoryBackend;

/// Flat raw event as written by the ingest webhook.
#[must_use]
pub fn flat_event(message_id: i64, message_date: &str, text: Option<&str>) -> Value {
    json!({
        "message_id": message_id,
        "message_date": message_date,
        "message_text": text,
        "user_first_name": "Ana",
        "user_id": 100,
    })
}

/// Nested webhook update with an epoch-seconds `date`.
#[must_use]
pub fn nested_update(
    message_id: i64,
    epoch_secs: i64,
    text: Option<&str>,
    user_id: i64,
    first_name: &str,
) -> Value {
    let mut message = json!({
        "message_id": message_id,
        "date": epoch_secs,
        "from": { "id": user_id, "is_bot": false, "first_name": first_name },
        "chat": { "id": -1_001_234, "type": "supergroup" },
    });
    if let Some(text) = text {
        message["text"] = Value::String(text.to_string());
    }
    json!({ "update_id": message_id + 500_000, "message": message })
}

/// The two-message bucket for 2025-10-29: one text message, one without text.
#[must_use]
pub fn two_message_bucket() -> Vec<Value> {
    vec![
        flat_event(1, "2025-10-29T10:00:00Z", Some("hi")),
        flat_event(2, "2025-10-29T11:05:00Z", None),
    ]
}

/// Key of the `n`th raw object in a bucket.
#[must_use]
pub fn raw_key(layout: &StorageLayout, date: ContextDate, n: usize) -> String {
    format!("{}event-{n:05}.json", layout.raw_bucket_prefix(date))
}

/// Writes `events` into the bucket for `date`, returning their keys.
pub async fn seed_bucket(
    storage: &TracingMemoryBackend,
    layout: &StorageLayout,
    date: ContextDate,
    events: &[Value],
) -> Vec<String> {
    let mut keys = Vec::with_capacity(events.len());
    for (n, event) in events.iter().enumerate() {
        let key = raw_key(layout, date, n);
        storage
            .seed(&key, serde_json::to_vec(event).expect("serialize fixture"))
            .await;
        keys.push(key);
    }
    keys
}

/// Writes arbitrary bytes as a raw object named `name` in the bucket.
pub async fn seed_raw(
    storage: &TracingMemoryBackend,
    layout: &StorageLayout,
    date: ContextDate,
    name: &str,
    bytes: impl Into<Bytes>,
) -> String {
    let key = format!("{}{name}", layout.raw_bucket_prefix(date));
    storage.seed(&key, bytes).await;
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_update_omits_missing_text() {
        let doc = nested_update(7, 1_761_732_000, None, 42, "Bo");
        assert!(doc["message"].get("text").is_none());
        assert_eq!(doc["message"]["from"]["id"], 42);
    }

    #[tokio::test]
    async fn seeded_keys_sort_in_insertion_order() {
        let storage = TracingMemoryBackend::new();
        let layout = StorageLayout::default();
        let date: ContextDate = "2025-10-29".parse().expect("date");
        let keys = seed_bucket(&storage, &layout, date, &two_message_bucket()).await;

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.iter().all(|k| layout.is_raw_event_key(date, k)));
    }
}
