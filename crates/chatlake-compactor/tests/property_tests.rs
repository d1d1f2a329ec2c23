//! Property-based tests for compaction invariants.
//!
//! Every raw object ends up in exactly one counter, and malformed objects
//! never change the rows produced from the valid ones.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{Value, json};
use tokio_test::block_on;

use chatlake_compactor::parquet_util::read_partition;
use chatlake_compactor::{Compactor, CompactorConfig, RunOutcome};
use chatlake_core::{ContextDate, StorageBackend};
use chatlake_test_utils::{TracingMemoryBackend, seed_raw};

#[derive(Debug, Clone)]
enum RawObject {
    Valid(Value),
    Malformed(Vec<u8>),
}

fn arb_valid() -> impl Strategy<Value = Value> {
    (
        1i64..50,
        0u32..24,
        0u32..60,
        proptest::option::of("[a-z ]{0,12}"),
        1i64..5,
    )
        .prop_map(|(id, hour, minute, text, user)| {
            json!({
                "message_id": id,
                "message_date": format!("2025-10-29T{hour:02}:{minute:02}:00Z"),
                "message_text": text,
                "user_first_name": format!("user{user}"),
                "user_id": user,
            })
        })
}

fn arb_malformed() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(b"{\"message_date\":\"2025-10-29T10:00:00Z\",\"user_first_name\":\"A\",\"user_id\":1}".to_vec()),
        Just(b"{truncated".to_vec()),
        Just(b"{\"message_id\":1.5,\"message_date\":0,\"user_first_name\":\"A\",\"user_id\":1}".to_vec()),
        Just(b"{\"message_id\":1,\"message_date\":0,\"user_first_name\":\"A\",\"user_id\":true}".to_vec()),
        Just(b"{\"message_id\":1,\"message_date\":\"2025-10-29T10:00:00.000000001Z\",\"user_first_name\":\"A\",\"user_id\":1}".to_vec()),
        Just(vec![0xc3, 0x28]),
    ]
}

fn arb_object() -> impl Strategy<Value = RawObject> {
    prop_oneof![
        3 => arb_valid().prop_map(RawObject::Valid),
        1 => arb_malformed().prop_map(RawObject::Malformed),
    ]
}

fn date() -> ContextDate {
    "2025-10-29".parse().unwrap()
}

async fn compact(objects: &[RawObject], dedupe: bool) -> (chatlake_compactor::RunReport, Vec<u8>) {
    let storage = Arc::new(TracingMemoryBackend::new());
    let backend: Arc<dyn StorageBackend> = storage.clone();
    let config = CompactorConfig {
        dedupe,
        read_concurrency: 4,
        ..CompactorConfig::default()
    };
    let compactor = Compactor::new(backend.clone(), backend, config).unwrap();
    for (n, object) in objects.iter().enumerate() {
        let bytes = match object {
            RawObject::Valid(doc) => serde_json::to_vec(doc).unwrap(),
            RawObject::Malformed(bytes) => bytes.clone(),
        };
        seed_raw(&storage, compactor.layout(), date(), &format!("obj-{n:04}.json"), bytes).await;
    }

    let report = compactor.compact(date()).await.expect("run succeeds");
    let published = storage
        .get(&compactor.layout().partition_key(date()))
        .await
        .map(|b| b.to_vec())
        .unwrap_or_default();
    (report, published)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn counters_account_for_every_object(
        objects in prop::collection::vec(arb_object(), 0..40),
        dedupe in any::<bool>(),
    ) {
        let (report, _) = block_on(compact(&objects, dedupe));
        let malformed = objects.iter().filter(|o| matches!(o, RawObject::Malformed(_))).count();

        prop_assert_eq!(report.objects_seen, objects.len() as u64);
        prop_assert_eq!(report.rows_skipped, malformed as u64);
        prop_assert!(report.is_conserved());
        if !dedupe {
            prop_assert_eq!(report.duplicates_dropped, 0);
        }
        let expected = if report.rows_written == 0 {
            RunOutcome::SkippedEmpty
        } else {
            RunOutcome::Written
        };
        prop_assert_eq!(report.outcome, expected);
    }

    #[test]
    fn malformed_objects_do_not_affect_valid_rows(
        valid in prop::collection::vec(arb_valid(), 1..20),
        noise in prop::collection::vec(arb_malformed(), 1..5),
    ) {
        let clean: Vec<RawObject> = valid.iter().cloned().map(RawObject::Valid).collect();
        let mut noisy = clean.clone();
        noisy.extend(noise.iter().cloned().map(RawObject::Malformed));

        let (clean_report, clean_bytes) = block_on(compact(&clean, false));
        let (noisy_report, noisy_bytes) = block_on(compact(&noisy, false));

        prop_assert_eq!(clean_report.rows_written, noisy_report.rows_written);
        prop_assert_eq!(noisy_report.rows_skipped, noise.len() as u64);
        let clean_rows = read_partition(date(), &clean_bytes.into()).unwrap().rows;
        let noisy_rows = read_partition(date(), &noisy_bytes.into()).unwrap().rows;
        prop_assert_eq!(clean_rows, noisy_rows);
    }
}
