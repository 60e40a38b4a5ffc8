//! End-to-end coverage for the IC write path (spec.md §8 scenarios S1 and
//! S5): accept-and-apply through the WAL, a snapshot in between, and a
//! from-scratch recovery that must see the full pre-crash state.

use nexuts_common::{OpBatch, PendingUpdate, RadixOp, SlotId, Token};
use nexuts_ic::config::IcConfig;
use nexuts_ic::IcState;

fn toks(xs: &[u32]) -> Vec<Token> {
    xs.iter().map(|x| Token(*x)).collect()
}

fn slots(xs: &[i64]) -> Vec<SlotId> {
    xs.iter().map(|x| SlotId(*x)).collect()
}

fn insert_batch(sentry_ops_id: u64, instance_id: &str, prompt: &[u32], values: &[i64]) -> OpBatch {
    OpBatch {
        sentry_id: "sentry-1".to_string(),
        sentry_ops_id,
        timestamp: "t".to_string(),
        updates: vec![PendingUpdate {
            instance_id: instance_id.to_string(),
            op: RadixOp::InsertNode {
                parent_path: vec![],
                prompt: toks(prompt),
                prompt_value: slots(values),
            },
        }],
    }
}

fn config_at(dir: &std::path::Path, resume: bool) -> IcConfig {
    let mut config = IcConfig::default();
    config.wal_dir = dir.join("wal").to_string_lossy().to_string();
    config.snapshot_dir = dir.join("snap").to_string_lossy().to_string();
    config.db_path = dir.join("nexuts.db").to_string_lossy().to_string();
    config.resume = resume;
    config
}

#[tokio::test]
async fn s1_insert_snapshot_insert_then_recover_from_scratch() {
    let dir = tempfile::tempdir().unwrap();

    {
        let state = IcState::new(config_at(dir.path(), true)).await.unwrap();
        state.recover().await.unwrap();

        state
            .accept_and_apply(insert_batch(1, "w1", &[10, 20, 30], &[1, 2, 3]))
            .await
            .unwrap();

        state.snapshot_mgr.take_snapshot().await.unwrap();

        state
            .accept_and_apply(insert_batch(2, "w1", &[10, 20, 40], &[1, 2, 9]))
            .await
            .unwrap();
    }
    // IC "crashes" here — fresh process, fresh IcState over the same dirs.

    let recovered = IcState::new(config_at(dir.path(), true)).await.unwrap();
    recovered.recover().await.unwrap();

    let found = recovered.tree.search_instances_with_prefix(&toks(&[10, 20]));
    assert!(found.contains(&nexuts_common::WorkerId::from("w1")));

    let both = recovered.tree.search_instances_with_prefix(&toks(&[10, 20, 30]));
    assert!(both.contains(&nexuts_common::WorkerId::from("w1")));
    let both = recovered.tree.search_instances_with_prefix(&toks(&[10, 20, 40]));
    assert!(both.contains(&nexuts_common::WorkerId::from("w1")));
}

#[tokio::test]
async fn s5_out_of_order_batches_apply_in_sentry_ops_id_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = IcState::new(config_at(dir.path(), true)).await.unwrap();
    state.recover().await.unwrap();

    // sentry_ops_id = 2 arrives first; it must not be applied yet.
    state
        .accept_and_apply(insert_batch(2, "w1", &[2], &[20]))
        .await
        .unwrap();
    assert!(state
        .tree
        .search_instances_with_prefix(&toks(&[2]))
        .is_empty());

    // sentry_ops_id = 1 arrives; both 1 and 2 apply in order.
    state
        .accept_and_apply(insert_batch(1, "w1", &[1], &[10]))
        .await
        .unwrap();
    assert!(state.tree.search_instances_with_prefix(&toks(&[1])).contains(&nexuts_common::WorkerId::from("w1")));
    assert!(state.tree.search_instances_with_prefix(&toks(&[2])).contains(&nexuts_common::WorkerId::from("w1")));

    // duplicate sentry_ops_id = 1 is ignored, not reapplied.
    let before = state.tree.global_version();
    state
        .accept_and_apply(insert_batch(1, "w1", &[1], &[10]))
        .await
        .unwrap();
    assert_eq!(state.tree.global_version(), before);
}
