//! Integration coverage for the Sentry-side tree + outbound pipeline glue
//! (spec.md §8 S2 "Split on partial match", §4.5 "Sentry Outbound
//! Pipeline").

use nexuts_common::{RadixOp, SlotId, Token, WorkerId};
use nexuts_sentry::pipeline::{record_and_buffer, OutboundPipeline};
use nexuts_tree::RadixTree;

fn toks(xs: &[u32]) -> Vec<Token> {
    xs.iter().map(|x| Token(*x)).collect()
}

fn slots(xs: &[i64]) -> Vec<SlotId> {
    xs.iter().map(|x| SlotId(*x)).collect()
}

#[test]
fn split_on_partial_match_then_buffers_both_ops() {
    let tree = RadixTree::new();
    let worker = WorkerId::from("w1");
    let dir = tempfile::tempdir().unwrap();
    let pipeline = OutboundPipeline::open("sentry-1", "http://127.0.0.1:0", dir.path().join("queue")).unwrap();

    let ops = vec![
        RadixOp::InsertNode {
            parent_path: vec![],
            prompt: toks(&[1, 2, 3, 4, 5]),
            prompt_value: slots(&[10, 20, 30, 40, 50]),
        },
        RadixOp::InsertNode {
            parent_path: vec![],
            prompt: toks(&[1, 2, 7]),
            prompt_value: slots(&[10, 20, 70]),
        },
    ];

    let results = ops.into_iter().map(|op| {
        let applied = tree
            .apply_op(&worker, &op)
            .map_err(nexuts_sentry::error::SentryError::from);
        (op, applied)
    });
    let report = record_and_buffer(&pipeline, "w1", results);

    assert!(report.all_ok());
    assert_eq!(tree.node_count(), 4);

    pipeline.flush_to_queue().unwrap();
    let head = pipeline.peek_head().unwrap().unwrap();
    assert_eq!(head.sentry_ops_id, 1);
    assert_eq!(head.updates.len(), 2);
    assert_eq!(head.updates[0].instance_id, "w1");
}

#[test]
fn delete_on_unknown_path_reports_error_without_aborting_batch() {
    let tree = RadixTree::new();
    let worker = WorkerId::from("w1");
    let dir = tempfile::tempdir().unwrap();
    let pipeline = OutboundPipeline::open("sentry-1", "http://127.0.0.1:0", dir.path().join("queue")).unwrap();

    let ops = vec![
        RadixOp::DeleteNode {
            parent_path: toks(&[9, 9, 9]),
            split_length: 1,
        },
        RadixOp::InsertNode {
            parent_path: vec![],
            prompt: toks(&[1]),
            prompt_value: slots(&[1]),
        },
    ];

    let results = ops.into_iter().map(|op| {
        let applied = tree
            .apply_op(&worker, &op)
            .map_err(nexuts_sentry::error::SentryError::from);
        (op, applied)
    });
    let report = record_and_buffer(&pipeline, "w1", results);

    assert!(!report.all_ok());
    assert_eq!(report.results.len(), 2);
    assert!(!report.results[0].ok);
    assert!(report.results[1].ok);
}
