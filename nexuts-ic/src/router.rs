//! Routing decision (spec.md [MODULE C8], §4.7 verbatim).

use crate::config::LoadBalancingWeights;
use nexuts_common::WorkerId;
use nexuts_metrics::{LoadWeights, QueueDepths};
use nexuts_tree::MergeTree;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    CacheAware { instance_id: WorkerId },
    LoadBalanced { instance_id: WorkerId },
    None { message: String },
}

pub struct RouterConfig {
    pub weights: LoadWeights,
    pub balance_threshold: f64,
}

impl From<&LoadBalancingWeights> for LoadWeights {
    fn from(w: &LoadBalancingWeights) -> Self {
        LoadWeights {
            alpha: w.prealloc,
            beta: w.inflight,
        }
    }
}

/// `system_balanced ⇔ (max weighted_load) − (min weighted_load) < threshold`
/// (spec.md §4.7). An empty or singleton set is trivially balanced.
pub fn system_balanced(loads: &HashMap<WorkerId, f64>, threshold: f64) -> bool {
    if loads.len() < 2 {
        return true;
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in loads.values() {
        min = min.min(v);
        max = max.max(v);
    }
    (max - min) < threshold
}

/// Picks the `(weighted_load, worker_id)` minimizer, breaking ties
/// lexicographically on worker id (spec.md §8 "Router determinism").
fn argmin_by_load<'a>(candidates: impl Iterator<Item = (&'a WorkerId, f64)>) -> Option<WorkerId> {
    candidates
        .map(|(w, load)| (load, w.clone()))
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, w)| w)
}

/// Implements spec.md §4.7 "Decision" exactly.
///
/// `available`: `status == true` workers with their latest scraped
/// [`QueueDepths`]; workers with no fresh metrics are excluded by the
/// caller before this function is invoked.
pub fn get_best_instance(
    available: &HashMap<WorkerId, QueueDepths>,
    prompt_tokens: Option<&[nexuts_common::Token]>,
    tree: &MergeTree,
    config: &RouterConfig,
) -> RouteDecision {
    if available.is_empty() {
        return RouteDecision::None {
            message: "No available instances".to_string(),
        };
    }

    let loads: HashMap<WorkerId, f64> = available
        .iter()
        .map(|(w, d)| (w.clone(), config.weights.weighted_load(*d)))
        .collect();

    let balanced = system_balanced(&loads, config.balance_threshold);

    if let Some(tokens) = prompt_tokens {
        if balanced {
            let cache_hit_set = tree.search_instances_with_prefix(tokens);
            let candidates: HashMap<&WorkerId, f64> = loads
                .iter()
                .filter(|(w, _)| cache_hit_set.contains(*w))
                .map(|(w, &l)| (w, l))
                .collect();
            if !candidates.is_empty() {
                if let Some(instance_id) = argmin_by_load(candidates.into_iter().map(|(w, l)| (w, l))) {
                    return RouteDecision::CacheAware { instance_id };
                }
            }
        }
    }

    match argmin_by_load(loads.iter().map(|(w, &l)| (w, l))) {
        Some(instance_id) => RouteDecision::LoadBalanced { instance_id },
        None => RouteDecision::None {
            message: "No available instances".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexuts_common::{SlotId, Token};

    fn weights() -> RouterConfig {
        RouterConfig {
            weights: LoadWeights { alpha: 0.3, beta: 0.7 },
            balance_threshold: 0.3,
        }
    }

    fn depths(prealloc: f64, inflight: f64) -> QueueDepths {
        QueueDepths {
            prealloc_queue: prealloc,
            inflight_queue: inflight,
        }
    }

    #[test]
    fn no_available_instances_returns_none_message() {
        let tree = MergeTree::new();
        let decision = get_best_instance(&HashMap::new(), None, &tree, &weights());
        assert_eq!(
            decision,
            RouteDecision::None {
                message: "No available instances".to_string()
            }
        );
    }

    #[test]
    fn cache_aware_when_balanced_and_prefix_matches() {
        let tree = MergeTree::new();
        let a = WorkerId::from("a");
        let b = WorkerId::from("b");
        tree.core()
            .insert_at(
                nexuts_tree::ROOT_ID,
                &[Token(1), Token(2), Token(3)],
                &[SlotId(1), SlotId(2), SlotId(3)],
                &a,
                None,
                1,
            )
            .unwrap();
        tree.core()
            .insert_at(
                nexuts_tree::ROOT_ID,
                &[Token(1), Token(2), Token(3)],
                &[SlotId(1), SlotId(2), SlotId(3)],
                &b,
                None,
                2,
            )
            .unwrap();

        // S3: loads (0.1, 0.2, 0.15) for a, b, c -> balanced (threshold 0.3).
        let mut available = HashMap::new();
        available.insert(a.clone(), depths(0.1, 0.1));
        available.insert(b.clone(), depths(0.2, 0.2));
        available.insert(WorkerId::from("c"), depths(0.15, 0.15));

        let decision = get_best_instance(&available, Some(&[Token(1), Token(2), Token(3)]), &tree, &weights());
        assert_eq!(decision, RouteDecision::CacheAware { instance_id: a });
    }

    #[test]
    fn load_balanced_fallback_when_unbalanced() {
        let tree = MergeTree::new();
        let mut available = HashMap::new();
        available.insert(WorkerId::from("a"), depths(5.0, 5.0));
        available.insert(WorkerId::from("b"), depths(0.1, 0.1));
        available.insert(WorkerId::from("c"), depths(3.0, 3.0));

        let decision = get_best_instance(&available, Some(&[Token(1)]), &tree, &weights());
        assert_eq!(
            decision,
            RouteDecision::LoadBalanced {
                instance_id: WorkerId::from("b")
            }
        );
    }

    #[test]
    fn ties_break_lexicographically_on_worker_id() {
        let tree = MergeTree::new();
        let mut available = HashMap::new();
        available.insert(WorkerId::from("b"), depths(1.0, 1.0));
        available.insert(WorkerId::from("a"), depths(1.0, 1.0));

        let decision = get_best_instance(&available, None, &tree, &weights());
        assert_eq!(
            decision,
            RouteDecision::LoadBalanced {
                instance_id: WorkerId::from("a")
            }
        );
    }
}
