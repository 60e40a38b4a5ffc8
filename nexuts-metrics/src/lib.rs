//! Worker `/metrics` Prometheus-text scraping and the weighted-load formula
//! shared by the router and the metrics poller (spec.md §6 "Metrics
//! scraping", §4.7 "Score"). Grounded on
//! `original_source/Nexuts/utils/metrics_collector.py`'s
//! `InstanceMetricsCollector`.

pub mod error;

use error::{MetricsError, MetricsResult};
use nexuts_common::PodType;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

/// The two queue-depth numbers extracted from a worker's `/metrics` text,
/// keyed by worker kind (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueDepths {
    pub prealloc_queue: f64,
    pub inflight_queue: f64,
}

/// `weighted_load(w) = alpha * prealloc(w) + beta * inflight(w)` (spec.md
/// §4.7 "Score"), defaults `alpha = 0.3, beta = 0.7`.
#[derive(Debug, Clone, Copy)]
pub struct LoadWeights {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self { alpha: 0.3, beta: 0.7 }
    }
}

impl LoadWeights {
    pub fn weighted_load(&self, depths: QueueDepths) -> f64 {
        self.alpha * depths.prealloc_queue + self.beta * depths.inflight_queue
    }
}

static PREFILL_PREALLOC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sglang:num_prefill_prealloc_queue_reqs\{[^}]*\}\s+([0-9.]+)").unwrap());
static PREFILL_INFLIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sglang:num_prefill_inflight_queue_reqs\{[^}]*\}\s+([0-9.]+)").unwrap());
static DECODE_PREALLOC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sglang:num_decode_prealloc_queue_reqs\{[^}]*\}\s+([0-9.]+)").unwrap());
static DECODE_TRANSFER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sglang:num_decode_transfer_queue_reqs\{[^}]*\}\s+([0-9.]+)").unwrap());

/// Extracts the two queue depths relevant to `pod_type` from Prometheus
/// exposition text; an unmatched series defaults to `0.0` (spec.md §6).
pub fn extract_queue_depths(text: &str, pod_type: PodType) -> QueueDepths {
    let (prealloc_re, second_re) = match pod_type {
        PodType::Prefill => (&*PREFILL_PREALLOC, &*PREFILL_INFLIGHT),
        PodType::Decode => (&*DECODE_PREALLOC, &*DECODE_TRANSFER),
    };
    QueueDepths {
        prealloc_queue: extract_one(text, prealloc_re),
        inflight_queue: extract_one(text, second_re),
    }
}

fn extract_one(text: &str, re: &Regex) -> f64 {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Scrapes `GET http://{ip}:{port}/metrics` and extracts the queue depths
/// for `pod_type`. Non-2xx or a request error is reported as
/// [`MetricsError::Request`]; callers typically log and keep the last-known
/// value on failure (spec.md §7 "Transient I/O").
pub async fn scrape(client: &reqwest::Client, ip: &str, port: u16, pod_type: PodType) -> MetricsResult<QueueDepths> {
    let url = format!("http://{ip}:{port}/metrics");
    let resp = client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map_err(|source| MetricsError::Request { url: url.clone(), source })?;
    let text = resp
        .text()
        .await
        .map_err(|source| MetricsError::Request { url, source })?;
    Ok(extract_queue_depths(&text, pod_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_prefill_metrics() {
        let text = "sglang:num_prefill_prealloc_queue_reqs{instance=\"a\"} 3.0\nsglang:num_prefill_inflight_queue_reqs{instance=\"a\"} 7.5\n";
        let d = extract_queue_depths(text, PodType::Prefill);
        assert_eq!(d.prealloc_queue, 3.0);
        assert_eq!(d.inflight_queue, 7.5);
    }

    #[test]
    fn extracts_decode_metrics() {
        let text = "sglang:num_decode_prealloc_queue_reqs{} 1\nsglang:num_decode_transfer_queue_reqs{} 2\n";
        let d = extract_queue_depths(text, PodType::Decode);
        assert_eq!(d.prealloc_queue, 1.0);
        assert_eq!(d.inflight_queue, 2.0);
    }

    #[test]
    fn no_match_defaults_to_zero() {
        let d = extract_queue_depths("garbage text", PodType::Prefill);
        assert_eq!(d.prealloc_queue, 0.0);
        assert_eq!(d.inflight_queue, 0.0);
    }

    #[test]
    fn weighted_load_uses_default_weights() {
        let w = LoadWeights::default();
        let load = w.weighted_load(QueueDepths {
            prealloc_queue: 10.0,
            inflight_queue: 2.0,
        });
        assert!((load - (0.3 * 10.0 + 0.7 * 2.0)).abs() < 1e-9);
    }
}
