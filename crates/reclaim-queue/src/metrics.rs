//! Purge queue metrics and Prometheus exporter
//!
//! # Prometheus Metrics
//! - `reclaim_pq_executing` - Items currently executing
//! - `reclaim_pq_executing_ops` - Estimated backend ops in flight
//! - `reclaim_pq_executed` - Items executed since start
//! - `reclaim_pq_item_dropped` - Entries dropped as corrupt or unrecognized
//! - `reclaim_pq_max_purge_ops` - Current op limit

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeQueueStats {
    pub executing: u64,
    pub executing_ops: u64,
    pub executed: u64,
    pub item_dropped: u64,
    pub max_purge_ops: u64,
}

/// Live counters of one purge queue
#[derive(Debug, Default)]
pub struct PurgeQueueMetrics {
    executing: AtomicU64,
    executing_ops: AtomicU64,
    executed: AtomicU64,
    item_dropped: AtomicU64,
    max_purge_ops: AtomicU64,
}

impl PurgeQueueMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_executing(&self, items: u64) {
        self.executing.store(items, Ordering::Relaxed);
    }

    pub fn set_executing_ops(&self, ops: u64) {
        self.executing_ops.store(ops, Ordering::Relaxed);
    }

    pub fn inc_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_item_dropped(&self) {
        self.item_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_max_purge_ops(&self, ops: u64) {
        self.max_purge_ops.store(ops, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PurgeQueueStats {
        PurgeQueueStats {
            executing: self.executing.load(Ordering::Relaxed),
            executing_ops: self.executing_ops.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            item_dropped: self.item_dropped.load(Ordering::Relaxed),
            max_purge_ops: self.max_purge_ops.load(Ordering::Relaxed),
        }
    }

    /// Export in Prometheus text format, labelled with the owning `rank`
    #[must_use]
    pub fn render_prometheus(&self, rank: u32) -> String {
        let stats = self.snapshot();
        let rank = rank.to_string();
        let mut output = String::with_capacity(1024);

        let series: [(&str, &str, &str, u64); 5] = [
            (
                "pq_executing",
                "Purge queue items in flight",
                "gauge",
                stats.executing,
            ),
            (
                "pq_executing_ops",
                "Purge queue backend ops in flight",
                "gauge",
                stats.executing_ops,
            ),
            (
                "pq_executed",
                "Purge queue items executed",
                "counter",
                stats.executed,
            ),
            (
                "pq_item_dropped",
                "Purge queue entries dropped without execution",
                "counter",
                stats.item_dropped,
            ),
            (
                "pq_max_purge_ops",
                "Purge queue backend op limit",
                "gauge",
                stats.max_purge_ops,
            ),
        ];

        for (name, help, metric_type, value) in series {
            write_help(&mut output, name, help);
            write_type(&mut output, name, metric_type);
            write_metric_with_labels(&mut output, name, value, &[("rank", &rank)]);
        }
        output
    }
}

const PREFIX: &str = "reclaim";

fn write_help(output: &mut String, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {PREFIX}_{name} {help}");
}

fn write_type(output: &mut String, name: &str, metric_type: &str) {
    let _ = writeln!(output, "# TYPE {PREFIX}_{name} {metric_type}");
}

fn write_metric_with_labels(output: &mut String, name: &str, value: u64, labels: &[(&str, &str)]) {
    let labels_str: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    let _ = writeln!(output, "{PREFIX}_{name}{{{}}} {value}", labels_str.join(","));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_export() {
        let metrics = PurgeQueueMetrics::new();
        metrics.set_executing(3);
        metrics.set_executing_ops(17);
        metrics.inc_executed();
        metrics.inc_executed();
        metrics.set_max_purge_ops(64);

        let output = metrics.render_prometheus(2);
        assert!(output.contains("# TYPE reclaim_pq_executed counter"));
        assert!(output.contains("reclaim_pq_executing{rank=\"2\"} 3"));
        assert!(output.contains("reclaim_pq_executing_ops{rank=\"2\"} 17"));
        assert!(output.contains("reclaim_pq_executed{rank=\"2\"} 2"));
        assert!(output.contains("reclaim_pq_item_dropped{rank=\"2\"} 0"));
        assert!(output.contains("reclaim_pq_max_purge_ops{rank=\"2\"} 64"));
    }

    #[test]
    fn test_snapshot() {
        let metrics = PurgeQueueMetrics::new();
        metrics.inc_item_dropped();
        assert_eq!(
            metrics.snapshot(),
            PurgeQueueStats {
                item_dropped: 1,
                ..PurgeQueueStats::default()
            }
        );
    }
}
