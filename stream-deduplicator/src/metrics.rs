use std::collections::HashMap;

/// Metrics helper that stamps every emitted metric with a consistent set of
/// baseline labels, typically the operator store id and partition.
#[derive(Debug, Clone, Default)]
pub struct MetricsHelper {
    baseline_labels: HashMap<String, String>,
}

impl MetricsHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Helper scoped to one operator store partition
    pub fn with_store_partition(store_id: &str, partition: u32) -> Self {
        Self::new()
            .with_label("store_id", store_id)
            .with_label("partition", &partition.to_string())
    }

    /// Add an additional baseline label
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.baseline_labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn counter(&self, name: &str) -> CounterHelper {
        CounterHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }

    pub fn histogram(&self, name: &str) -> HistogramHelper {
        HistogramHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }

    pub fn gauge(&self, name: &str) -> GaugeHelper {
        GaugeHelper {
            name: name.to_string(),
            labels: self.baseline_labels.clone(),
        }
    }
}

fn label_pairs(labels: HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs = labels.into_iter().collect::<Vec<(String, String)>>();
    pairs.sort();
    pairs
}

pub struct CounterHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl CounterHelper {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn increment(self, value: u64) {
        metrics::counter!(self.name, &label_pairs(self.labels)).increment(value);
    }
}

pub struct HistogramHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl HistogramHelper {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn record(self, value: f64) {
        metrics::histogram!(self.name, &label_pairs(self.labels)).record(value);
    }
}

pub struct GaugeHelper {
    name: String,
    labels: HashMap<String, String>,
}

impl GaugeHelper {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn set(self, value: f64) {
        metrics::gauge!(self.name, &label_pairs(self.labels)).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_partition_labels() {
        let helper = MetricsHelper::with_store_partition("0-deduplicate", 3)
            .with_label("service", "stream-deduplicator");

        assert_eq!(helper.baseline_labels.len(), 3);
        assert_eq!(
            helper.baseline_labels.get("store_id"),
            Some(&"0-deduplicate".to_string())
        );
        assert_eq!(
            helper.baseline_labels.get("partition"),
            Some(&"3".to_string())
        );
    }

    #[test]
    fn test_per_metric_labels_do_not_leak_into_baseline() {
        let helper = MetricsHelper::new().with_label("service", "stream-deduplicator");
        let counter = helper.counter("rows_total").with_label("kind", "updated");

        assert_eq!(counter.labels.get("kind"), Some(&"updated".to_string()));
        assert!(!helper.baseline_labels.contains_key("kind"));
        // No recorder installed, emitting is a no-op
        counter.increment(1);
    }

    #[test]
    fn test_label_pairs_are_sorted() {
        let mut labels = HashMap::new();
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("a".to_string(), "1".to_string());
        assert_eq!(
            label_pairs(labels),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }
}
