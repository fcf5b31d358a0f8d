//  Copyright 2025 bucketcache Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

use crate::{
    metrics::{
        BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram, BoxedHistogramVec, Boxer, CounterOps,
        CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps,
    },
    scope::Scope,
};

#[derive(Debug, Clone)]
enum MetricVec {
    Counter(IntCounterVec),
    Gauge(IntGaugeVec),
    Histogram(HistogramVec),
}

impl CounterOps for IntCounter {
    fn increase(&self, val: u64) {
        self.inc_by(val);
    }
}

impl CounterVecOps for IntCounterVec {
    fn counter(&self, labels: &[&str]) -> BoxedCounter {
        self.with_label_values(labels).boxed()
    }
}

impl GaugeOps for IntGauge {
    fn increase(&self, val: u64) {
        self.add(val as _);
    }

    fn decrease(&self, val: u64) {
        self.sub(val as _);
    }

    fn absolute(&self, val: u64) {
        self.set(val as _);
    }
}

impl GaugeVecOps for IntGaugeVec {
    fn gauge(&self, labels: &[&str]) -> BoxedGauge {
        self.with_label_values(labels).boxed()
    }
}

impl HistogramOps for Histogram {
    fn record(&self, val: f64) {
        self.observe(val);
    }
}

impl HistogramVecOps for HistogramVec {
    fn histogram(&self, labels: &[&str]) -> BoxedHistogram {
        self.with_label_values(labels).boxed()
    }
}

/// Prometheus metric registry.
///
/// Registering the same metric name twice returns the vector registered first, so several caches can share one
/// registry and tell their series apart by the `name` label.
#[derive(Debug, Clone)]
pub struct PrometheusMetricsRegistry {
    registry: Registry,
    metrics: Arc<Mutex<HashMap<&'static str, MetricVec>>>,
}

impl PrometheusMetricsRegistry {
    /// Create a Prometheus metrics registry.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            metrics: Arc::default(),
        }
    }

    /// The underlying prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn get_or_register(&self, name: &'static str, f: impl FnOnce() -> MetricVec) -> MetricVec {
        self.metrics.lock().with(|mut metrics| {
            metrics
                .entry(name)
                .or_insert_with(|| {
                    let vec = f();
                    // Names are deduplicated above. Any other registration failure leaves the metric unexported.
                    let _ = match &vec {
                        MetricVec::Counter(v) => self.registry.register(Box::new(v.clone())),
                        MetricVec::Gauge(v) => self.registry.register(Box::new(v.clone())),
                        MetricVec::Histogram(v) => self.registry.register(Box::new(v.clone())),
                    };
                    vec
                })
                .clone()
        })
    }
}

impl RegistryOps for PrometheusMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        let vec = self.get_or_register(name, || {
            MetricVec::Counter(IntCounterVec::new(Opts::new(name, desc), label_names).expect("valid metric opts"))
        });
        match vec {
            MetricVec::Counter(v) => v.boxed(),
            _ => unreachable!("metric {name} registered with another type"),
        }
    }

    fn register_gauge_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        let vec = self.get_or_register(name, || {
            MetricVec::Gauge(IntGaugeVec::new(Opts::new(name, desc), label_names).expect("valid metric opts"))
        });
        match vec {
            MetricVec::Gauge(v) => v.boxed(),
            _ => unreachable!("metric {name} registered with another type"),
        }
    }

    fn register_histogram_vec(
        &self,
        name: &'static str,
        desc: &'static str,
        label_names: &'static [&'static str],
    ) -> BoxedHistogramVec {
        let vec = self.get_or_register(name, || {
            MetricVec::Histogram(
                HistogramVec::new(HistogramOpts::new(name, desc), label_names).expect("valid metric opts"),
            )
        });
        match vec {
            MetricVec::Histogram(v) => v.boxed(),
            _ => unreachable!("metric {name} registered with another type"),
        }
    }
}

#[cfg(test)]
mod tests {
    use prometheus::{Encoder, TextEncoder};

    use super::*;

    #[test]
    fn test_shared_registry() {
        let registry = PrometheusMetricsRegistry::new(Registry::new());

        let a = registry.register_counter_vec("test_op_total", "test ops", &["name", "op"]);
        let b = registry.register_counter_vec("test_op_total", "test ops", &["name", "op"]);
        a.counter(&["a", "add"]).increase(3);
        b.counter(&["b", "add"]).increase(4);

        let mut buf = vec![];
        TextEncoder::new().encode(&registry.registry().gather(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(r#"test_op_total{name="a",op="add"} 3"#));
        assert!(text.contains(r#"test_op_total{name="b",op="add"} 4"#));
    }
}
