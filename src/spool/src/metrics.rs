// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Backpressure metrics.

use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Counters and gauges for one backpressure manager. Labelled by target so
/// the registry can hold one set per sink.
#[derive(Debug, Clone)]
pub struct SpoolMetrics {
    pub received: IntCounter,
    pub dequeued: IntCounter,
    pub dropped_for_overflow: IntCounter,
    pub dlq_moved: IntCounter,
    pub spool_errors: IntCounter,
    pub queue_depth: IntGauge,
    pub spool_records: IntGauge,
    pub spool_bytes: IntGauge,
}

impl SpoolMetrics {
    /// Creates the metric set and registers it under `target`.
    pub fn register_into(registry: &Registry, target: &str) -> SpoolMetrics {
        fn counter(registry: &Registry, name: &str, help: &str, target: &str) -> IntCounter {
            let counter =
                IntCounter::with_opts(Opts::new(name, help).const_label("target", target))
                    .expect("metric options are valid");
            registry
                .register(Box::new(counter.clone()))
                .expect("metric registered once per target");
            counter
        }
        fn gauge(registry: &Registry, name: &str, help: &str, target: &str) -> IntGauge {
            let gauge = IntGauge::with_opts(Opts::new(name, help).const_label("target", target))
                .expect("metric options are valid");
            registry
                .register(Box::new(gauge.clone()))
                .expect("metric registered once per target");
            gauge
        }
        SpoolMetrics {
            received: counter(
                registry,
                "otb_backpressure_records_received_total",
                "Records accepted by the backpressure manager.",
                target,
            ),
            dequeued: counter(
                registry,
                "otb_backpressure_records_dequeued_total",
                "Records handed to the consumer.",
                target,
            ),
            dropped_for_overflow: counter(
                registry,
                "otb_backpressure_records_dropped_total",
                "Records discarded by the drop policy.",
                target,
            ),
            dlq_moved: counter(
                registry,
                "otb_backpressure_records_dlq_total",
                "Records moved to the dead-letter queue.",
                target,
            ),
            spool_errors: counter(
                registry,
                "otb_backpressure_spool_errors_total",
                "Spool write failures that fell back to the drop policy.",
                target,
            ),
            queue_depth: gauge(
                registry,
                "otb_backpressure_queue_depth",
                "Records currently in the memory tier.",
                target,
            ),
            spool_records: gauge(
                registry,
                "otb_backpressure_spool_records",
                "Records currently in the disk spool.",
                target,
            ),
            spool_bytes: gauge(
                registry,
                "otb_backpressure_spool_bytes",
                "Bytes currently in the disk spool.",
                target,
            ),
        }
    }

    /// An unregistered set, for managers constructed in tests.
    pub fn unregistered() -> SpoolMetrics {
        SpoolMetrics::register_into(&Registry::new(), "test")
    }
}
