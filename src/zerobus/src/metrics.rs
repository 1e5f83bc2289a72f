// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Sink metrics.

use prometheus::{IntCounter, Opts, Registry};

/// Counters for one sink, labelled by target.
#[derive(Debug, Clone)]
pub struct SinkMetrics {
    pub records_sent: IntCounter,
    pub batches_sent: IntCounter,
    pub records_dropped_dlq: IntCounter,
    pub retries: IntCounter,
}

impl SinkMetrics {
    pub fn register_into(registry: &Registry, target: &str) -> SinkMetrics {
        fn counter(registry: &Registry, name: &str, help: &str, target: &str) -> IntCounter {
            let counter =
                IntCounter::with_opts(Opts::new(name, help).const_label("target", target))
                    .expect("metric options are valid");
            registry
                .register(Box::new(counter.clone()))
                .expect("metric registered once per target");
            counter
        }
        SinkMetrics {
            records_sent: counter(
                registry,
                "otb_sink_records_sent_total",
                "Records acknowledged by the ZeroBus endpoint.",
                target,
            ),
            batches_sent: counter(
                registry,
                "otb_sink_batches_sent_total",
                "Batches acknowledged by the ZeroBus endpoint.",
                target,
            ),
            records_dropped_dlq: counter(
                registry,
                "otb_sink_records_dlq_total",
                "Records the endpoint refused permanently, moved to the DLQ.",
                target,
            ),
            retries: counter(
                registry,
                "otb_sink_retries_total",
                "Batch send attempts that failed recoverably and were retried.",
                target,
            ),
        }
    }

    /// An unregistered set, for sinks constructed in tests.
    pub fn unregistered() -> SinkMetrics {
        SinkMetrics::register_into(&Registry::new(), "test")
    }
}
