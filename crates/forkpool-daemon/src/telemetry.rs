//! Pool counters exported through `OpenTelemetry` when the `metrics` feature
//! is enabled; no-ops otherwise.

#[cfg(feature = "metrics")]
mod otel {
    use std::sync::OnceLock;

    use opentelemetry::KeyValue;
    use opentelemetry::metrics::Counter;

    pub struct Counters {
        pub clients: Counter<u64>,
        pub evicted_bytes: Counter<u64>,
    }

    pub fn counters() -> &'static Counters {
        static COUNTERS: OnceLock<Counters> = OnceLock::new();
        COUNTERS.get_or_init(|| {
            let meter = opentelemetry::global::meter(forkpool_core::metrics::SCOPE);
            Counters {
                clients: meter
                    .u64_counter("forkpool.clients")
                    .with_description("Worker client lifecycle transitions")
                    .build(),
                evicted_bytes: meter
                    .u64_counter("forkpool.evicted_bytes")
                    .with_description("Estimated bytes freed by idle worker eviction")
                    .with_unit("By")
                    .build(),
            }
        })
    }

    pub fn client_event(event: &'static str) {
        counters().clients.add(1, &[KeyValue::new("event", event)]);
    }
}

/// A worker process was spawned.
pub fn client_spawned() {
    #[cfg(feature = "metrics")]
    otel::client_event("spawned");
}

/// An idle worker was reused.
pub fn client_reused() {
    #[cfg(feature = "metrics")]
    otel::client_event("reused");
}

/// A worker was discarded after a broken call.
pub fn client_discarded() {
    #[cfg(feature = "metrics")]
    otel::client_event("discarded");
}

/// `count` idle workers were evicted, freeing an estimated `bytes`.
pub fn clients_evicted(count: usize, bytes: u64) {
    #[cfg(feature = "metrics")]
    {
        let counters = otel::counters();
        counters.clients.add(
            count as u64,
            &[opentelemetry::KeyValue::new("event", "evicted")],
        );
        counters.evicted_bytes.add(bytes, &[]);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (count, bytes);
}
