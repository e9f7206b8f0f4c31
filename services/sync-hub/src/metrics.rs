//! Ambient instrumentation: metric name constants for the gauges and
//! counters emitted from `hub`, `pipeline`, and `ws::handler`.
//!
//! Grounded in `VannaDii-RustyGPT`'s `middleware::rate_limit` /
//! `services::stream_supervisor`, which call `metrics::counter!`/`gauge!`
//! directly at the call site rather than behind a facade; this module only
//! centralizes the metric name strings so they can't drift between call
//! sites.

pub const CONNECTIONS_LIVE: &str = "sync_hub_connections_live";
pub const MUTATIONS_TOTAL: &str = "sync_hub_mutations_total";
pub const MUTATIONS_REJECTED_TOTAL: &str = "sync_hub_mutations_rejected_total";
pub const CONNECTIONS_EVICTED_TOTAL: &str = "sync_hub_connections_evicted_total";
pub const CATCHUP_REPLAYED_TOTAL: &str = "sync_hub_catchup_replayed_total";
pub const OUTBOUND_QUEUE_DEPTH: &str = "sync_hub_outbound_queue_depth";
