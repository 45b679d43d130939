use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLookupLabels {
    pub layer: CacheLayer,
    pub result: LookupResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheLayer {
    Visibility,
    UserRepo,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LookupResult {
    Hit,
    Miss,
    /// Present but past its `expires_at`.
    Stale,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheErrorLabels {
    pub op: CacheOp,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheOp {
    Get,
    Set,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteLabels {
    pub service_id: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Ok,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- cache --
    pub cache_lookups: Family<CacheLookupLabels, Counter>,
    pub cache_errors: Family<CacheErrorLabels, Counter>,

    // -- code host API --
    pub remote_fetches: Family<RemoteLabels, Counter>,
    pub bulk_listings: Family<RemoteLabels, Counter>,

    // -- requests --
    pub resolve_duration_seconds: Histogram,
    pub http_requests: Family<EndpointLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_lookups = Family::<CacheLookupLabels, Counter>::default();
        registry.register(
            "forgeperm_cache_lookups",
            "Permission cache lookups by layer and result",
            cache_lookups.clone(),
        );

        let cache_errors = Family::<CacheErrorLabels, Counter>::default();
        registry.register(
            "forgeperm_cache_errors",
            "Permission cache transport or codec errors by operation",
            cache_errors.clone(),
        );

        let remote_fetches = Family::<RemoteLabels, Counter>::default();
        registry.register(
            "forgeperm_remote_fetches",
            "Per-repository code host visibility fetches by outcome",
            remote_fetches.clone(),
        );

        let bulk_listings = Family::<RemoteLabels, Counter>::default();
        registry.register(
            "forgeperm_bulk_listings",
            "Accessible-repository listings by outcome",
            bulk_listings.clone(),
        );

        let resolve_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 14));
        registry.register(
            "forgeperm_resolve_duration_seconds",
            "Permission resolution latency per code host in seconds",
            resolve_duration_seconds.clone(),
        );

        let http_requests = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgeperm_http_requests",
            "HTTP requests by endpoint",
            http_requests.clone(),
        );

        Self {
            cache_lookups,
            cache_errors,
            remote_fetches,
            bulk_listings,
            resolve_duration_seconds,
            http_requests,
        }
    }

    /// Metrics that are recorded but never exported.  Default for
    /// providers built without a registry.
    pub fn unregistered() -> Arc<Self> {
        Arc::new(Self::new(&mut Registry::default()))
    }

    pub fn lookup(&self, layer: CacheLayer, result: LookupResult) {
        self.cache_lookups
            .get_or_create(&CacheLookupLabels { layer, result })
            .inc();
    }

    pub fn cache_error(&self, op: CacheOp) {
        self.cache_errors.get_or_create(&CacheErrorLabels { op }).inc();
    }

    pub fn remote_fetch(&self, service_id: &str, outcome: Outcome) {
        self.remote_fetches
            .get_or_create(&RemoteLabels {
                service_id: service_id.to_owned(),
                outcome,
            })
            .inc();
    }

    pub fn bulk_listing(&self, service_id: &str, outcome: Outcome) {
        self.bulk_listings
            .get_or_create(&RemoteLabels {
                service_id: service_id.to_owned(),
                outcome,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
