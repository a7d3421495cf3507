use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::error::Result;

pub struct Observability {
    poll_records_total: AtomicU64,
    poll_bytes_total: AtomicU64,
    transfers_total: AtomicU64,
    transfers_deferred_total: AtomicU64,
    deliveries_total: AtomicU64,
    offset_commits_total: AtomicU64,
    produce_records_total: AtomicU64,
    produce_bytes_total: AtomicU64,
    endpoints_opened_total: AtomicU64,
    endpoints_closed_total: AtomicU64,
    endpoint_errors_total: AtomicU64,
}

impl Observability {
    fn new() -> Self {
        Self {
            poll_records_total: AtomicU64::new(0),
            poll_bytes_total: AtomicU64::new(0),
            transfers_total: AtomicU64::new(0),
            transfers_deferred_total: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            offset_commits_total: AtomicU64::new(0),
            produce_records_total: AtomicU64::new(0),
            produce_bytes_total: AtomicU64::new(0),
            endpoints_opened_total: AtomicU64::new(0),
            endpoints_closed_total: AtomicU64::new(0),
            endpoint_errors_total: AtomicU64::new(0),
        }
    }

    pub fn record_poll(&self, records: usize, bytes: usize) {
        self.poll_records_total
            .fetch_add(records as u64, Ordering::Relaxed);
        self.poll_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_transfer(&self) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.transfers_deferred_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, partitions: usize) {
        self.offset_commits_total
            .fetch_add(partitions as u64, Ordering::Relaxed);
    }

    pub fn record_produce(&self, records: usize, bytes: usize) {
        self.produce_records_total
            .fetch_add(records as u64, Ordering::Relaxed);
        self.produce_bytes_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_endpoint_opened(&self) {
        self.endpoints_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_closed(&self) {
        self.endpoints_closed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_error(&self) {
        self.endpoint_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("ambridge_poll_records_total", &self.poll_records_total),
            ("ambridge_poll_bytes_total", &self.poll_bytes_total),
            ("ambridge_transfers_total", &self.transfers_total),
            (
                "ambridge_transfers_deferred_total",
                &self.transfers_deferred_total,
            ),
            ("ambridge_deliveries_total", &self.deliveries_total),
            ("ambridge_offset_commits_total", &self.offset_commits_total),
            ("ambridge_produce_records_total", &self.produce_records_total),
            ("ambridge_produce_bytes_total", &self.produce_bytes_total),
            (
                "ambridge_endpoints_opened_total",
                &self.endpoints_opened_total,
            ),
            (
                "ambridge_endpoints_closed_total",
                &self.endpoints_closed_total,
            ),
            ("ambridge_endpoint_errors_total", &self.endpoint_errors_total),
        ];
        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }
        out
    }
}

static OBS: OnceLock<Observability> = OnceLock::new();

pub fn observability() -> &'static Observability {
    OBS.get_or_init(Observability::new)
}

/// Serve `/metrics` and `/healthz` on `addr`.
pub async fn serve_metrics(addr: String) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(|| async { observability().render_prometheus() }))
        .route("/healthz", get(|| async { "ok" }));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("metrics listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
