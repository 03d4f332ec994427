//! Prometheus metrics HTTP endpoint
//!
//! Exposes queue metrics in Prometheus text format at /metrics, live
//! per-service stats as JSON at /stats, and a liveness check at /health.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_NUM_BUCKETS, METRICS_PRIORITY_ORDER, METRICS_WAIT_BOUNDS,
};
use crate::services::engine::{LiveCounts, QueueEngine};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(
    summary: &MetricsSummary,
    live: &[LiveCounts],
    site_id: &str,
) -> String {
    let mut output = String::with_capacity(4096);

    write_token_metrics(&mut output, site_id, summary);
    write_wait_metrics(&mut output, site_id, summary);
    write_intent_metrics(&mut output, site_id, summary);
    write_service_gauges(&mut output, site_id, live);

    output
}

fn write_token_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "queue_tokens_created_total";
    let _ = writeln!(output, "# HELP {name} Tokens issued by priority class");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (priority, count) in METRICS_PRIORITY_ORDER.iter().zip(summary.created_by_priority) {
        let _ = writeln!(
            output,
            "{name}{{site=\"{site}\",priority=\"{}\"}} {count}",
            priority.as_str()
        );
    }

    let counters = [
        ("queue_tokens_called_total", "Tokens bound to a counter", summary.tokens_called),
        ("queue_tokens_serving_total", "Tokens that started service", summary.tokens_serving),
        ("queue_tokens_completed_total", "Tokens completed", summary.tokens_completed),
        ("queue_tokens_cancelled_total", "Tokens cancelled by the citizen", summary.tokens_cancelled),
        ("queue_transfers_total", "Called tokens moved to another counter", summary.transfers),
        ("queue_rescheduled_total", "No-show tokens put back in line", summary.rescheduled),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }

    let name = "queue_no_shows_total";
    let _ = writeln!(output, "# HELP {name} Called tokens that were not answered");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name}{{site=\"{site}\",source=\"timeout\"}} {}", summary.no_show_auto);
    let _ = writeln!(output, "{name}{{site=\"{site}\",source=\"staff\"}} {}", summary.no_show_manual);

    write_metric(
        output,
        "queue_no_show_deadlines_pending",
        "Armed no-show deadlines",
        MetricType::Gauge,
        site,
        summary.pending_no_shows as u64,
    );
}

fn write_wait_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "queue_wait_seconds",
        "Time from join to call in seconds",
        site,
        &summary.wait_buckets,
        &METRICS_WAIT_BOUNDS,
        summary.wait_sum_secs,
    );
}

fn write_intent_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "queue_intents_sent_total",
        "Notification intents accepted by the channel",
        MetricType::Counter,
        site,
        summary.intents_sent,
    );
    write_metric(
        output,
        "queue_intents_dropped_total",
        "Notification intents dropped because the channel was full or closed",
        MetricType::Counter,
        site,
        summary.intents_dropped,
    );
    write_metric(
        output,
        "queue_estimator_fallbacks_total",
        "Wait estimates that fell back to the formula",
        MetricType::Counter,
        site,
        summary.estimator_fallbacks,
    );
}

fn write_service_gauges(output: &mut String, site: &str, live: &[LiveCounts]) {
    let gauges: [(&str, &str, fn(&LiveCounts) -> usize); 4] = [
        ("queue_waiting", "WAITING tokens per service", |c| c.waiting),
        ("queue_called", "CALLED tokens per service", |c| c.called),
        ("queue_serving", "SERVING tokens per service", |c| c.serving),
        ("queue_active_counters", "Active counters per service", |c| c.active_counters),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(output, "# HELP {name} {help}");
        let _ = writeln!(output, "# TYPE {name} gauge");
        for counts in live {
            let _ = writeln!(
                output,
                "{name}{{site=\"{site}\",service=\"{}\"}} {}",
                counts.service_id,
                value(counts)
            );
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn stats_json(engine: &QueueEngine) -> String {
    let stats: Vec<_> =
        engine.service_ids().iter().filter_map(|id| engine.stats_sync(id).ok()).collect();
    match serde_json::to_string(&stats) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "stats_serialize_failed");
            "[]".to_string()
        }
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    engine: Arc<QueueEngine>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let live = engine.live_counts();
            let waiting = live.iter().map(|c| c.waiting).sum();
            let summary = engine.metrics().cumulative(waiting, engine.no_show_monitor().pending());
            let body = format_prometheus_metrics(&summary, &live, &site_id);
            respond(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", body)
        }
        (&Method::GET, "/stats") => respond(StatusCode::OK, "application/json", stats_json(&engine)),
        (&Method::GET, "/health") => respond(StatusCode::OK, "text/plain", "ok"),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    engine: Arc<QueueEngine>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let engine = engine.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let engine = engine.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, engine, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
