//! Buffered telemetry recording and aggregate reports.
//!
//! [`TelemetryRecorder`] buffers events in memory and flushes them to the
//! `telemetry` table when the buffer fills or the flush interval elapses.
//! Recording never fails the pipeline: a failed flush is logged with
//! `log::warn!` and the events are retained for the next attempt.
//!
//! Cost figures are rough estimates: whitespace token counts scaled by 1.3,
//! priced against a per-model USD/1k-token table with a fallback rate.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::TelemetryConfig;
use crate::models::{EventStatus, OperationType, TelemetryEvent};

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Scale a whitespace token count by 1.3 to approximate subword
/// tokenization. For cost purposes only, never for chunk boundaries.
pub fn estimate_tokens(token_count: usize) -> usize {
    (token_count as f64 * 1.3) as usize
}

/// Estimated USD cost for `tokens` tokens under `model`.
pub fn token_cost(model: &str, tokens: usize) -> f64 {
    // Approximate USD per 1k tokens
    let per_1k = match model {
        "text-embedding-ada-002" => 0.0001,
        "text-embedding-3-small" => 0.00002,
        "text-embedding-3-large" => 0.00013,
        "mistral-large" => 0.008,
        "mistral-7b" => 0.0002,
        "llama2-70b-chat" => 0.0007,
        "gemma-7b" => 0.0002,
        "mixtral-8x7b" => 0.0007,
        "reka-flash" => 0.0005,
        _ => 0.001,
    };
    (tokens as f64 / 1000.0) * per_1k
}

/// Build a finished event from an operation's start time and outcome.
pub fn event(
    operation: OperationType,
    operation_id: &str,
    started_at_ms: i64,
    status: EventStatus,
    error_detail: Option<String>,
    cost_estimate: f64,
    metrics: serde_json::Value,
) -> TelemetryEvent {
    let ended_at_ms = now_ms();
    TelemetryEvent {
        id: Uuid::new_v4().to_string(),
        operation,
        operation_id: operation_id.to_string(),
        started_at_ms,
        ended_at_ms,
        duration_ms: (ended_at_ms - started_at_ms).max(0),
        status,
        error_detail,
        cost_estimate,
        metrics_json: metrics.to_string(),
    }
}

struct Buffer {
    events: Vec<TelemetryEvent>,
    last_flush: Instant,
}

pub struct TelemetryRecorder {
    pool: SqlitePool,
    buffer: Mutex<Buffer>,
    buffer_size: usize,
    flush_interval: Duration,
}

impl TelemetryRecorder {
    pub fn new(pool: SqlitePool, config: &TelemetryConfig) -> Self {
        Self {
            pool,
            buffer: Mutex::new(Buffer {
                events: Vec::new(),
                last_flush: Instant::now(),
            }),
            buffer_size: config.buffer_size,
            flush_interval: Duration::from_secs(config.flush_interval_secs),
        }
    }

    // The buffer holds plain data, so a poisoned lock still has a usable
    // inner value. Recover it rather than drop events.
    fn locked(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an event to the buffer. Synchronous, infallible, never drops.
    pub fn record(&self, event: TelemetryEvent) {
        self.locked().events.push(event);
    }

    /// Whether the buffer has hit its size or age limit.
    pub fn should_flush(&self) -> bool {
        let buf = self.locked();
        !buf.events.is_empty()
            && (buf.events.len() >= self.buffer_size
                || buf.last_flush.elapsed() >= self.flush_interval)
    }

    /// Flush if the size or interval trigger has fired.
    pub async fn maybe_flush(&self) {
        if self.should_flush() {
            self.flush().await;
        }
    }

    /// Persist all buffered events. On failure the events go back into the
    /// buffer and a warning is logged; the pipeline is never aborted.
    pub async fn flush(&self) {
        let drained: Vec<TelemetryEvent> = {
            let mut buf = self.locked();
            buf.last_flush = Instant::now();
            std::mem::take(&mut buf.events)
        };

        if drained.is_empty() {
            return;
        }

        if let Err(e) = self.write_events(&drained).await {
            log::warn!("telemetry flush failed, retaining {} events: {}", drained.len(), e);
            let mut buf = self.locked();
            let mut retained = drained;
            retained.append(&mut buf.events);
            buf.events = retained;
        }
    }

    async fn write_events(&self, events: &[TelemetryEvent]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for ev in events {
            sqlx::query(
                r#"
                INSERT INTO telemetry
                    (id, operation, operation_id, started_at_ms, ended_at_ms,
                     duration_ms, status, error_detail, cost_estimate, metrics_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ev.id)
            .bind(ev.operation.as_str())
            .bind(&ev.operation_id)
            .bind(ev.started_at_ms)
            .bind(ev.ended_at_ms)
            .bind(ev.duration_ms)
            .bind(ev.status.as_str())
            .bind(&ev.error_detail)
            .bind(ev.cost_estimate)
            .bind(&ev.metrics_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// ============ Aggregate reports ============

#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub count: i64,
    pub success_count: i64,
    pub success_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
pub struct CostLine {
    pub operation: String,
    pub total_cost: f64,
    /// Share of the overall cost, 0–100.
    pub share_pct: f64,
}

/// Aggregate metrics over the last `hours` hours, optionally restricted to
/// one operation type.
pub async fn query_metrics(
    pool: &SqlitePool,
    hours: i64,
    operation: Option<OperationType>,
) -> Result<MetricsReport, sqlx::Error> {
    let cutoff = now_ms() - hours * 3600 * 1000;

    let rows = match operation {
        Some(op) => {
            sqlx::query(
                "SELECT duration_ms, status, cost_estimate FROM telemetry
                 WHERE started_at_ms >= ? AND operation = ? ORDER BY duration_ms",
            )
            .bind(cutoff)
            .bind(op.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT duration_ms, status, cost_estimate FROM telemetry
                 WHERE started_at_ms >= ? ORDER BY duration_ms",
            )
            .bind(cutoff)
            .fetch_all(pool)
            .await?
        }
    };

    let durations: Vec<i64> = rows.iter().map(|r| r.get("duration_ms")).collect();
    let count = durations.len() as i64;
    let success_count = rows
        .iter()
        .filter(|r| r.get::<String, _>("status") == "success")
        .count() as i64;
    let total_cost: f64 = rows.iter().map(|r| r.get::<f64, _>("cost_estimate")).sum();

    if count == 0 {
        return Ok(MetricsReport {
            count: 0,
            success_count: 0,
            success_rate: 0.0,
            avg_ms: 0.0,
            p50_ms: 0,
            p95_ms: 0,
            total_cost: 0.0,
        });
    }

    let avg_ms = durations.iter().sum::<i64>() as f64 / count as f64;

    Ok(MetricsReport {
        count,
        success_count,
        success_rate: success_count as f64 / count as f64,
        avg_ms,
        p50_ms: percentile(&durations, 0.50),
        p95_ms: percentile(&durations, 0.95),
        total_cost,
    })
}

/// Per-operation cost totals and shares over the last `hours` hours.
/// Operations with zero recorded cost are omitted.
pub async fn cost_breakdown(pool: &SqlitePool, hours: i64) -> Result<Vec<CostLine>, sqlx::Error> {
    let cutoff = now_ms() - hours * 3600 * 1000;

    let rows = sqlx::query(
        "SELECT operation, SUM(cost_estimate) AS total FROM telemetry
         WHERE started_at_ms >= ?
         GROUP BY operation
         HAVING total > 0
         ORDER BY total DESC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let grand_total: f64 = rows.iter().map(|r| r.get::<f64, _>("total")).sum();

    Ok(rows
        .iter()
        .map(|r| {
            let total: f64 = r.get("total");
            CostLine {
                operation: r.get("operation"),
                total_cost: total,
                share_pct: if grand_total > 0.0 {
                    total / grand_total * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct ErrorGroup {
    pub operation: String,
    pub count: i64,
    /// Up to three distinct recent error messages.
    pub samples: Vec<String>,
}

/// Failures over the last `hours` hours, grouped by operation with sample
/// messages, most frequent operation first.
pub async fn error_analysis(
    pool: &SqlitePool,
    hours: i64,
) -> Result<Vec<ErrorGroup>, sqlx::Error> {
    let cutoff = now_ms() - hours * 3600 * 1000;

    let rows = sqlx::query(
        "SELECT operation, error_detail FROM telemetry
         WHERE started_at_ms >= ? AND status = 'failure'
         ORDER BY operation, started_at_ms DESC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<ErrorGroup> = Vec::new();
    for row in &rows {
        let operation: String = row.get("operation");
        let detail: Option<String> = row.get("error_detail");

        if groups.last().map(|g| g.operation.as_str()) != Some(operation.as_str()) {
            groups.push(ErrorGroup {
                operation,
                count: 0,
                samples: Vec::new(),
            });
        }
        if let Some(group) = groups.last_mut() {
            group.count += 1;
            if let Some(detail) = detail {
                if group.samples.len() < 3 && !group.samples.contains(&detail) {
                    group.samples.push(detail);
                }
            }
        }
    }

    groups.sort_by(|a, b| b.count.cmp(&a.count));
    Ok(groups)
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[i64], p: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
