//! Benchmark driver: fire N concurrent calls, time the batch.
//!
//! Each call runs on its own task and reports `(id, outcome)` on a shared
//! channel; the driver is the only consumer and counts results down. The
//! first failure aborts every remaining call.

use crate::call::{Request, Transport};
use crate::error::BenchError;
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One successful call, in the order it finished.
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: u64,
    pub message: String,
    pub completed_at: DateTime<Utc>,
    /// Time from dispatch to response.
    pub latency: Duration,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct Report {
    pub transport: &'static str,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Completion order, first finished first.
    pub completions: Vec<Completion>,
}

impl Report {
    /// Ids in the order their responses arrived.
    pub fn order(&self) -> Vec<u64> {
        self.completions.iter().map(|c| c.id).collect()
    }

    /// Human-readable summary for stdout.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "--- All requests finished in {:?} ---",
            self.elapsed
        );
        let _ = writeln!(out, "transport:        {}", self.transport);
        let _ = writeln!(out, "calls:            {}", self.completions.len());
        let _ = writeln!(out, "completion order: {:?}", self.order());
        for c in &self.completions {
            let offset = (c.completed_at - self.started_at)
                .to_std()
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "  request {:<3} +{:>9.3?}  latency {:>9.3?}  {}",
                c.id, offset, c.latency, c.message
            );
        }
        out
    }
}

/// Dispatch `calls` concurrent requests over `transport` and wait for all
/// of them. `on_complete` sees each success as it lands.
pub async fn run<T, F>(
    transport: Arc<T>,
    calls: usize,
    mut on_complete: F,
) -> Result<Report, BenchError>
where
    T: Transport,
    F: FnMut(&Completion),
{
    let started_at = Utc::now();
    let start = Instant::now();
    info!(transport = transport.name(), calls, "Starting run");

    let (results, mut inbox) = mpsc::channel(calls.max(1));
    let mut workers = JoinSet::new();
    for id in 0..calls as u64 {
        let transport = Arc::clone(&transport);
        let results = results.clone();
        workers.spawn(async move {
            let dispatched = Instant::now();
            let outcome = transport.call(Request::numbered(id)).await;
            // The driver stops listening only after aborting the run
            let _ = results.send((id, dispatched.elapsed(), outcome)).await;
        });
    }
    drop(results);

    let mut completions = Vec::with_capacity(calls);
    while completions.len() < calls {
        let Some((id, latency, outcome)) = inbox.recv().await else {
            break;
        };
        match outcome {
            Ok(response) => {
                debug!(id, latency_ms = latency.as_millis() as u64, "Call completed");
                let completion = Completion {
                    id: response.id,
                    message: response.message,
                    completed_at: response.completed_at,
                    latency,
                };
                on_complete(&completion);
                completions.push(completion);
            }
            Err(source) => {
                warn!(id, error = %source, "Call failed, aborting run");
                workers.shutdown().await;
                return Err(BenchError::Call { id, source });
            }
        }
    }
    let elapsed = start.elapsed();

    // A worker that panicked never reported
    while let Some(joined) = workers.join_next().await {
        joined?;
    }
    if completions.len() < calls {
        return Err(BenchError::Lost {
            missing: calls - completions.len(),
            expected: calls,
        });
    }

    info!(
        transport = transport.name(),
        calls,
        elapsed_ms = elapsed.as_millis() as u64,
        "Run finished"
    );
    Ok(Report {
        transport: transport.name(),
        started_at,
        elapsed,
        completions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Response;
    use crate::error::CallError;
    use crate::protocols::http::{HttpClient, HttpServer};
    use crate::protocols::mux::{MuxClient, MuxServer};
    use std::collections::HashSet;
    use std::future::Future;

    /// Answers after `delays[id]`; fails ids listed in `fail`.
    struct Scripted {
        delays: Vec<Duration>,
        fail: Vec<u64>,
    }

    impl Transport for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn call(&self, request: Request) -> impl Future<Output = Result<Response, CallError>> + Send {
            let delay = self.delays[request.id as usize];
            let fail = self.fail.contains(&request.id);
            async move {
                tokio::time::sleep(delay).await;
                if fail {
                    Err(CallError::TransportClosed)
                } else {
                    Ok(Response::new(request.id, request.name))
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_completion_order() {
        let transport = Arc::new(Scripted {
            delays: vec![
                Duration::from_millis(30),
                Duration::from_millis(10),
                Duration::from_millis(20),
            ],
            fail: vec![],
        });

        let mut seen = Vec::new();
        let report = run(transport, 3, |c| seen.push(c.id)).await.unwrap();
        assert_eq!(report.order(), vec![1, 2, 0]);
        assert_eq!(seen, vec![1, 2, 0]);
        assert_eq!(report.completions[0].message, "Request-1");
        assert!(report.elapsed >= Duration::from_millis(30));
        assert!(report.render().contains("completion order: [1, 2, 0]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_aborts_run() {
        let transport = Arc::new(Scripted {
            delays: vec![Duration::from_secs(60), Duration::from_millis(5)],
            fail: vec![1],
        });

        let started = Instant::now();
        match run(transport, 2, |_| {}).await {
            Err(BenchError::Call { id: 1, .. }) => {}
            other => panic!("unexpected: {:?}", other.map(|r| r.order())),
        }
        // Did not wait for the slow call
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_calls() {
        let transport = Arc::new(Scripted {
            delays: vec![],
            fail: vec![],
        });
        let report = run(transport, 0, |_| {}).await.unwrap();
        assert!(report.completions.is_empty());
    }

    #[tokio::test]
    async fn test_mux_calls_run_in_parallel() {
        let delay = Duration::from_millis(400);
        let server = MuxServer::bind("127.0.0.1:0", delay).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let stats = server.stats();
        tokio::spawn(server.run());

        let client = Arc::new(MuxClient::connect(&addr).await.unwrap());
        let report = run(client, 5, |_| {}).await.unwrap();

        let ids: HashSet<u64> = report.order().into_iter().collect();
        assert_eq!(ids, (0..5).collect());
        for c in &report.completions {
            assert_eq!(c.message, format!("Hello Request-{}", c.id));
        }
        assert!(report.elapsed >= delay);
        assert!(report.elapsed < delay * 5 / 4, "took {:?}", report.elapsed);
        assert_eq!(stats.connections(), 1);
    }

    #[tokio::test]
    async fn test_http_serial_server_without_pool_is_sequential() {
        let delay = Duration::from_millis(400);
        let server = HttpServer::bind("127.0.0.1:0", delay, true).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let stats = server.stats();
        tokio::spawn(server.run());

        let client = Arc::new(HttpClient::new(addr, false));
        let report = run(client, 5, |_| {}).await.unwrap();

        assert_eq!(report.completions.len(), 5);
        assert!(report.elapsed >= delay * 5);
        assert!(report.elapsed < delay * 21 / 4, "took {:?}", report.elapsed);
        assert_eq!(stats.connections(), 5);
    }

    #[tokio::test]
    async fn test_http_concurrent_server_runs_in_parallel() {
        let delay = Duration::from_millis(300);
        let server = HttpServer::bind("127.0.0.1:0", delay, false).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let stats = server.stats();
        tokio::spawn(server.run());

        let client = Arc::new(HttpClient::new(addr, true));
        let report = run(client, 5, |_| {}).await.unwrap();

        assert!(report.elapsed < delay * 2, "took {:?}", report.elapsed);
        // One connection per concurrent call, unlike the multiplexed transport
        assert_eq!(stats.connections(), 5);
    }
}
