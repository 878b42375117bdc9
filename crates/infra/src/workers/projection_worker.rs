use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use readmodel_events::{
    Acknowledge, Applied, Envelope, EnvelopeHandler, HandlerError, Route, Transport,
    TransportClosed,
};

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Name for logging
    pub name: String,
    /// Number of per-key lanes (parallelism across keys)
    pub lanes: usize,
    /// How long to wait for queued work after intake stops
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name: "users-projector".to_string(),
            lanes: 16,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The shutdown signal fired.
    Shutdown,
    /// The transport closed permanently. Callers treat this as fatal.
    TransportClosed(TransportClosed),
}

/// Supervisor runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub received: u64,
    pub absent: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Envelopes applied behind a barrier (see [`Route::Exclusive`]).
    pub exclusive: u64,
    pub lanes_aborted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    absent: AtomicU64,
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    exclusive: AtomicU64,
    lanes_aborted: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            received: self.received.load(Ordering::Relaxed),
            absent: self.absent.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            exclusive: self.exclusive.load(Ordering::Relaxed),
            lanes_aborted: self.lanes_aborted.load(Ordering::Relaxed),
        }
    }
}

/// Envelopes handed to lanes and not finished yet.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `finish` is not missed.
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Lane an envelope with `key` is applied on.
pub(crate) fn lane_index(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Everything needed to apply one envelope, shared by the lanes and the
/// receive loop.
struct Applier<H> {
    name: Arc<str>,
    handler: Arc<H>,
    counters: Arc<Counters>,
    acknowledger: Option<Arc<dyn Acknowledge>>,
}

impl<H> Clone for Applier<H> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: self.handler.clone(),
            counters: self.counters.clone(),
            acknowledger: self.acknowledger.clone(),
        }
    }
}

impl<H> Applier<H>
where
    H: EnvelopeHandler,
{
    /// Apply, count and log one envelope, then settle it with the transport.
    /// Failures are settled too: they are reported, never retried.
    async fn apply(&self, lane: Option<usize>, envelope: &Envelope) {
        let name = &self.name;
        match self.handler.handle(envelope).await {
            Ok(Applied::Skipped) => {
                Counters::bump(&self.counters.skipped);
                debug!(worker = %name, ?lane, action = envelope.action(), "end of stream");
            }
            Ok(applied) => {
                Counters::bump(&self.counters.applied);
                debug!(
                    worker = %name,
                    ?lane,
                    action = envelope.action(),
                    event_id = %envelope.event_id(),
                    ?applied,
                    "envelope applied"
                );
            }
            Err(err) => {
                Counters::bump(&self.counters.failed);
                let meta = envelope.metadata();
                warn!(
                    worker = %name,
                    ?lane,
                    action = envelope.action(),
                    stage = err.stage(),
                    event_id = %meta.event_id,
                    correlation_id = ?meta.correlation_id,
                    position = ?meta.position,
                    error = %err,
                    "error handling event"
                );
            }
        }

        if let Some(acknowledger) = &self.acknowledger {
            acknowledger.ack(envelope.metadata());
        }
    }
}

/// Receives envelopes from a transport and applies them through a handler.
///
/// - Single receive loop; receiving is the only suspension point of intake
///   apart from exclusive envelopes
/// - The handler's [`Route`] places each envelope:
///   - `Keyed`: one of N lanes chosen by hashing the key. A lane applies its
///     envelopes one at a time, in delivery order, so two envelopes with the
///     same key never race
///   - `Unordered`: a lane chosen by the event id
///   - `Exclusive`: intake pauses until every lane is idle, the envelope is
///     applied on the loop itself, then fan-out resumes. It therefore never
///     races anything delivered before or after it
/// - Different keys proceed in parallel; lane queues are unbounded so a slow
///   handler never stalls intake
/// - A failed envelope is logged and counted; it never stops its lane, the
///   loop, or any other envelope
/// - When the transport tracks delivery, each envelope is acknowledged after
///   it was handled; envelopes still queued when lanes are aborted stay
///   unacknowledged and are redelivered
/// - On shutdown or transport closure, intake stops and queued work gets
///   `shutdown_grace` to finish before the remaining lanes are aborted
pub struct ProjectionSupervisor<H> {
    handler: Arc<H>,
    config: SupervisorConfig,
    counters: Arc<Counters>,
}

impl<H> Clone for ProjectionSupervisor<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            config: self.config.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<H> ProjectionSupervisor<H>
where
    H: EnvelopeHandler,
{
    pub fn new(handler: Arc<H>, config: SupervisorConfig) -> Self {
        Self {
            handler,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Current counters (shared by every clone of this supervisor).
    pub fn stats(&self) -> SupervisorStats {
        self.counters.snapshot()
    }

    /// Run until `shutdown` resolves or the transport closes.
    ///
    /// `transport.recv()` is raced against `shutdown`, so the transport's
    /// `recv` must be cancel-safe.
    pub async fn run<T, F>(&self, mut transport: T, shutdown: F) -> SupervisorExit
    where
        T: Transport,
        F: Future<Output = ()> + Send,
    {
        let name: Arc<str> = Arc::from(self.config.name.as_str());
        let lanes = self.config.lanes.max(1);
        let applier = Applier {
            name: name.clone(),
            handler: self.handler.clone(),
            counters: self.counters.clone(),
            acknowledger: transport.acknowledger(),
        };
        let in_flight = Arc::new(InFlight::default());

        let mut tasks = JoinSet::new();
        let mut senders = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            tasks.spawn(lane_loop(lane, applier.clone(), in_flight.clone(), rx));
        }

        info!(worker = %name, lanes, "projection supervisor started");

        tokio::pin!(shutdown);
        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break SupervisorExit::Shutdown,
                delivery = transport.recv() => match delivery {
                    Ok(Some(envelope)) => {
                        Counters::bump(&self.counters.received);
                        let lane = match self.handler.route(&envelope) {
                            Route::Keyed(key) => lane_index(&key, lanes),
                            Route::Unordered => {
                                lane_index(&envelope.event_id().to_string(), lanes)
                            }
                            Route::Exclusive => {
                                Counters::bump(&self.counters.exclusive);
                                // Unacknowledged if shutdown wins: redelivered.
                                tokio::select! {
                                    biased;
                                    _ = &mut shutdown => break SupervisorExit::Shutdown,
                                    _ = in_flight.wait_idle() => {}
                                }
                                applier.apply(None, &envelope).await;
                                continue;
                            }
                        };

                        in_flight.start();
                        if let Err(mpsc::error::SendError(lost)) = senders[lane].send(envelope) {
                            in_flight.finish();
                            Counters::bump(&self.counters.failed);
                            error!(
                                worker = %name,
                                lane,
                                action = lost.action(),
                                event_id = %lost.event_id(),
                                "lane stopped; envelope dropped"
                            );
                        }
                    }
                    Ok(None) => Counters::bump(&self.counters.absent),
                    Err(closed) => break SupervisorExit::TransportClosed(closed),
                },
            }
        };

        match &exit {
            SupervisorExit::Shutdown => info!(worker = %name, "shutdown requested; draining lanes"),
            SupervisorExit::TransportClosed(closed) => {
                error!(worker = %name, reason = closed.reason(), "transport closed; draining lanes")
            }
        }

        // Closing the senders lets every lane finish its queue and return.
        drop(senders);
        self.drain(&name, tasks).await;

        info!(worker = %name, stats = ?self.stats(), "projection supervisor stopped");
        exit
    }

    async fn drain(&self, name: &str, mut tasks: JoinSet<()>) {
        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, join_all(name, &mut tasks)).await;

        if drained.is_err() {
            let remaining = tasks.len() as u64;
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.counters
                .lanes_aborted
                .fetch_add(remaining, Ordering::Relaxed);
            warn!(
                worker = %name,
                lanes = remaining,
                grace_ms = grace.as_millis() as u64,
                "lanes still busy after grace period; aborted"
            );
        }
    }
}

async fn join_all(name: &str, tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            if err.is_panic() {
                error!(worker = %name, error = %err, "lane panicked");
            }
        }
    }
}

async fn lane_loop<H>(
    lane: usize,
    applier: Applier<H>,
    in_flight: Arc<InFlight>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) where
    H: EnvelopeHandler,
{
    while let Some(envelope) = rx.recv().await {
        applier.apply(Some(lane), &envelope).await;
        in_flight.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use readmodel_events::{EnvelopeMetadata, channel};
    use serde::Deserialize;
    use std::sync::Mutex;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("test handler rejected {0}")]
    struct Rejected(String);

    impl HandlerError for Rejected {}

    #[derive(Deserialize)]
    struct Step {
        key: String,
        seq: u64,
        #[serde(default)]
        delay_ms: u64,
        #[serde(default)]
        exclusive: bool,
    }

    /// Records (key, seq) in completion order after sleeping `delay_ms`.
    /// Action "Fail" is rejected.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(String, u64)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        type Error = Rejected;

        async fn handle(&self, envelope: &Envelope) -> Result<Applied, Self::Error> {
            if envelope.action() == "Fail" {
                return Err(Rejected(envelope.action().to_string()));
            }
            if envelope.action() == "EOS" {
                return Ok(Applied::Skipped);
            }
            let step: Step = serde_json::from_slice(envelope.payload())
                .map_err(|e| Rejected(e.to_string()))?;
            if step.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
            }
            self.seen.lock().unwrap().push((step.key, step.seq));
            Ok(Applied::Deleted(0))
        }

        fn route(&self, envelope: &Envelope) -> Route {
            match serde_json::from_slice::<Step>(envelope.payload()) {
                Ok(step) if step.exclusive => Route::Exclusive,
                Ok(step) => Route::Keyed(step.key),
                Err(_) => Route::Unordered,
            }
        }
    }

    /// Collects acknowledged positions.
    #[derive(Default)]
    struct Acks(Mutex<Vec<String>>);

    impl Acknowledge for Acks {
        fn ack(&self, metadata: &EnvelopeMetadata) {
            if let Some(position) = &metadata.position {
                self.0.lock().unwrap().push(position.clone());
            }
        }
    }

    impl Acks {
        fn sorted(&self) -> Vec<String> {
            let mut acked = self.0.lock().unwrap().clone();
            acked.sort();
            acked
        }
    }

    fn step(key: &str, seq: u64, delay_ms: u64) -> Envelope {
        Envelope::from_json(
            "Step",
            &serde_json::json!({ "key": key, "seq": seq, "delay_ms": delay_ms }),
        )
        .unwrap()
    }

    fn exclusive_step(key: &str, seq: u64) -> Envelope {
        Envelope::from_json(
            "Step",
            &serde_json::json!({ "key": key, "seq": seq, "exclusive": true }),
        )
        .unwrap()
    }

    fn at(envelope: Envelope, position: &str) -> Envelope {
        let metadata = EnvelopeMetadata {
            position: Some(position.to_string()),
            ..envelope.metadata().clone()
        };
        envelope.with_metadata(metadata)
    }

    fn supervisor(recorder: Arc<Recorder>, lanes: usize) -> ProjectionSupervisor<Recorder> {
        ProjectionSupervisor::new(
            recorder,
            SupervisorConfig::default()
                .with_name("test")
                .with_lanes(lanes)
                .with_shutdown_grace(Duration::from_secs(5)),
        )
    }

    /// A key landing on a different lane than `key`.
    fn key_on_other_lane(key: &str, lanes: usize) -> String {
        (0..1000)
            .map(|i| format!("other-{i}"))
            .find(|k| lane_index(k, lanes) != lane_index(key, lanes))
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_applied_in_delivery_order() {
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), 8);
        let (tx, transport) = channel(64);

        // The first event is slowest; without per-key lanes it would land last.
        tx.send(step("u1", 1, 80)).await.unwrap();
        tx.send(step("u1", 2, 10)).await.unwrap();
        tx.send(step("u1", 3, 0)).await.unwrap();
        tx.close("done").await;

        let exit = sup.run(transport, std::future::pending()).await;

        assert!(matches!(exit, SupervisorExit::TransportClosed(_)));
        assert_eq!(
            recorder.seen(),
            vec![("u1".to_string(), 1), ("u1".to_string(), 2), ("u1".to_string(), 3)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_key_does_not_block_other_keys() {
        let lanes = 8;
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), lanes);
        let (tx, transport) = channel(64);
        let fast = key_on_other_lane("slow", lanes);

        tx.send(step("slow", 1, 300)).await.unwrap();
        tx.send(step(&fast, 1, 0)).await.unwrap();
        tx.close("done").await;

        sup.run(transport, std::future::pending()).await;

        let seen = recorder.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, fast);
        assert_eq!(seen[1].0, "slow");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exclusive_envelope_waits_for_earlier_work_and_blocks_later_work() {
        let lanes = 8;
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), lanes);
        let (tx, transport) = channel(64);
        let after = key_on_other_lane("slow", lanes);

        tx.send(step("slow", 1, 100)).await.unwrap();
        tx.send(exclusive_step("barrier", 1)).await.unwrap();
        tx.send(step(&after, 1, 0)).await.unwrap();
        tx.close("done").await;

        sup.run(transport, std::future::pending()).await;

        assert_eq!(
            recorder.seen(),
            vec![("slow".to_string(), 1), ("barrier".to_string(), 1), (after, 1)]
        );
        assert_eq!(sup.stats().exclusive, 1);
        assert_eq!(sup.stats().applied, 3);
    }

    #[tokio::test]
    async fn failures_are_counted_and_do_not_stop_processing() {
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), 4);
        let (tx, transport) = channel(64);

        tx.send(step("a", 1, 0)).await.unwrap();
        tx.send(Envelope::new("Fail", "{}").with_ordering_key("a")).await.unwrap();
        tx.send(step("a", 2, 0)).await.unwrap();
        tx.send(Envelope::new("EOS", "")).await.unwrap();
        tx.send_absent().await.unwrap();
        tx.close("done").await;

        sup.run(transport, std::future::pending()).await;

        assert_eq!(recorder.seen(), vec![("a".to_string(), 1), ("a".to_string(), 2)]);
        assert_eq!(
            sup.stats(),
            SupervisorStats {
                received: 4,
                absent: 1,
                applied: 2,
                skipped: 1,
                failed: 1,
                exclusive: 0,
                lanes_aborted: 0,
            }
        );
    }

    #[tokio::test]
    async fn every_handled_envelope_is_acknowledged_including_failures() {
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), 4);
        let acks = Arc::new(Acks::default());
        let (tx, transport) = channel(64);
        let transport = transport.with_acknowledger(acks.clone());

        tx.send(at(step("a", 1, 0), "1-0")).await.unwrap();
        tx.send(at(Envelope::new("Fail", "{}"), "2-0")).await.unwrap();
        tx.send(at(exclusive_step("b", 1), "3-0")).await.unwrap();
        tx.close("done").await;

        sup.run(transport, std::future::pending()).await;

        assert_eq!(acks.sorted(), vec!["1-0", "2-0", "3-0"]);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_work() {
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(recorder.clone(), 2);
        let (tx, transport) = channel(64);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let runner = {
            let sup = sup.clone();
            tokio::spawn(async move {
                sup.run(transport, async {
                    let _ = stop_rx.await;
                })
                .await
            })
        };

        tx.send(step("k", 1, 20)).await.unwrap();
        tx.send(step("k", 2, 20)).await.unwrap();
        // Wait until both are taken off the transport before stopping.
        while sup.stats().received < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(()).unwrap();

        let exit = runner.await.unwrap();
        assert_eq!(exit, SupervisorExit::Shutdown);
        assert_eq!(recorder.seen().len(), 2);
        assert_eq!(sup.stats().lanes_aborted, 0);
    }

    #[tokio::test]
    async fn lanes_busy_past_the_grace_period_are_aborted_unacknowledged() {
        let recorder = Arc::new(Recorder::default());
        let sup = ProjectionSupervisor::new(
            recorder.clone(),
            SupervisorConfig::default()
                .with_lanes(1)
                .with_shutdown_grace(Duration::from_millis(50)),
        );
        let acks = Arc::new(Acks::default());
        let (tx, transport) = channel(8);
        let transport = transport.with_acknowledger(acks.clone());

        tx.send(at(step("stuck", 1, 60_000), "1-0")).await.unwrap();
        tx.send(at(step("queued", 1, 0), "2-0")).await.unwrap();
        tx.close("done").await;

        let started = std::time::Instant::now();
        let exit = sup.run(transport, std::future::pending()).await;

        assert!(matches!(exit, SupervisorExit::TransportClosed(ref c) if c.reason() == "done"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(recorder.seen().is_empty());
        assert!(acks.sorted().is_empty());
        assert_eq!(sup.stats().lanes_aborted, 1);
    }

    #[test]
    fn lane_index_is_stable_and_in_range() {
        for lanes in [1, 3, 16] {
            let lane = lane_index("u1", lanes);
            assert!(lane < lanes);
            assert_eq!(lane, lane_index("u1", lanes));
        }
        assert_eq!(lane_index("anything", 0), 0);
    }
}
