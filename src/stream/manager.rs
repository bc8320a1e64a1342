use super::backoff::{Backoff, BackoffPolicy};
use super::state::{ConnectionState, Phase, StateSnapshot};
use super::{Connection, HeartbeatSink, PayloadStream, StreamConnector, StreamError};
use crate::delivery::queue::{DeliveryQueue, Drainer};
use crate::pipeline::Pipeline;
use crate::shutdown::Shutdown;
use futures::StreamExt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSink = Arc<Mutex<Option<Box<dyn HeartbeatSink>>>>;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub heartbeat_interval: Duration,
    /// Upper bound on how long any loop waits before rechecking shutdown.
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub max_reconnect_attempts: u32,
    /// `None` disables the periodic stats line.
    pub stats_interval: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("gave up after {attempts} reconnect attempts, last error: {last_error}")]
    ReconnectsExhausted { attempts: u32, last_error: String },

    #[error("connection manager was already started")]
    AlreadyStarted,
}

/// Owns the feed connection: connect, read, heartbeat, reconnect, stop.
pub struct ConnectionManager {
    connector: Arc<dyn StreamConnector>,
    pipeline: Arc<Pipeline>,
    settings: ManagerSettings,
    state: Arc<ConnectionState>,
    shutdown: Shutdown,
    drainer: std::sync::Mutex<Option<Drainer>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    active_sink: Mutex<Option<SharedSink>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        pipeline: Pipeline,
        drainer: Drainer,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            connector,
            pipeline: Arc::new(pipeline),
            settings,
            state: Arc::new(ConnectionState::default()),
            shutdown: Shutdown::new(),
            drainer: std::sync::Mutex::new(Some(drainer)),
            background: Mutex::new(Vec::new()),
            heartbeat_task: Mutex::new(None),
            active_sink: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot(self.pipeline.queue().stats())
    }

    /// Run until [`stop`](Self::stop) is called or reconnects run out.
    ///
    /// Either way the manager is `Stopped` and its tasks joined when this
    /// returns.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let drainer = self
            .drainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ManagerError::AlreadyStarted)?;

        {
            let mut background = self.background.lock().await;
            background.push(tokio::spawn(drainer.run(self.shutdown.clone())));
            if let Some(interval) = self.settings.stats_interval {
                background.push(tokio::spawn(report_stats(
                    Arc::clone(&self.state),
                    self.pipeline.queue().clone(),
                    interval,
                    self.settings.poll_interval,
                    self.shutdown.clone(),
                )));
            }
        }

        let mut backoff = Backoff::new(self.settings.backoff, self.settings.max_reconnect_attempts);

        while !self.shutdown.is_triggered() {
            self.state.set_phase(Phase::Connecting);
            let failure = match self.connector.connect().await {
                Ok(mut connection) => {
                    if self.shutdown.is_triggered() {
                        // Stopped while the handshake was in flight.
                        let _ =
                            tokio::time::timeout(CLOSE_TIMEOUT, connection.heartbeat.close()).await;
                        break;
                    }
                    self.state.record_connected();
                    backoff.reset();
                    tracing::info!("connected to event feed");
                    match self.run_connection(connection).await {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if self.shutdown.is_triggered() {
                break;
            }

            let Some(delay) = backoff.next_delay() else {
                self.state.record_failure(backoff.attempts());
                tracing::error!(
                    max_attempts = backoff.max_attempts(),
                    error = %failure,
                    "reconnect attempts exhausted, shutting down"
                );
                self.stop().await;
                return Err(ManagerError::ReconnectsExhausted {
                    attempts: backoff.max_attempts(),
                    last_error: failure.to_string(),
                });
            };

            self.state.record_failure(backoff.attempts());
            tracing::warn!(
                attempt = backoff.attempts(),
                max_attempts = backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "connection lost, reconnecting"
            );

            if !pause(delay, self.settings.poll_interval, &[&self.shutdown]).await {
                break;
            }
            self.state.set_phase(Phase::Disconnected);
        }

        self.stop().await;
        Ok(())
    }

    /// Raise shutdown, close the live connection, and join every task.
    /// Safe to call any number of times, from any task.
    pub async fn stop(&self) {
        if self.shutdown.trigger() {
            tracing::info!("stopping connection manager");
        }

        let sink = self.active_sink.lock().await.take();
        if let Some(sink) = sink {
            close_sink(&sink).await;
        }

        let heartbeat = self.heartbeat_task.lock().await.take();
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "heartbeat task ended abnormally");
            }
        }

        let mut background = self.background.lock().await;
        for handle in background.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }

        self.state.set_phase(Phase::Stopped);
    }

    /// Drive one established connection. `Ok` only when shutdown ended it.
    async fn run_connection(&self, connection: Connection) -> Result<(), StreamError> {
        let Connection {
            mut payloads,
            heartbeat,
        } = connection;

        let sink: SharedSink = Arc::new(Mutex::new(Some(heartbeat)));
        let connection_done = Shutdown::new();
        *self.active_sink.lock().await = Some(Arc::clone(&sink));
        *self.heartbeat_task.lock().await = Some(tokio::spawn(heartbeat_loop(
            Arc::clone(&sink),
            Arc::clone(&self.state),
            self.settings.heartbeat_interval,
            self.settings.poll_interval,
            self.shutdown.clone(),
            connection_done.clone(),
        )));

        self.state.set_phase(Phase::Reading);
        let outcome = self.read_until_closed(&mut payloads).await;

        connection_done.trigger();
        let heartbeat = self.heartbeat_task.lock().await.take();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }
        let sink = self.active_sink.lock().await.take();
        if let Some(sink) = sink {
            close_sink(&sink).await;
        }

        outcome
    }

    async fn read_until_closed(&self, payloads: &mut PayloadStream) -> Result<(), StreamError> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            match tokio::time::timeout(self.settings.poll_interval, payloads.next()).await {
                Err(_elapsed) => continue,
                Ok(None) => return Err(StreamError::Closed),
                Ok(Some(Err(e))) => return Err(e),
                Ok(Some(Ok(payload))) => {
                    self.state.record_message();
                    self.pipeline.handle(&payload);
                }
            }
        }
    }
}

/// Sleep for `total`, rechecking `flags` at least every `slice`.
/// Returns `false` if a flag was raised before the time ran out.
async fn pause(total: Duration, slice: Duration, flags: &[&Shutdown]) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if flags.iter().any(|flag| flag.is_triggered()) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(slice)).await;
    }
}

async fn close_sink(sink: &SharedSink) {
    let close = async {
        let taken = sink.lock().await.take();
        if let Some(mut heartbeat) = taken {
            heartbeat.close().await
        } else {
            Ok(())
        }
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
        Ok(Ok(())) => tracing::debug!("connection closed"),
        Ok(Err(e)) => tracing::debug!(error = %e, "error while closing connection"),
        Err(_) => tracing::warn!("timed out closing connection"),
    }
}

async fn heartbeat_loop(
    sink: SharedSink,
    state: Arc<ConnectionState>,
    interval: Duration,
    slice: Duration,
    shutdown: Shutdown,
    connection_done: Shutdown,
) {
    while pause(interval, slice, &[&shutdown, &connection_done]).await {
        let mut guard = sink.lock().await;
        let Some(heartbeat) = guard.as_mut() else {
            break;
        };
        match heartbeat.ping().await {
            Ok(()) => {
                state.record_heartbeat();
                tracing::trace!("heartbeat sent");
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat failed");
                break;
            }
        }
    }
}

async fn report_stats(
    state: Arc<ConnectionState>,
    queue: DeliveryQueue,
    interval: Duration,
    slice: Duration,
    shutdown: Shutdown,
) {
    while pause(interval, slice, &[&shutdown]).await {
        let snapshot = state.snapshot(queue.stats());
        tracing::info!(
            phase = ?snapshot.phase,
            messages = snapshot.messages,
            errors = snapshot.errors,
            connects = snapshot.connects,
            consecutive_failures = snapshot.consecutive_failures,
            uptime_secs = ?snapshot.uptime_secs,
            last_heartbeat_at = ?snapshot.last_heartbeat_at,
            delivered = snapshot.delivery.delivered,
            failed = snapshot.delivery.failed,
            pending = snapshot.delivery.pending(),
            "connection stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::queue::{delivery_channel, tests::RecordingSender};
    use crate::event::EventKind;
    use crate::formatter::Formatter;
    use crate::parser::EventParser;
    use crate::timestamp::DisplayZone;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    enum Step {
        Fail,
        /// Serve these payloads, then either close or stay open.
        Serve(Vec<&'static str>, bool),
        /// Wait, then serve an open connection.
        SlowServe(Duration),
    }

    #[derive(Default)]
    struct SinkCounters {
        pings: AtomicU32,
        closed: AtomicBool,
    }

    struct FakeSink {
        counters: Arc<SinkCounters>,
    }

    #[async_trait]
    impl HeartbeatSink for FakeSink {
        async fn ping(&mut self) -> Result<(), StreamError> {
            self.counters.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), StreamError> {
            self.counters.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedConnector {
        script: std::sync::Mutex<VecDeque<Step>>,
        attempts: AtomicU32,
        counters: Arc<SinkCounters>,
    }

    impl ScriptedConnector {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: std::sync::Mutex::new(steps.into()),
                attempts: AtomicU32::new(0),
                counters: Arc::new(SinkCounters::default()),
            }
        }
    }

    #[async_trait]
    impl StreamConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Connection, StreamError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Fail);
            let (items, keep_open) = match step {
                Step::Fail => return Err(StreamError::Connect("refused".to_string())),
                Step::Serve(items, keep_open) => (items, keep_open),
                Step::SlowServe(delay) => {
                    tokio::time::sleep(delay).await;
                    (Vec::new(), true)
                }
            };
            let served = futures::stream::iter(
                items
                    .into_iter()
                    .map(|item| Ok::<_, StreamError>(item.to_string()))
                    .collect::<Vec<_>>(),
            );
            let payloads = if keep_open {
                served.chain(futures::stream::pending()).boxed()
            } else {
                served.boxed()
            };
            Ok(Connection {
                payloads,
                heartbeat: Box::new(FakeSink {
                    counters: Arc::clone(&self.counters),
                }),
            })
        }
    }

    fn settings(max_reconnect_attempts: u32) -> ManagerSettings {
        ManagerSettings {
            heartbeat_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                growth: 1.01,
                cap_exponent: 5,
                max_delay: Duration::from_millis(20),
            },
            max_reconnect_attempts,
            stats_interval: Some(Duration::from_millis(20)),
        }
    }

    fn manager(
        connector: Arc<ScriptedConnector>,
        sender: Arc<RecordingSender>,
        max_reconnect_attempts: u32,
    ) -> Arc<ConnectionManager> {
        let zone = DisplayZone::Named(chrono_tz::UTC);
        let (queue, drainer) = delivery_channel(sender, "chat", Duration::from_millis(5));
        let pipeline = Pipeline::new(
            EventParser::new(zone),
            Formatter::new(4096, 5, zone),
            queue,
            None,
        );
        Arc::new(ConnectionManager::new(
            connector,
            pipeline,
            drainer,
            settings(max_reconnect_attempts),
        ))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_failures_and_delivers_in_order() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Serve(vec!["alpha", "bravo"], false),
            Step::Serve(vec!["charlie"], true),
        ]));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector.clone(), sender.clone(), 10);

        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move { runner.start().await });

        wait_until(|| manager.snapshot().delivery.delivered >= 3).await;
        wait_until(|| manager.state().phase() == Phase::Reading).await;

        let bodies = sender.bodies();
        assert_eq!(bodies.len(), 3);
        assert!(bodies[0].contains("alpha"));
        assert!(bodies[1].contains("bravo"));
        assert!(bodies[2].contains("charlie"));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.phase, Phase::Reading);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.connects, 2);
        assert_eq!(snapshot.messages, 3);
        assert_eq!(snapshot.delivery.delivered, 3);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

        manager.stop().await;
        assert!(task.await.unwrap().is_ok());
        assert_eq!(manager.state().phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_are_fatal() {
        let connector = Arc::new(ScriptedConnector::new(Vec::new()));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector.clone(), sender, 3);

        let result = tokio::time::timeout(Duration::from_secs(5), manager.start())
            .await
            .expect("manager should give up");

        match result {
            Err(ManagerError::ReconnectsExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(manager.state().phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_transport() {
        let connector = Arc::new(ScriptedConnector::new(vec![Step::Serve(Vec::new(), true)]));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector.clone(), sender, 3);

        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move { runner.start().await });
        wait_until(|| manager.state().phase() == Phase::Reading).await;
        wait_until(|| connector.counters.pings.load(Ordering::SeqCst) > 0).await;

        manager.stop().await;
        manager.stop().await;

        assert!(connector.counters.closed.load(Ordering::SeqCst));
        assert!(connector.counters.pings.load(Ordering::SeqCst) > 0);
        assert!(manager.snapshot().last_heartbeat_at.is_some());

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("start should return after stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(manager.state().phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_during_connect_stays_stopped() {
        let connector = Arc::new(ScriptedConnector::new(vec![Step::SlowServe(
            Duration::from_millis(100),
        )]));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector.clone(), sender, 3);

        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move { runner.start().await });
        wait_until(|| connector.attempts.load(Ordering::SeqCst) > 0).await;
        assert_eq!(manager.state().phase(), Phase::Connecting);

        manager.stop().await;
        assert_eq!(manager.state().phase(), Phase::Stopped);

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("start should return after stop")
            .unwrap();
        assert!(result.is_ok());

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.phase, Phase::Stopped);
        assert_eq!(snapshot.connects, 0);
        assert!(snapshot.last_heartbeat_at.is_none());
        assert!(connector.counters.closed.load(Ordering::SeqCst));
        assert_eq!(connector.counters.pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let connector = Arc::new(ScriptedConnector::new(Vec::new()));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector, sender, 0);

        assert!(manager.start().await.is_err());
        assert!(matches!(
            manager.start().await,
            Err(ManagerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_stop_reading() {
        let connector = Arc::new(ScriptedConnector::new(vec![Step::Serve(
            vec!["{not json", r#"{"type":"user.followed","user":{"handle":"bob"}}"#],
            true,
        )]));
        let sender = Arc::new(RecordingSender::default());
        let manager = manager(connector, sender.clone(), 3);

        let runner = Arc::clone(&manager);
        let task = tokio::spawn(async move { runner.start().await });
        wait_until(|| sender.sent.lock().unwrap().len() >= 2).await;
        manager.stop().await;
        task.await.unwrap().unwrap();

        let bodies = sender.bodies();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].contains("{not json"));
        assert!(bodies[1].contains("@bob"));
        assert_eq!(
            EventParser::new(DisplayZone::Local).parse("{not json").kind(),
            EventKind::PlainText
        );
    }

    #[tokio::test]
    async fn test_pause_wakes_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let started = Instant::now();
        assert!(!pause(Duration::from_secs(10), Duration::from_millis(5), &[&shutdown]).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        let idle = Shutdown::new();
        assert!(pause(Duration::from_millis(10), Duration::from_millis(5), &[&idle]).await);
    }
}
