//! The build-event publisher: a cooperative producer–consumer between
//! whoever calls [`Publisher::publish`] and a single writer into the
//! backend's RPC stream.
//!
//! State machine: `Fresh` → `Running` (on [`Publisher::start`]) →
//! `Draining` (on the first [`Publisher::wait`]) → `Done` (when the
//! background publisher task signals completion). A terminal error is
//! latched at most once; once latched, every subsequent `publish` is
//! rejected with it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use runner_types::{BuildEvent, RunnerError, StreamId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::client;
use crate::proto::PublishBuildToolEventStreamRequest;

const QUEUE_CAPACITY: usize = 128;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh = 0,
    Running = 1,
    Draining = 2,
    Done = 3,
}

/// Enqueues build events and drives them, in order, into the backend's
/// bidirectional build-event RPC.
pub struct Publisher {
    stream_id: StreamId,
    bes_backend: String,
    state: AtomicU8,
    err: Arc<Mutex<Option<String>>>,
    tx: Mutex<Option<mpsc::Sender<Option<BuildEvent>>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Publisher {
    /// Create a Fresh publisher bound to one stream identity and backend.
    pub fn new(stream_id: StreamId, bes_backend: impl Into<String>) -> Self {
        Self {
            stream_id,
            bes_backend: bes_backend.into(),
            state: AtomicU8::new(State::Fresh as u8),
            err: Arc::new(Mutex::new(None)),
            tx: Mutex::new(None),
            done_rx: Mutex::new(None),
        }
    }

    /// The stream identity every event published through this instance carries.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Transition Fresh → Running and spawn the publisher task.
    pub fn start(&self, cancel: CancellationToken) {
        debug_assert_eq!(self.state.load(Ordering::SeqCst), State::Fresh as u8);

        let (tx, rx) = mpsc::channel::<Option<BuildEvent>>(QUEUE_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        *self.tx.lock().expect("tx lock poisoned") = Some(tx);
        *self.done_rx.lock().expect("done_rx lock poisoned") = Some(done_rx);
        self.state.store(State::Running as u8, Ordering::SeqCst);

        let stream_id = self.stream_id.clone();
        let bes_backend = self.bes_backend.clone();
        let err = self.err.clone();

        tokio::spawn(async move {
            run_publisher_task(stream_id, bes_backend, rx, err, done_tx, cancel).await;
        });
    }

    /// Enqueue `event`. Rejected with the latched error, if any.
    pub async fn publish(&self, event: BuildEvent) -> Result<(), RunnerError> {
        if let Some(msg) = self.err.lock().expect("err lock poisoned").clone() {
            return Err(RunnerError::Publish(msg));
        }

        let sender = {
            let guard = self.tx.lock().expect("tx lock poisoned");
            guard.clone()
        };

        let Some(sender) = sender else {
            return Err(RunnerError::Publish("publisher not started".to_string()));
        };

        if sender.send(Some(event)).await.is_err() {
            let msg = self
                .err
                .lock()
                .expect("err lock poisoned")
                .clone()
                .unwrap_or_else(|| "publisher task exited".to_string());
            return Err(RunnerError::Publish(msg));
        }

        Ok(())
    }

    /// Enqueue the sentinel, transition to Draining, block until the
    /// background task signals Done, then return the latched error.
    pub async fn wait(&self) -> Result<(), RunnerError> {
        self.state.store(State::Draining as u8, Ordering::SeqCst);

        let sender = self.tx.lock().expect("tx lock poisoned").take();
        if let Some(sender) = sender {
            let _ = sender.send(None).await;
        }

        let done_rx = self.done_rx.lock().expect("done_rx lock poisoned").take();
        if let Some(done_rx) = done_rx {
            let _ = done_rx.await;
        }

        self.state.store(State::Done as u8, Ordering::SeqCst);

        if let Some(msg) = self.err.lock().expect("err lock poisoned").clone() {
            return Err(RunnerError::Publish(msg));
        }

        Ok(())
    }
}

async fn run_publisher_task(
    stream_id: StreamId,
    bes_backend: String,
    mut rx: mpsc::Receiver<Option<BuildEvent>>,
    err: Arc<Mutex<Option<String>>>,
    done_tx: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let result = run_publisher_task_inner(&stream_id, &bes_backend, &mut rx, &cancel).await;

    if let Err(e) = result {
        *err.lock().expect("err lock poisoned") = Some(format!("{e:#}"));
    }

    let _ = done_tx.send(());
}

async fn run_publisher_task_inner(
    stream_id: &StreamId,
    bes_backend: &str,
    rx: &mut mpsc::Receiver<Option<BuildEvent>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let channel = dial_with_backoff(bes_backend, cancel).await?;

    let (outbound_tx, outbound_rx) = mpsc::channel::<PublishBuildToolEventStreamRequest>(QUEUE_CAPACITY);

    let mut inbound = client::open_stream(channel, outbound_rx)
        .await
        .context("failed to open build-event stream")?;

    let ack_task = tokio::spawn(async move {
        loop {
            match tonic::Streaming::message(&mut inbound).await {
                Ok(Some(_ack)) => continue,
                Ok(None) => return Ok(()),
                Err(status) => return Err(anyhow::anyhow!("ack stream error: {status}")),
            }
        }
    });

    let mut seq: i64 = 1;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                anyhow::bail!("publisher cancelled");
            }
            event = rx.recv() => event,
        };

        match next {
            None => break, // sender dropped without a sentinel: treat as drain
            Some(None) => {
                let envelope = PublishBuildToolEventStreamRequest {
                    invocation_id: stream_id.invocation_id.clone(),
                    build_id: stream_id.build_id.clone(),
                    sequence_number: seq,
                    event_time_millis: Utc::now().timestamp_millis(),
                    component_stream_finished: true,
                    event_json: String::new(),
                };
                outbound_tx
                    .send(envelope)
                    .await
                    .context("failed to send closing envelope")?;
                break;
            }
            Some(Some(event)) => {
                let event_json = serde_json::to_string(&event).context("failed to encode event")?;
                let envelope = PublishBuildToolEventStreamRequest {
                    invocation_id: stream_id.invocation_id.clone(),
                    build_id: stream_id.build_id.clone(),
                    sequence_number: seq,
                    event_time_millis: Utc::now().timestamp_millis(),
                    component_stream_finished: false,
                    event_json,
                };
                outbound_tx
                    .send(envelope)
                    .await
                    .context("failed to send build event")?;
                seq += 1;
            }
        }
    }

    drop(outbound_tx); // half-close the send side

    ack_task
        .await
        .context("ack-receiver task panicked")?
        .context("ack-receiver task failed")?;

    Ok(())
}

/// Bounded, jittered retry of the initial dial only -- once the stream is
/// open, any failure is a terminal, latched error.
async fn dial_with_backoff(
    bes_backend: &str,
    cancel: &CancellationToken,
) -> Result<tonic::transport::Channel> {
    let config = runner_retry::RetryPolicy::Conservative.to_config();
    let mut attempt = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("dial cancelled"),
            dialed = client::dial(bes_backend) => {
                match dialed {
                    Ok(channel) => return Ok(channel),
                    Err(e) if attempt >= config.max_attempts => return Err(e),
                    Err(_) => {
                        let delay = runner_retry::calculate_delay(&config, attempt);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}
