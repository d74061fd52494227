// ABOUTME: Per-connection state machine with health probing and bounded reconnect
// ABOUTME: Probe failures classify through the bridge: retry, keep probing, or tear down

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, watch};

use switchboard_core::config::LifecycleConfig;
use switchboard_core::events::names;
use switchboard_core::failure::FailureClass;

use crate::bridge::AdapterBridge;
use crate::telemetry::Telemetry;

const HEALTH_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection states. `Error` and `Stopped` are terminal for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Starting,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Stopped,
}

/// Snapshot answered by `status()`.
#[derive(Debug, Clone)]
pub struct LifecycleSnapshot {
    pub status: ConnectionStatus,
    pub instance_id: String,
    pub uptime_ms: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub sender_queue_depth: usize,
}

/// Optional probe of the owning partition's queue depth.
pub type QueueDepthProbe = Arc<dyn Fn() -> usize + Send + Sync>;

enum Control {
    Stop,
}

/// Handle to one running connection lifecycle.
#[derive(Clone)]
pub struct LifecycleHandle {
    status_rx: watch::Receiver<LifecycleSnapshot>,
    control_tx: mpsc::Sender<Control>,
}

impl LifecycleHandle {
    pub fn status(&self) -> LifecycleSnapshot {
        self.status_rx.borrow().clone()
    }

    pub async fn stop(&self) {
        let _ = self.control_tx.send(Control::Stop).await;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status_rx.borrow().status,
            ConnectionStatus::Error | ConnectionStatus::Stopped
        )
    }
}

struct LifecycleTask {
    bridge: AdapterBridge,
    config: LifecycleConfig,
    telemetry: Telemetry,
    status_tx: watch::Sender<LifecycleSnapshot>,
    control_rx: mpsc::Receiver<Control>,
    started_at: Instant,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    depth_probe: Option<QueueDepthProbe>,
}

/// Start a lifecycle for one bridge connection.
pub fn start_lifecycle(
    bridge: AdapterBridge,
    config: LifecycleConfig,
    telemetry: Telemetry,
    depth_probe: Option<QueueDepthProbe>,
) -> LifecycleHandle {
    let snapshot = LifecycleSnapshot {
        status: ConnectionStatus::Starting,
        instance_id: telemetry.instance_id().to_string(),
        uptime_ms: 0,
        connected_at: None,
        last_error: None,
        consecutive_failures: 0,
        sender_queue_depth: 0,
    };
    let (status_tx, status_rx) = watch::channel(snapshot);
    let (control_tx, control_rx) = mpsc::channel(4);
    let task = LifecycleTask {
        bridge,
        config,
        telemetry,
        status_tx,
        control_rx,
        started_at: Instant::now(),
        connected_at: None,
        last_error: None,
        consecutive_failures: 0,
        depth_probe,
    };
    tokio::spawn(run_lifecycle(task));
    LifecycleHandle { status_rx, control_tx }
}

impl LifecycleTask {
    fn publish(&self, status: ConnectionStatus) {
        let snapshot = LifecycleSnapshot {
            status,
            instance_id: self.telemetry.instance_id().to_string(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            sender_queue_depth: self.depth_probe.as_ref().map(|p| p()).unwrap_or(0),
        };
        let _ = self.status_tx.send(snapshot);
    }

    fn emit(&self, event: &'static str, data: serde_json::Value) {
        self.telemetry.emit_correlated(
            event,
            None,
            self.bridge.bridge_id(),
            data,
        );
    }

    fn probe_interval(&self) -> Duration {
        self.bridge
            .probe_interval()
            .unwrap_or_else(|| Duration::from_millis(self.config.probe_interval_ms))
    }

    async fn probe(&mut self) -> Result<(), FailureClass> {
        self.emit(names::HEALTH_PROBE, serde_json::json!({}));
        match self.bridge.check_health(HEALTH_CALL_TIMEOUT).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.last_error = None;
                Ok(())
            }
            Err(failure) => {
                self.consecutive_failures += 1;
                self.last_error = Some(failure.to_string());
                tracing::warn!(
                    bridge_id = %self.bridge.bridge_id(),
                    class = ?failure.class,
                    failures = self.consecutive_failures,
                    "health probe failed"
                );
                Err(failure.class)
            }
        }
    }

    /// Bounded reconnect loop.
    async fn reconnect(&mut self) -> ReconnectOutcome {
        for attempt in 1..=self.config.reconnect.max_attempts {
            let delay = jittered(
                self.config.reconnect.backoff_ms(attempt),
                self.config.reconnect.jitter,
            );
            self.emit(
                names::RECONNECT_SCHEDULED,
                serde_json::json!({"attempt": attempt, "delay_ms": delay.as_millis() as u64}),
            );
            tokio::time::sleep(delay).await;
            self.emit(names::RECONNECT_ATTEMPT, serde_json::json!({"attempt": attempt}));
            match self.probe().await {
                Ok(()) => return ReconnectOutcome::Recovered,
                Err(FailureClass::Recoverable) => {
                    self.emit(names::RECONNECT_FAILED, serde_json::json!({"attempt": attempt}));
                }
                Err(FailureClass::Degraded) => {
                    // Not worth hammering; fall back to the probe cadence
                    self.emit(names::RECONNECT_FAILED, serde_json::json!({"attempt": attempt}));
                    return ReconnectOutcome::KeepProbing;
                }
                Err(FailureClass::Fatal) => {
                    self.emit(names::RECONNECT_FAILED, serde_json::json!({"attempt": attempt}));
                    return ReconnectOutcome::TearDown;
                }
            }
        }
        self.emit(
            names::RECONNECT_EXHAUSTED,
            serde_json::json!({"attempts": self.config.reconnect.max_attempts}),
        );
        ReconnectOutcome::TearDown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectOutcome {
    Recovered,
    KeepProbing,
    TearDown,
}

async fn run_lifecycle(mut task: LifecycleTask) {
    task.publish(ConnectionStatus::Starting);
    task.emit(names::INSTANCE_CONNECTING, serde_json::json!({}));
    task.publish(ConnectionStatus::Connecting);

    // Initial connection is the first successful probe
    match task.probe().await {
        Ok(()) => {
            task.connected_at = Some(Utc::now());
            task.emit(names::INSTANCE_CONNECTED, serde_json::json!({}));
            task.publish(ConnectionStatus::Connected);
        }
        Err(FailureClass::Recoverable) => {
            task.publish(ConnectionStatus::Disconnected);
            match task.reconnect().await {
                ReconnectOutcome::Recovered => {
                    task.connected_at = Some(Utc::now());
                    task.emit(names::INSTANCE_CONNECTED, serde_json::json!({}));
                    task.publish(ConnectionStatus::Connected);
                }
                ReconnectOutcome::KeepProbing => {
                    task.emit(names::INSTANCE_DISCONNECTED, serde_json::json!({}));
                    task.publish(ConnectionStatus::Disconnected);
                }
                ReconnectOutcome::TearDown => {
                    task.emit(names::INSTANCE_ERROR, serde_json::json!({"error": task.last_error}));
                    task.publish(ConnectionStatus::Error);
                    return;
                }
            }
        }
        Err(FailureClass::Degraded) => {
            task.emit(names::INSTANCE_DISCONNECTED, serde_json::json!({}));
            task.publish(ConnectionStatus::Disconnected);
        }
        Err(FailureClass::Fatal) => {
            task.emit(names::INSTANCE_ERROR, serde_json::json!({"error": task.last_error}));
            task.publish(ConnectionStatus::Error);
            return;
        }
    }

    loop {
        let interval = task.probe_interval();
        tokio::select! {
            control = task.control_rx.recv() => {
                match control {
                    Some(Control::Stop) | None => {
                        task.emit(names::INSTANCE_STOPPED, serde_json::json!({}));
                        task.publish(ConnectionStatus::Stopped);
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(interval) => {
                match task.probe().await {
                    Ok(()) => {
                        if task.connected_at.is_none() {
                            task.connected_at = Some(Utc::now());
                            task.emit(names::INSTANCE_CONNECTED, serde_json::json!({}));
                        }
                        task.publish(ConnectionStatus::Connected);
                    }
                    Err(FailureClass::Recoverable) => {
                        task.emit(names::INSTANCE_DISCONNECTED, serde_json::json!({}));
                        task.publish(ConnectionStatus::Disconnected);
                        match task.reconnect().await {
                            ReconnectOutcome::Recovered => {
                                task.connected_at = Some(Utc::now());
                                task.emit(names::INSTANCE_CONNECTED, serde_json::json!({}));
                                task.publish(ConnectionStatus::Connected);
                            }
                            ReconnectOutcome::KeepProbing => {}
                            ReconnectOutcome::TearDown => {
                                task.emit(
                                    names::INSTANCE_ERROR,
                                    serde_json::json!({"error": task.last_error}),
                                );
                                task.publish(ConnectionStatus::Error);
                                return;
                            }
                        }
                    }
                    Err(FailureClass::Degraded) => {
                        // Stay down but keep probing
                        task.emit(names::INSTANCE_DISCONNECTED, serde_json::json!({}));
                        task.publish(ConnectionStatus::Disconnected);
                    }
                    Err(FailureClass::Fatal) => {
                        task.emit(
                            names::INSTANCE_ERROR,
                            serde_json::json!({"error": task.last_error}),
                        );
                        task.publish(ConnectionStatus::Error);
                        return;
                    }
                }
            }
        }
    }
}

fn jittered(base_ms: u64, jitter: f64) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_millis(((base_ms as f64) * factor).max(0.0) as u64)
}
