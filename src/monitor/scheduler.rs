//! The monitoring timeline.
//!
//! A single task owns the [`Monitor`] and runs poll cycles on a fixed
//! interval. Commands from the presentation layer are queued and applied
//! between cycles, so a cycle always sees a consistent host list and settings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{Command, CommandOutcome, Monitor, MonitorError, MonitorSnapshot};
use crate::settings::PollInterval;

/// How often persisted readings are checked against the retention window.
pub const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

const COMMAND_QUEUE: usize = 64;

struct Envelope {
    command: Command,
    reply: oneshot::Sender<Result<CommandOutcome, MonitorError>>,
}

/// Cloneable access to a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Envelope>,
    snapshots: watch::Receiver<Arc<MonitorSnapshot>>,
}

impl MonitorHandle {
    /// The most recently published state.
    pub fn snapshot(&self) -> Arc<MonitorSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Wait until a newer snapshot is published.
    pub async fn changed(&mut self) -> Result<Arc<MonitorSnapshot>, MonitorError> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| MonitorError::Stopped)?;
        Ok(self.snapshots.borrow_and_update().clone())
    }

    /// Queue a command and wait for it to be applied.
    pub async fn send(&self, command: Command) -> Result<CommandOutcome, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Envelope { command, reply })
            .await
            .map_err(|_| MonitorError::Stopped)?;
        rx.await.map_err(|_| MonitorError::Stopped)?
    }
}

pub struct Scheduler {
    handle: MonitorHandle,
    stop_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the timeline. The first cycle runs immediately.
    pub fn start(monitor: Monitor) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshots_tx, snapshots_rx) = watch::channel(Arc::new(monitor.snapshot(Utc::now())));
        let (stop_tx, stop_rx) = broadcast::channel(1);

        tracing::info!(
            "Starting scheduler with a {}s poll interval",
            monitor.poll_interval().secs()
        );
        let task = tokio::spawn(run_timeline(monitor, commands_rx, snapshots_tx, stop_rx));

        Self {
            handle: MonitorHandle {
                commands: commands_tx,
                snapshots: snapshots_rx,
            },
            stop_tx,
            task,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Change the poll interval. The next cycle is one full new interval
    /// from now.
    pub async fn reschedule(&self, interval: PollInterval) -> Result<(), MonitorError> {
        self.handle.send(Command::SetPollInterval(interval)).await?;
        Ok(())
    }

    /// Stop the timeline and wait for the in-flight cycle, if any, to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            tracing::error!("Scheduler task failed: {}", e);
        }
    }
}

fn ticker(period: Duration, start: Instant) -> Interval {
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run_timeline(
    mut monitor: Monitor,
    mut commands: mpsc::Receiver<Envelope>,
    snapshots: watch::Sender<Arc<MonitorSnapshot>>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut period = monitor.poll_interval();
    let mut poll = ticker(period.as_duration(), Instant::now());
    let mut retention = tokio::time::interval(RETENTION_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("Scheduler stopped");
                break;
            }
            Some(envelope) = commands.recv() => {
                let result = monitor.apply(envelope.command).await;
                if let Err(e) = &result {
                    tracing::warn!("Command rejected: {}", e);
                }

                if monitor.poll_interval() != period {
                    period = monitor.poll_interval();
                    poll = ticker(period.as_duration(), Instant::now() + period.as_duration());
                    tracing::info!("Poll interval changed to {}s", period.secs());
                }

                // Publish first so the caller reads its own change.
                publish(&monitor, &snapshots);
                let _ = envelope.reply.send(result);
            }
            _ = poll.tick() => {
                monitor.run_cycle().await;
                publish(&monitor, &snapshots);
            }
            _ = retention.tick() => {
                monitor.prune_persisted();
            }
        }
    }
}

fn publish(monitor: &Monitor, snapshots: &watch::Sender<Arc<MonitorSnapshot>>) {
    snapshots.send_replace(Arc::new(monitor.snapshot(Utc::now())));
}
