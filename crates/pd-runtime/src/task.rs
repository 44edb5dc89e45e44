//! Per-port task.
//!
//! The task owns its [`PortMachine`] exclusively. Events arrive through a
//! bounded queue and are latched in arrival order. Draining stops at the
//! first event whose latch is still occupied so nothing is coalesced, and
//! right after a reset event so traffic sent after the reset is evaluated
//! against the reset port.

use pd_core::{DevicePolicy, EventCategory, PortEvent, PortMachine, PortSnapshot, ProtocolLink};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Evaluation passes allowed per wakeup before yielding back to the queue.
const MAX_PASSES: usize = 64;

pub(crate) struct PortTask {
    machine: PortMachine,
    link: Box<dyn ProtocolLink + Send>,
    policy: Box<dyn DevicePolicy + Send>,
    events: mpsc::Receiver<PortEvent>,
    held: Option<PortEvent>,
    snapshots: watch::Sender<PortSnapshot>,
    shutdown: watch::Receiver<bool>,
}

impl PortTask {
    pub(crate) fn new(
        machine: PortMachine,
        link: Box<dyn ProtocolLink + Send>,
        policy: Box<dyn DevicePolicy + Send>,
        events: mpsc::Receiver<PortEvent>,
        snapshots: watch::Sender<PortSnapshot>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            machine,
            link,
            policy,
            events,
            held: None,
            snapshots,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let port = self.machine.port();
        tracing::debug!("{}: task started", port);

        loop {
            self.drain();
            self.settle();
            if self.held.is_some() {
                continue;
            }
            self.publish();

            let deadline = self.machine.deadline().map(Instant::from_std);
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.held = Some(event),
                    None => break,
                },
                _ = sleep_until(deadline) => {}
            }
        }

        tracing::debug!("{}: task stopped", port);
    }

    /// Latch queued events until one would land on an occupied slot or a
    /// reset event has been latched.
    fn drain(&mut self) {
        loop {
            let event = match self.held.take() {
                Some(event) => event,
                None => match self.events.try_recv() {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };
            if self.machine.is_latched(&event) {
                self.held = Some(event);
                return;
            }
            let reset = event.category() == EventCategory::Reset;
            self.machine.latch(event);
            if reset {
                return;
            }
        }
    }

    fn settle(&mut self) {
        let now = Instant::now().into_std();
        let mut passes = 0;
        while passes < MAX_PASSES && self.machine.has_pending_work(now) {
            self.machine.evaluate(now, &mut self.link, &mut self.policy);
            passes += 1;
        }
        if passes == MAX_PASSES {
            tracing::warn!("{}: still busy after {} passes", self.machine.port(), passes);
        }
    }

    fn publish(&self) {
        let snapshot = self.machine.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
