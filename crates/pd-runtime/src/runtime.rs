//! Task-per-port runtime.

use pd_core::{
    AmsOwner, DevicePolicy, PolicyRequest, PortEvent, PortId, PortMachine, PortSnapshot,
    PortState, ProtocolLink, SystemConfig,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ingress::Ingress;
use crate::task::PortTask;
use crate::{Error, Result};

/// Runtime settings beyond the per-port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Capacity of each port's event queue.
    pub queue_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { queue_depth: 32 }
    }
}

/// Collaborators for one port.
pub struct PortParts {
    /// Outbound transport.
    pub link: Box<dyn ProtocolLink + Send>,
    /// Device policy.
    pub policy: Box<dyn DevicePolicy + Send>,
}

impl PortParts {
    /// Bundle a link and a policy.
    pub fn new(
        link: impl ProtocolLink + Send + 'static,
        policy: impl DevicePolicy + Send + 'static,
    ) -> Self {
        Self {
            link: Box::new(link),
            policy: Box::new(policy),
        }
    }
}

/// Running ports.
///
/// Each port is driven by its own tokio task that exclusively owns the
/// port's [`PortMachine`]. Readers observe ports through published snapshots.
pub struct PortRuntime {
    ingress: Ingress,
    snapshots: Vec<watch::Receiver<PortSnapshot>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PortRuntime {
    /// Start one task per configured port with default runtime settings.
    ///
    /// `factory` builds each port's collaborators; it receives the shared
    /// [`Ingress`] so links can deliver transport events back.
    pub fn start<F>(config: SystemConfig, factory: F) -> Result<Self>
    where
        F: FnMut(PortId, &Ingress) -> PortParts,
    {
        Self::start_with(config, RuntimeConfig::default(), factory)
    }

    /// Start with explicit runtime settings. Must be called from within a
    /// tokio runtime.
    pub fn start_with<F>(config: SystemConfig, runtime: RuntimeConfig, mut factory: F) -> Result<Self>
    where
        F: FnMut(PortId, &Ingress) -> PortParts,
    {
        config.validate()?;
        if runtime.queue_depth == 0 {
            return Err(pd_core::Error::InvalidConfig("queue_depth must be non-zero".into()).into());
        }

        let port_count = config.port_count();
        let mut senders = Vec::with_capacity(port_count);
        let mut receivers = Vec::with_capacity(port_count);
        for _ in 0..port_count {
            let (tx, rx) = mpsc::channel::<PortEvent>(runtime.queue_depth);
            senders.push(tx);
            receivers.push(rx);
        }
        let ingress = Ingress::new(senders);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut snapshots = Vec::with_capacity(port_count);
        let mut tasks = Vec::with_capacity(port_count);
        for (index, (port_config, events)) in config.ports.into_iter().zip(receivers).enumerate() {
            let port = PortId(index);
            let machine = PortMachine::new(port, port_config);
            let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
            let parts = factory(port, &ingress);
            let task = PortTask::new(
                machine,
                parts.link,
                parts.policy,
                events,
                snapshot_tx,
                shutdown_rx.clone(),
            );
            tasks.push(tokio::spawn(task.run()));
            snapshots.push(snapshot_rx);
        }

        tracing::info!("Started {} port tasks", port_count);
        Ok(Self {
            ingress,
            snapshots,
            shutdown,
            tasks,
        })
    }

    /// Inbound handle for transport callbacks.
    pub fn ingress(&self) -> &Ingress {
        &self.ingress
    }

    /// Number of ports.
    pub fn port_count(&self) -> usize {
        self.snapshots.len()
    }

    fn receiver(&self, port: PortId) -> Result<&watch::Receiver<PortSnapshot>> {
        self.snapshots.get(port.index()).ok_or(Error::Core(pd_core::Error::InvalidPort {
            port,
            port_count: self.snapshots.len(),
        }))
    }

    /// Latest published snapshot of `port`.
    pub fn snapshot(&self, port: PortId) -> Result<PortSnapshot> {
        Ok(self.receiver(port)?.borrow().clone())
    }

    /// True while `port` owns the atomic message sequence.
    pub fn is_in_local_ams(&self, port: PortId) -> Result<bool> {
        Ok(self.receiver(port)?.borrow().ams_owner == AmsOwner::Local)
    }

    /// Queue a device-policy request. An unusable port only accepts
    /// `HardReset`.
    pub fn request(&self, port: PortId, request: PolicyRequest) -> Result<()> {
        let unusable = self.receiver(port)?.borrow().state == PortState::Unusable;
        if unusable && request != PolicyRequest::HardReset {
            return Err(pd_core::Error::PortUnusable(port).into());
        }
        self.ingress.request(port, request)
    }

    /// Wait until `port` publishes a snapshot matching `predicate`.
    pub async fn wait_for<P>(&self, port: PortId, mut predicate: P) -> Result<PortSnapshot>
    where
        P: FnMut(&PortSnapshot) -> bool,
    {
        let mut receiver = self.receiver(port)?.clone();
        let snapshot = receiver
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| Error::ChannelClosed(port))?;
        Ok(snapshot.clone())
    }

    /// Stop every port task and wait for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        // Tasks also stop when the sender is dropped.
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await?;
        }
        tracing::info!("Port tasks stopped");
        Ok(())
    }
}
