//! Per-port protocol state machine.
//!
//! A [`PortMachine`] is driven in evaluation passes. Each pass consumes every
//! latched event in priority order (reset, error, steady-state), then, if
//! nothing was latched, handles an expired timer or runs the current state's
//! run step. Transport and device policy are reached only through the
//! [`ProtocolLink`] and [`DevicePolicy`] handed to [`PortMachine::evaluate`].

use std::time::{Duration, Instant};

use crate::ams::AmsOwner;
use crate::config::{PortConfig, PowerRole};
use crate::event::{EventCategory, PolicyRequest, PortEvent};
use crate::message::{
    Capabilities, ControlMessage, Contract, DataMessage, Message, MessageKind, RequestObject,
    TransmitType,
};
use crate::port::{Outbound, PortContext, PortId};
use crate::recovery::{ErrorRecord, Fault, Recovery, RetryPolicy, TransmitFailure};
use crate::reset::{HardResetPhase, PendingReset, ResetEpisode, ResetKind, SoftResetPhase};
use crate::state::{CapabilityState, PortState, ReadyState, Resume, StartupState};
use crate::traits::{DevicePolicy, ProtocolLink};
use crate::Result;

/// Point-in-time view of a port, cheap to clone and publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSnapshot {
    /// Port.
    pub port: PortId,
    /// Current state.
    pub state: PortState,
    /// AMS owner.
    pub ams_owner: AmsOwner,
    /// Pending reset.
    pub pending_reset: PendingReset,
    /// Failures absorbed for the current message attempt.
    pub retry_count: u8,
    /// Last classified fault.
    pub last_error: Option<ErrorRecord>,
    /// Negotiated contract.
    pub contract: Option<Contract>,
    /// Consecutive local hard resets that were never confirmed.
    pub hard_reset_attempts: u8,
}

struct Io<'l, 'p> {
    link: &'l mut dyn ProtocolLink,
    policy: &'p mut dyn DevicePolicy,
    now: Instant,
}

/// Protocol state machine for one port.
#[derive(Debug, Clone)]
pub struct PortMachine {
    port: PortId,
    config: PortConfig,
    retry: RetryPolicy,
    ctx: PortContext,
    deadline: Option<Instant>,
    escalated: bool,
}

impl PortMachine {
    /// Create a machine in its startup state.
    pub fn new(port: PortId, config: PortConfig) -> Self {
        let retry = config.retry_policy();
        Self {
            port,
            config,
            retry,
            ctx: PortContext::new(),
            deadline: None,
            escalated: false,
        }
    }

    /// Port this machine drives.
    pub fn port(&self) -> PortId {
        self.port
    }

    /// Configuration.
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Read-only view of the port context.
    pub fn context(&self) -> &PortContext {
        &self.ctx
    }

    /// Current state.
    pub fn current_state(&self) -> PortState {
        self.ctx.state
    }

    /// True when no atomic message sequence is in progress.
    pub fn is_ams_free(&self) -> bool {
        self.ctx.is_ams_free()
    }

    /// True while this port owns the atomic message sequence.
    pub fn is_in_local_ams(&self) -> bool {
        self.ctx.is_in_local_ams()
    }

    /// Pending reset.
    pub fn pending_reset(&self) -> PendingReset {
        self.ctx.pending_reset
    }

    /// Failures absorbed for the current message attempt.
    pub fn retry_count(&self) -> u8 {
        self.ctx.retry_count
    }

    /// Last classified fault.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.ctx.last_error
    }

    /// Negotiated contract.
    pub fn contract(&self) -> Option<&Contract> {
        self.ctx.contract.as_ref()
    }

    /// Armed timer, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Snapshot of the observable port state.
    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            port: self.port,
            state: self.ctx.state,
            ams_owner: self.ctx.ams_owner(),
            pending_reset: self.ctx.pending_reset,
            retry_count: self.ctx.retry_count,
            last_error: self.ctx.last_error,
            contract: self.ctx.contract.clone(),
            hard_reset_attempts: self.ctx.hard_reset_attempts,
        }
    }

    /// Latch an inbound event for the next evaluation pass.
    ///
    /// Returns `false` when the event's latch is already set. The duplicate
    /// has no effect.
    pub fn latch(&mut self, event: PortEvent) -> bool {
        let accepted = self.ctx.latches.set(event);
        if !accepted {
            tracing::debug!("{}: latch already set, event dropped", self.port);
        }
        accepted
    }

    /// True when `event`'s latch slot is occupied.
    pub fn is_latched(&self, event: &PortEvent) -> bool {
        self.ctx.latches.is_set(event)
    }

    /// Latch a device-policy request.
    pub fn request(&mut self, request: PolicyRequest) -> bool {
        self.latch(PortEvent::Request(request))
    }

    /// True when an evaluation pass at `now` would do something.
    pub fn has_pending_work(&self, now: Instant) -> bool {
        !self.ctx.latches.is_empty()
            || self.ctx.state.has_run_step()
            || self.deadline.is_some_and(|d| now >= d)
            || self.deferred_request_ready()
    }

    /// Start a locally initiated atomic message sequence.
    ///
    /// Fails while another sequence is in progress. A conflict with a
    /// partner-initiated sequence is a protocol fault and schedules a Soft
    /// Reset before the error is returned.
    pub fn acquire_local(&mut self) -> Result<()> {
        match self.ctx.ams.acquire_local() {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.ctx.ams.owner() == AmsOwner::Remote {
                    tracing::warn!(
                        "{}: local sequence requested during partner sequence",
                        self.port
                    );
                    self.on_fault(Fault::SequenceViolation, TransmitType::Sop);
                    self.discard_after_escalation();
                }
                Err(e)
            }
        }
    }

    /// End a sequence started with [`PortMachine::acquire_local`].
    pub fn release_local(&mut self) -> Result<()> {
        self.ctx.ams.release(AmsOwner::Local)
    }

    /// Run one evaluation pass.
    ///
    /// Returns `true` when the pass changed anything.
    pub fn evaluate(
        &mut self,
        now: Instant,
        link: &mut dyn ProtocolLink,
        policy: &mut dyn DevicePolicy,
    ) -> bool {
        let mut io = Io { link, policy, now };

        let mut progressed = false;
        while let Some(event) = self.ctx.latches.take_next() {
            progressed = true;
            self.handle_event(event, &mut io);
            self.discard_after_escalation();
        }
        if progressed {
            return true;
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.deadline = None;
                self.on_timeout(&mut io);
                self.discard_after_escalation();
                return true;
            }
        }

        if self.ctx.state.has_run_step() || self.deferred_request_ready() {
            self.run_step(&mut io);
            self.discard_after_escalation();
            return true;
        }
        false
    }

    fn discard_after_escalation(&mut self) {
        if std::mem::take(&mut self.escalated) {
            self.ctx.latches.discard_below(EventCategory::Reset);
        }
    }

    fn deferred_request_ready(&self) -> bool {
        self.ctx.deferred_request.is_some()
            && self.ctx.state == PortState::Ready(ReadyState::Idle)
            && self.ctx.ams.is_free()
    }

    fn transition(&mut self, next: PortState) {
        if self.ctx.state != next {
            tracing::debug!("{}: {:?} -> {:?}", self.port, self.ctx.state, next);
        }
        self.ctx.state = next;
        self.deadline = None;
    }

    fn arm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(now + timeout);
    }

    /// Hand a fresh message to the transport and arm the response timer.
    fn transmit(&mut self, io: &mut Io<'_, '_>, kind: MessageKind, transmit_type: TransmitType) {
        let id = self.ctx.message_ids.allocate();
        let message = Message::new(kind, id);
        tracing::trace!("{}: tx {} on {:?}", self.port, message, transmit_type);
        io.link.request_transmit(self.port, &message, transmit_type);
        self.ctx.outbound = Some(Outbound {
            message,
            transmit_type,
            sent: false,
        });
        self.arm(io.now, self.config.sender_response());
    }

    fn transmit_control(&mut self, io: &mut Io<'_, '_>, control: ControlMessage) {
        self.transmit(io, MessageKind::Control(control), TransmitType::Sop);
    }

    fn retransmit(&mut self, io: &mut Io<'_, '_>) {
        if let Some(outbound) = self.ctx.outbound.as_mut() {
            outbound.sent = false;
            tracing::debug!(
                "{}: retry {} ({}/{})",
                self.port,
                outbound.message,
                self.ctx.retry_count,
                self.retry.max_retries
            );
            io.link
                .request_transmit(self.port, &outbound.message, outbound.transmit_type);
        }
        self.arm(io.now, self.config.sender_response());
    }

    fn release_ams(&mut self) {
        let owner = self.ctx.ams.owner();
        if owner == AmsOwner::None {
            return;
        }
        if let Err(e) = self.ctx.ams.release(owner) {
            tracing::warn!("{}: {}", self.port, e);
        }
    }

    /// An exchange completed: clear per-exchange bookkeeping.
    fn finish_exchange(&mut self) {
        self.ctx.outbound = None;
        self.ctx.retry_count = 0;
        self.ctx.last_error = None;
        self.release_ams();
    }

    fn handle_event(&mut self, event: PortEvent, io: &mut Io<'_, '_>) {
        match event {
            PortEvent::HardResetReceived => self.on_hard_reset_received(io),
            PortEvent::HardResetSent => self.on_hard_reset_sent(io),
            PortEvent::SoftResetReceived => self.on_soft_reset_received(io),
            PortEvent::ProtocolError {
                kind,
                transmit_type,
            } => self.on_fault(Fault::Transmit(kind), transmit_type),
            PortEvent::MessageSent => self.on_message_sent(io),
            PortEvent::MessageReceived {
                message,
                transmit_type,
            } => self.on_message_received(message, transmit_type, io),
            PortEvent::Request(request) => self.on_request(request),
        }
    }

    // ---- resets ----

    fn on_hard_reset_received(&mut self, io: &mut Io<'_, '_>) {
        tracing::info!("{}: hard reset received", self.port);
        self.ctx.pending_reset.request_hard();
        self.ctx.pending_reset.begin();
        self.transition(PortState::Reset(ResetEpisode::Hard(
            HardResetPhase::Receiving,
        )));
        self.complete_hard_reset(io);
    }

    fn on_hard_reset_sent(&mut self, io: &mut Io<'_, '_>) {
        if self.ctx.state != PortState::Reset(ResetEpisode::Hard(HardResetPhase::Sending)) {
            tracing::debug!("{}: stray hard reset completion", self.port);
            return;
        }
        self.complete_hard_reset(io);
    }

    fn complete_hard_reset(&mut self, io: &mut Io<'_, '_>) {
        self.ctx.ams.force_clear();
        self.ctx.reset_to_startup();
        self.transition(PortState::startup());
        self.escalated = true;
        tracing::info!("{}: hard reset complete", self.port);
        io.policy.port_reset(self.port);
    }

    fn on_soft_reset_received(&mut self, io: &mut Io<'_, '_>) {
        if self.ctx.state == PortState::Unusable || self.ctx.pending_reset.is_hard() {
            tracing::debug!("{}: soft reset ignored, hard reset pending", self.port);
            return;
        }
        tracing::info!("{}: soft reset received", self.port);
        self.ctx.ams.force_clear();
        self.ctx.message_ids.reset();
        self.ctx.received_ids.reset();
        self.ctx.retry_count = 0;
        self.ctx.outbound = None;
        self.ctx.pending_reset.request_soft();
        self.ctx.pending_reset.begin();
        self.escalated = true;

        self.transition(PortState::Reset(ResetEpisode::Soft(
            SoftResetPhase::Accepting,
        )));
        self.transmit_control(io, ControlMessage::Accept);
        self.arm(io.now, self.config.soft_reset());
    }

    fn begin_soft_reset(&mut self, io: &mut Io<'_, '_>) {
        let target = self.ctx.soft_reset_target;
        tracing::info!("{}: sending soft reset on {:?}", self.port, target);
        self.ctx.ams.force_clear();
        self.ctx.message_ids.reset();
        self.ctx.received_ids.reset();
        self.ctx.outbound = None;
        self.ctx.pending_reset.begin();

        self.transition(PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Sending)));
        self.transmit(
            io,
            MessageKind::Control(ControlMessage::SoftReset),
            target,
        );
        self.arm(io.now, self.config.soft_reset());
    }

    fn soft_reset_acked(&mut self, io: &mut Io<'_, '_>) {
        self.ctx.pending_reset.complete();
        self.ctx.message_ids.reset();
        self.ctx.received_ids.reset();
        self.ctx.retry_count = 0;
        self.ctx.last_error = None;
        self.ctx.outbound = None;
        self.ctx.soft_reset_target = TransmitType::Sop;
        tracing::info!("{}: soft reset complete", self.port);
        self.enter_capability_exchange(io);
    }

    fn begin_hard_reset(&mut self, io: &mut Io<'_, '_>) {
        tracing::info!(
            "{}: signalling hard reset ({} unconfirmed)",
            self.port,
            self.ctx.hard_reset_attempts
        );
        self.ctx.ams.force_clear();
        self.ctx.outbound = None;
        self.ctx.pending_reset.begin();
        io.link.request_hard_reset(self.port);

        self.transition(PortState::Reset(ResetEpisode::Hard(HardResetPhase::Sending)));
        self.arm(io.now, self.config.hard_reset_complete());
    }

    fn enter_unusable(&mut self, io: &mut Io<'_, '_>) {
        tracing::error!(
            "{}: hard reset unconfirmed {} times, port unusable",
            self.port,
            self.ctx.hard_reset_attempts
        );
        self.ctx.ams.force_clear();
        self.ctx.outbound = None;
        self.ctx.pending_reset.complete();
        self.ctx.retry_count = 0;
        self.transition(PortState::Unusable);
        io.policy.port_unusable(self.port);
    }

    // ---- faults ----

    fn on_fault(&mut self, fault: Fault, transmit_type: TransmitType) {
        self.ctx.last_error = Some(ErrorRecord {
            fault,
            transmit_type,
        });
        if self.ctx.state == PortState::Unusable {
            return;
        }

        match self
            .retry
            .classify(fault, self.ctx.pending_reset, self.ctx.retry_count)
        {
            Recovery::Retry(count) => {
                self.ctx.retry_count = count;
                tracing::debug!("{}: {:?}, retry {}", self.port, fault, count);
                if self.ctx.outbound.is_some() {
                    if let Some(resume) = self.ctx.state.resume_point() {
                        self.transition(PortState::ErrorRecovery(resume));
                    }
                }
            }
            Recovery::SoftReset => self.escalate_soft(fault, transmit_type),
            Recovery::HardReset => self.escalate_hard(fault),
        }
    }

    fn escalate_soft(&mut self, fault: Fault, transmit_type: TransmitType) {
        tracing::warn!("{}: {:?}, escalating to soft reset", self.port, fault);
        self.ctx.retry_count = 0;
        self.escalated = true;
        if self.ctx.pending_reset.request_soft() {
            self.ctx.soft_reset_target = transmit_type;
            self.transition(PortState::Reset(ResetEpisode::Soft(
                SoftResetPhase::Requested,
            )));
        }
    }

    fn escalate_hard(&mut self, fault: Fault) {
        tracing::warn!("{}: {:?}, escalating to hard reset", self.port, fault);
        self.ctx.retry_count = 0;
        self.escalated = true;
        self.ctx.pending_reset.request_hard();
        self.transition(PortState::Reset(ResetEpisode::Hard(
            HardResetPhase::Requested,
        )));
    }

    fn on_timeout(&mut self, io: &mut Io<'_, '_>) {
        let transmit_type = self
            .ctx
            .outbound
            .as_ref()
            .map(|o| o.transmit_type)
            .unwrap_or_default();

        match self.ctx.state {
            PortState::CapabilityExchange(CapabilityState::AwaitCapabilities) => {
                tracing::warn!("{}: no source capabilities received", self.port);
                let fault = Fault::Transmit(TransmitFailure::NoResponse);
                self.ctx.last_error = Some(ErrorRecord {
                    fault,
                    transmit_type,
                });
                self.escalate_hard(fault);
            }
            PortState::Reset(ResetEpisode::Soft(_)) => {
                self.on_fault(Fault::ResetTimeout(ResetKind::Soft), transmit_type);
            }
            PortState::Reset(ResetEpisode::Hard(HardResetPhase::Sending)) => {
                self.ctx.hard_reset_attempts += 1;
                tracing::warn!(
                    "{}: hard reset not confirmed in time ({}/{})",
                    self.port,
                    self.ctx.hard_reset_attempts,
                    self.config.max_hard_reset_attempts
                );
                self.ctx.last_error = Some(ErrorRecord {
                    fault: Fault::ResetTimeout(ResetKind::Hard),
                    transmit_type,
                });
                if self.ctx.hard_reset_attempts >= self.config.max_hard_reset_attempts {
                    self.enter_unusable(io);
                    return;
                }
                self.ctx.pending_reset.request_hard();
                self.transition(PortState::Reset(ResetEpisode::Hard(
                    HardResetPhase::Requested,
                )));
            }
            PortState::CapabilityExchange(_) | PortState::Ready(_) | PortState::ErrorRecovery(_) => {
                self.on_fault(Fault::Transmit(TransmitFailure::NoResponse), transmit_type);
            }
            PortState::Startup(_) | PortState::Reset(_) | PortState::Unusable => {}
        }
    }

    // ---- run steps ----

    fn run_step(&mut self, io: &mut Io<'_, '_>) {
        match self.ctx.state {
            PortState::Startup(StartupState::Init) => {
                self.transition(PortState::Startup(StartupState::Discovery));
            }
            PortState::Startup(StartupState::Discovery) => self.enter_capability_exchange(io),
            PortState::CapabilityExchange(CapabilityState::EvaluateCapability) => {
                self.select_capability(io)
            }
            PortState::ErrorRecovery(resume) => {
                self.transition(resend_state(resume));
                self.retransmit(io);
            }
            PortState::Reset(ResetEpisode::Hard(HardResetPhase::Requested)) => {
                self.begin_hard_reset(io)
            }
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Requested)) => {
                self.begin_soft_reset(io)
            }
            PortState::Ready(ReadyState::Idle) => {
                if let Some(request) = self.ctx.deferred_request.take() {
                    self.start_local_sequence(request, io);
                }
            }
            _ => {}
        }
    }

    fn enter_capability_exchange(&mut self, io: &mut Io<'_, '_>) {
        match self.config.power_role {
            PowerRole::Source => {
                if self.acquire_local().is_ok() {
                    self.send_source_capabilities(io);
                }
            }
            PowerRole::Sink => {
                self.ctx.outbound = None;
                self.transition(PortState::CapabilityExchange(
                    CapabilityState::AwaitCapabilities,
                ));
                self.arm(io.now, self.config.sink_wait_cap());
            }
        }
    }

    fn send_source_capabilities(&mut self, io: &mut Io<'_, '_>) {
        let capabilities = io.policy.source_capabilities(self.port);
        self.ctx.offered = Some(capabilities.clone());
        self.transition(PortState::CapabilityExchange(
            CapabilityState::SendCapabilities,
        ));
        self.transmit(
            io,
            MessageKind::Data(DataMessage::SourceCapabilities(capabilities)),
            TransmitType::Sop,
        );
    }

    fn select_capability(&mut self, io: &mut Io<'_, '_>) {
        let Some(offered) = self.ctx.offered.clone() else {
            self.on_fault(Fault::SequenceViolation, TransmitType::Sop);
            return;
        };
        let request = io.policy.select_capability(self.port, &offered);
        tracing::debug!(
            "{}: requesting object {} at {} mA",
            self.port,
            request.object_position(),
            request.operating_current_ma()
        );
        self.ctx.request = Some(request);
        self.transition(PortState::CapabilityExchange(
            CapabilityState::SelectCapability,
        ));
        self.transmit(
            io,
            MessageKind::Data(DataMessage::Request(request)),
            TransmitType::Sop,
        );
    }

    fn complete_negotiation(&mut self, io: &mut Io<'_, '_>) {
        let (Some(capabilities), Some(request)) = (self.ctx.offered.take(), self.ctx.request.take())
        else {
            self.on_fault(Fault::SequenceViolation, TransmitType::Sop);
            return;
        };
        let contract = Contract {
            capabilities,
            request,
        };
        self.finish_exchange();
        self.transition(PortState::Ready(ReadyState::Idle));
        match contract.selected() {
            Some(pdo) => tracing::info!(
                "{}: contract {} mV / {} mA",
                self.port,
                pdo.voltage_mv(),
                request.operating_current_ma()
            ),
            None => tracing::info!("{}: contract established", self.port),
        }
        io.policy.capabilities_ready(self.port, &contract);
        self.ctx.contract = Some(contract);
    }

    /// Rejected or refused exchange: fall back to the last contract if any.
    fn abandon_exchange(&mut self, io: &mut Io<'_, '_>) {
        self.finish_exchange();
        self.ctx.offered = None;
        self.ctx.request = None;
        if self.ctx.contract.is_some() {
            self.transition(PortState::Ready(ReadyState::Idle));
            return;
        }
        match self.config.power_role {
            PowerRole::Source => self.transition(PortState::Startup(StartupState::Discovery)),
            PowerRole::Sink => {
                self.transition(PortState::CapabilityExchange(
                    CapabilityState::AwaitCapabilities,
                ));
                self.arm(io.now, self.config.sink_wait_cap());
            }
        }
    }

    // ---- transport events ----

    fn on_message_sent(&mut self, io: &mut Io<'_, '_>) {
        let Some(outbound) = self.ctx.outbound.as_mut() else {
            tracing::debug!("{}: completion without outbound message", self.port);
            return;
        };
        if outbound.sent {
            tracing::debug!("{}: duplicate completion", self.port);
            return;
        }
        outbound.sent = true;
        let message = outbound.message.clone();
        self.ctx.message_ids.acknowledge(message.id);

        match self.ctx.state {
            PortState::CapabilityExchange(CapabilityState::SendCapabilities) => {
                self.transition(PortState::CapabilityExchange(
                    CapabilityState::AwaitRequest,
                ));
                self.arm(io.now, self.config.sender_response());
            }
            PortState::CapabilityExchange(CapabilityState::TransitionSupply) => {
                if message.kind.is_control(ControlMessage::Accept) {
                    self.transmit_control(io, ControlMessage::PsRdy);
                } else {
                    self.complete_negotiation(io);
                }
            }
            PortState::CapabilityExchange(CapabilityState::RejectRequest) => {
                self.abandon_exchange(io)
            }
            PortState::CapabilityExchange(CapabilityState::SelectCapability) => {
                self.arm(io.now, self.config.sender_response());
            }
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Sending)) => {
                self.transition(PortState::Reset(ResetEpisode::Soft(
                    SoftResetPhase::AwaitAccept,
                )));
                self.arm(io.now, self.config.soft_reset());
            }
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::Accepting)) => {
                self.soft_reset_acked(io)
            }
            PortState::Ready(ReadyState::LocalAms)
                if message.kind.is_control(ControlMessage::GetSourceCap) =>
            {
                self.arm(io.now, self.config.sender_response());
            }
            PortState::Ready(ReadyState::LocalAms) | PortState::Ready(ReadyState::RemoteAms) => {
                self.finish_exchange();
                self.transition(PortState::Ready(ReadyState::Idle));
            }
            state => {
                tracing::debug!("{}: completion ignored in {:?}", self.port, state);
            }
        }
    }

    fn on_message_received(
        &mut self,
        message: Message,
        transmit_type: TransmitType,
        io: &mut Io<'_, '_>,
    ) {
        if !self.ctx.received_ids.record(transmit_type, message.id) {
            tracing::warn!(
                "{}: dropping retransmitted {} on {:?}",
                self.port,
                message,
                transmit_type
            );
            return;
        }
        if transmit_type != TransmitType::Sop {
            tracing::debug!("{}: ignoring {} on {:?}", self.port, message, transmit_type);
            return;
        }
        tracing::trace!("{}: rx {}", self.port, message);

        // A late answer cancels the pending resend.
        if let PortState::ErrorRecovery(resume) = self.ctx.state {
            self.transition(resume.into());
            self.arm(io.now, self.config.sender_response());
        }

        let kind = message.kind;
        match self.ctx.state {
            PortState::CapabilityExchange(CapabilityState::AwaitRequest)
            | PortState::CapabilityExchange(CapabilityState::SendCapabilities) => match kind {
                MessageKind::Data(DataMessage::Request(request)) => {
                    self.on_request_received(request, io)
                }
                _ => self.unexpected(transmit_type),
            },
            PortState::CapabilityExchange(CapabilityState::AwaitCapabilities) => match kind {
                MessageKind::Data(DataMessage::SourceCapabilities(capabilities)) => {
                    if self.ctx.ams.acquire_remote().is_err() {
                        self.on_fault(Fault::SequenceViolation, transmit_type);
                        return;
                    }
                    self.capabilities_received(capabilities);
                }
                _ => self.unexpected(transmit_type),
            },
            PortState::CapabilityExchange(CapabilityState::SelectCapability) => match kind {
                MessageKind::Control(ControlMessage::Accept) => {
                    self.transition(PortState::CapabilityExchange(
                        CapabilityState::TransitionSink,
                    ));
                    self.arm(io.now, self.config.ps_transition());
                }
                MessageKind::Control(ControlMessage::Reject)
                | MessageKind::Control(ControlMessage::Wait) => {
                    tracing::info!("{}: request refused", self.port);
                    self.abandon_exchange(io);
                }
                _ => self.unexpected(transmit_type),
            },
            PortState::CapabilityExchange(CapabilityState::TransitionSink) => match kind {
                MessageKind::Control(ControlMessage::PsRdy) => self.complete_negotiation(io),
                _ => self.unexpected(transmit_type),
            },
            PortState::CapabilityExchange(_) => self.unexpected(transmit_type),
            PortState::Reset(ResetEpisode::Soft(SoftResetPhase::AwaitAccept)) => {
                if kind.is_control(ControlMessage::Accept) {
                    self.soft_reset_acked(io);
                } else {
                    tracing::debug!("{}: {} ignored during soft reset", self.port, message.id);
                }
            }
            PortState::Ready(ReadyState::Idle) => self.on_idle_message(kind, transmit_type, io),
            PortState::Ready(ReadyState::LocalAms) => {
                self.on_local_sequence_reply(kind, transmit_type)
            }
            PortState::Ready(ReadyState::RemoteAms) => {
                // Partner started another sequence before ours finished answering.
                self.conflicting_sequence(transmit_type);
            }
            state => {
                tracing::debug!("{}: message ignored in {:?}", self.port, state);
            }
        }
    }

    fn unexpected(&mut self, transmit_type: TransmitType) {
        self.on_fault(
            Fault::Transmit(TransmitFailure::UnexpectedMessage),
            transmit_type,
        );
    }

    fn conflicting_sequence(&mut self, transmit_type: TransmitType) {
        if let Err(e) = self.ctx.ams.acquire_remote() {
            tracing::warn!("{}: {}", self.port, e);
            self.on_fault(Fault::SequenceViolation, transmit_type);
        }
    }

    fn capabilities_received(&mut self, capabilities: Capabilities) {
        tracing::debug!(
            "{}: {} source capabilities offered",
            self.port,
            capabilities.len()
        );
        self.ctx.offered = Some(capabilities);
        self.ctx.outbound = None;
        self.transition(PortState::CapabilityExchange(
            CapabilityState::EvaluateCapability,
        ));
    }

    fn on_request_received(&mut self, request: RequestObject, io: &mut Io<'_, '_>) {
        let offered = self.ctx.offered.clone().unwrap_or_default();
        if io.policy.evaluate_request(self.port, request, &offered) {
            self.ctx.request = Some(request);
            self.transition(PortState::CapabilityExchange(
                CapabilityState::TransitionSupply,
            ));
            self.transmit_control(io, ControlMessage::Accept);
        } else {
            tracing::info!(
                "{}: rejecting request for object {}",
                self.port,
                request.object_position()
            );
            self.transition(PortState::CapabilityExchange(
                CapabilityState::RejectRequest,
            ));
            self.transmit_control(io, ControlMessage::Reject);
        }
    }

    fn on_idle_message(
        &mut self,
        kind: MessageKind,
        transmit_type: TransmitType,
        io: &mut Io<'_, '_>,
    ) {
        let role = self.config.power_role;
        match kind {
            MessageKind::Control(ControlMessage::Ping)
            | MessageKind::Control(ControlMessage::GoodCrc) => {}
            MessageKind::Data(DataMessage::SourceCapabilities(capabilities))
                if role == PowerRole::Sink =>
            {
                if self.ctx.ams.acquire_remote().is_err() {
                    self.on_fault(Fault::SequenceViolation, transmit_type);
                    return;
                }
                self.capabilities_received(capabilities);
            }
            MessageKind::Control(ControlMessage::GetSourceCap) if role == PowerRole::Source => {
                if self.ctx.ams.acquire_remote().is_err() {
                    self.on_fault(Fault::SequenceViolation, transmit_type);
                    return;
                }
                self.send_source_capabilities(io);
            }
            MessageKind::Data(DataMessage::Request(_))
            | MessageKind::Control(ControlMessage::Accept)
            | MessageKind::Control(ControlMessage::Reject)
            | MessageKind::Control(ControlMessage::PsRdy)
            | MessageKind::Control(ControlMessage::Wait) => self.unexpected(transmit_type),
            _ => {
                if self.ctx.ams.acquire_remote().is_err() {
                    self.on_fault(Fault::SequenceViolation, transmit_type);
                    return;
                }
                self.transition(PortState::Ready(ReadyState::RemoteAms));
                self.transmit_control(io, ControlMessage::NotSupported);
            }
        }
    }

    fn on_local_sequence_reply(&mut self, kind: MessageKind, transmit_type: TransmitType) {
        let awaiting_capabilities = self
            .ctx
            .outbound
            .as_ref()
            .is_some_and(|o| o.message.kind.is_control(ControlMessage::GetSourceCap));

        match kind {
            MessageKind::Data(DataMessage::SourceCapabilities(capabilities))
                if awaiting_capabilities =>
            {
                self.capabilities_received(capabilities);
            }
            MessageKind::Control(ControlMessage::NotSupported)
            | MessageKind::Control(ControlMessage::Reject) => {
                self.finish_exchange();
                self.transition(PortState::Ready(ReadyState::Idle));
            }
            MessageKind::Control(ControlMessage::Ping)
            | MessageKind::Control(ControlMessage::GoodCrc) => {}
            _ => self.conflicting_sequence(transmit_type),
        }
    }

    // ---- policy requests ----

    fn on_request(&mut self, request: PolicyRequest) {
        match request {
            PolicyRequest::HardReset => {
                if self.ctx.state == PortState::Unusable {
                    tracing::info!("{}: hard reset requested on unusable port", self.port);
                    self.ctx.hard_reset_attempts = 0;
                } else if self.ctx.pending_reset.is_hard() {
                    return;
                }
                self.escalate_hard_requested();
            }
            PolicyRequest::SoftReset => {
                if self.ctx.state == PortState::Unusable || self.ctx.pending_reset.is_active() {
                    tracing::debug!("{}: soft reset request ignored", self.port);
                    return;
                }
                tracing::info!("{}: soft reset requested", self.port);
                self.escalated = true;
                self.ctx.retry_count = 0;
                self.ctx.pending_reset.request_soft();
                self.ctx.soft_reset_target = TransmitType::Sop;
                self.transition(PortState::Reset(ResetEpisode::Soft(
                    SoftResetPhase::Requested,
                )));
            }
            _ => {
                if self.ctx.state == PortState::Unusable {
                    tracing::warn!("{}: {:?} dropped, port unusable", self.port, request);
                    return;
                }
                if !self.ctx.pending_reset.is_active() && self.ctx.ams.owner() == AmsOwner::Remote
                {
                    // Fails and escalates.
                    let _ = self.acquire_local();
                    return;
                }
                if self.ctx.deferred_request.replace(request).is_some() {
                    tracing::debug!("{}: earlier deferred request replaced", self.port);
                }
            }
        }
    }

    fn escalate_hard_requested(&mut self) {
        tracing::info!("{}: hard reset requested", self.port);
        self.escalated = true;
        self.ctx.retry_count = 0;
        self.ctx.pending_reset.request_hard();
        self.transition(PortState::Reset(ResetEpisode::Hard(
            HardResetPhase::Requested,
        )));
    }

    fn start_local_sequence(&mut self, request: PolicyRequest, io: &mut Io<'_, '_>) {
        if self.acquire_local().is_err() {
            self.ctx.deferred_request = Some(request);
            return;
        }
        let role = self.config.power_role;
        match (request, role) {
            (PolicyRequest::Ping, _) => {
                self.transition(PortState::Ready(ReadyState::LocalAms));
                self.transmit_control(io, ControlMessage::Ping);
            }
            (PolicyRequest::GetSourceCapabilities, PowerRole::Sink) => {
                self.transition(PortState::Ready(ReadyState::LocalAms));
                self.transmit_control(io, ControlMessage::GetSourceCap);
            }
            (PolicyRequest::Renegotiate, PowerRole::Source) => self.send_source_capabilities(io),
            (PolicyRequest::Renegotiate, PowerRole::Sink) => {
                match self.ctx.contract.as_ref().map(|c| c.capabilities.clone()) {
                    Some(capabilities) => self.capabilities_received(capabilities),
                    None => {
                        self.transition(PortState::Ready(ReadyState::LocalAms));
                        self.transmit_control(io, ControlMessage::GetSourceCap);
                    }
                }
            }
            (request, role) => {
                tracing::warn!("{}: {:?} not applicable to {:?}", self.port, request, role);
                self.release_ams();
            }
        }
    }
}

/// State to re-enter when a message is resent after a retryable failure.
fn resend_state(resume: Resume) -> PortState {
    match resume {
        Resume::CapabilityExchange(CapabilityState::AwaitRequest) => {
            PortState::CapabilityExchange(CapabilityState::SendCapabilities)
        }
        Resume::CapabilityExchange(CapabilityState::TransitionSink) => {
            PortState::CapabilityExchange(CapabilityState::SelectCapability)
        }
        other => other.into(),
    }
}
