// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The engine's worker thread. Everything that touches framing, credits or
//! the collaborators runs here, one [`WorkItem`] at a time.

use super::assembler::FrameAssembler;
use super::correlator::{Continuation, Correlator, Interception, PendingCommand};
use super::credit::CreditGate;
use super::dispatch::UpwardDispatcher;
use super::lifecycle::Orchestrator;
use super::EngineHandle;
use crate::api::{
    EngineEvent, Fragmenter, FragmenterCallbacks, Hal, HciCallbacks, LowPowerCommand,
    LowPowerManager, SnoopSink, Vendor, VendorCommand,
};
use crate::common::alarm::Alarm;
use crate::common::events::EventBroadcaster;
use crate::protocol::hci::{self, HCI_LE_READ_BUFFER_SIZE, HCI_READ_BUFFER_SIZE, HCI_SUCCESS};
use crate::protocol::{Packet, PacketAllocator, PacketKind};
use crate::StartupError;
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub(crate) enum WorkItem {
    Command(PendingCommand),
    Packet(Packet),
    DataReady(PacketKind),
    Received(Packet),
    InitializationComplete(bool),
    VendorFinished(VendorCommand, bool),
    StartupTimedOut,
    Preload,
    Postload,
    BufferSizeResponse(Packet),
    LowPower(LowPowerCommand),
    Epilog,
    Stop,
    #[cfg(test)]
    Flush(std::sync::mpsc::Sender<()>),
}

/// Where the fragmenter's output goes. Borrows the worker's fields so the
/// fragmenter itself can be borrowed mutably at the same time.
struct Downstream<'a> {
    hal: &'a mut Box<dyn Hal>,
    snoop: &'a Arc<dyn SnoopSink>,
    dispatcher: &'a UpwardDispatcher,
    callbacks: &'a Arc<dyn HciCallbacks>,
}

impl FragmenterCallbacks for Downstream<'_> {
    fn transmit_fragment(&mut self, fragment: Packet, send_transmit_finished: bool) {
        self.snoop.capture(&fragment, false);
        let kind = fragment.kind();
        let written = self.hal.transmit_data(kind, fragment.as_bytes());
        if written != fragment.len() {
            warn!(
                "HAL accepted {} of {} bytes of {:?}",
                written,
                fragment.len(),
                kind
            );
        }
        // commands stay with the correlator until answered
        if kind != PacketKind::Command && send_transmit_finished {
            self.callbacks.transmit_finished(fragment, true);
        }
    }

    fn dispatch_reassembled(&mut self, packet: Packet) {
        if let Err(packet) = self.dispatcher.dispatch(packet) {
            debug!("Dropping {:?}, nobody is receiving", packet.kind());
        }
    }

    fn transmit_finished(&mut self, packet: Packet, all_fragments_sent: bool) {
        self.callbacks.transmit_finished(packet, all_fragments_sent);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BufferSizes {
    acl: Option<u16>,
    ble_acl: Option<u16>,
}

/// Everything the worker needs that is created per `start`.
pub(crate) struct WorkerContext {
    pub vendor: Arc<dyn Vendor>,
    pub snoop: Arc<dyn SnoopSink>,
    pub low_power: Arc<dyn LowPowerManager>,
    pub callbacks: Arc<dyn HciCallbacks>,
    pub allocator: Arc<dyn PacketAllocator>,
    pub dispatcher: Arc<UpwardDispatcher>,
    pub correlator: Correlator,
    pub orchestrator: Arc<Mutex<Orchestrator>>,
    pub startup_alarm: Arc<Alarm>,
    pub startup_timeout: Duration,
    pub events: EventBroadcaster,
    pub handle: EngineHandle,
}

pub(crate) struct Worker {
    hal: Box<dyn Hal>,
    fragmenter: Box<dyn Fragmenter>,
    context: WorkerContext,
    acl: FrameAssembler,
    sco: FrameAssembler,
    event: FrameAssembler,
    credits: CreditGate,
    commands: VecDeque<PendingCommand>,
    buffer_sizes: BufferSizes,
}

impl Worker {
    pub fn new(hal: Box<dyn Hal>, fragmenter: Box<dyn Fragmenter>, context: WorkerContext) -> Worker {
        Worker {
            hal,
            fragmenter,
            context,
            acl: FrameAssembler::new(PacketKind::Acl),
            sco: FrameAssembler::new(PacketKind::Sco),
            event: FrameAssembler::new(PacketKind::Event),
            credits: CreditGate::new(),
            commands: VecDeque::new(),
            buffer_sizes: BufferSizes::default(),
        }
    }

    /// Processes work until told to stop, then drops whatever is still
    /// queued. Hands itself back so the collaborators survive a restart.
    pub fn run(mut self, receiver: Receiver<WorkItem>) -> Worker {
        while let Ok(item) = receiver.recv() {
            trace!("HCI work item {:?}", item);
            if !self.handle_item(item) {
                break;
            }
        }

        let dropped = receiver.try_iter().count() + self.commands.len();
        if dropped > 0 {
            debug!("Dropping {} queued work items and commands", dropped);
        }
        self.commands.clear();
        self
    }

    /// Returns false once the worker should exit.
    fn handle_item(&mut self, item: WorkItem) -> bool {
        match item {
            WorkItem::Command(command) => {
                self.commands.push_back(command);
                self.pump_commands();
            }
            WorkItem::Packet(packet) => self.send_downward(packet),
            WorkItem::DataReady(kind) => self.data_ready(kind),
            WorkItem::Received(packet) => self.handle_inbound(packet),
            WorkItem::InitializationComplete(success) => self.initialization_complete(success),
            WorkItem::VendorFinished(command, success) => {
                return self.vendor_finished(command, success);
            }
            WorkItem::StartupTimedOut => {
                error!("Startup timer expired");
                self.startup_failed(StartupError::Timeout(self.context.startup_timeout));
            }
            WorkItem::Preload => self.preload(),
            WorkItem::Postload => self.postload(),
            WorkItem::BufferSizeResponse(event) => self.buffer_size_response(event),
            WorkItem::LowPower(command) => self.context.low_power.post_command(command),
            WorkItem::Epilog => {
                info!("Starting epilog");
                if let Err(e) = self
                    .context
                    .vendor
                    .send_async_command(VendorCommand::DoEpilog)
                {
                    warn!("Vendor refused epilog: {}", e);
                    return false;
                }
            }
            WorkItem::Stop => return false,
            #[cfg(test)]
            WorkItem::Flush(done) => {
                let _ = done.send(());
            }
        }
        true
    }

    fn downstream(&mut self) -> (&mut Box<dyn Fragmenter>, Downstream<'_>) {
        (
            &mut self.fragmenter,
            Downstream {
                hal: &mut self.hal,
                snoop: &self.context.snoop,
                dispatcher: &self.context.dispatcher,
                callbacks: &self.context.callbacks,
            },
        )
    }

    fn send_downward(&mut self, packet: Packet) {
        let low_power = self.context.low_power.clone();
        low_power.wake_assert();
        let (fragmenter, mut downstream) = self.downstream();
        fragmenter.fragment_and_dispatch(packet, &mut downstream);
        low_power.transmit_done();
    }

    /// Sends queued commands for as long as the controller grants credits.
    fn pump_commands(&mut self) {
        while !self.commands.is_empty() && self.credits.try_acquire() {
            let Some(pending) = self.commands.pop_front() else {
                break;
            };
            let command = pending.command().clone();
            self.context.correlator.register(pending);
            self.send_downward(command);
        }
    }

    fn data_ready(&mut self, kind: PacketKind) {
        let assembler = match kind {
            PacketKind::Acl => &mut self.acl,
            PacketKind::Sco => &mut self.sco,
            PacketKind::Event => &mut self.event,
            PacketKind::Command => {
                warn!("HAL reported inbound command data, ignoring");
                return;
            }
        };
        let hal = &mut self.hal;
        let packet = assembler.pump(
            |buf| hal.read_data(kind, buf, false),
            self.context.allocator.as_ref(),
        );

        if let Some(packet) = packet {
            self.handle_inbound(packet);
            self.hal.packet_finished(kind);
            // let other work in before looking for the next packet
            self.context.handle.post_internal(WorkItem::DataReady(kind));
        }
    }

    fn handle_inbound(&mut self, packet: Packet) {
        self.context.snoop.capture(&packet, true);

        let packet = if packet.kind() == PacketKind::Event {
            match self.context.correlator.intercept(packet) {
                Interception::Consumed { credits } => {
                    self.credits.replace(credits);
                    self.pump_commands();
                    return;
                }
                Interception::Forward(packet) => packet,
            }
        } else {
            packet
        };

        let (fragmenter, mut downstream) = self.downstream();
        fragmenter.reassemble_and_dispatch(packet, &mut downstream);
    }

    fn preload(&mut self) {
        info!("Opening HAL and configuring firmware");
        self.context.low_power.init();
        if let Err(e) = self.hal.open(self.context.handle.clone()) {
            error!("HAL failed to open: {}", e);
            self.startup_failed(StartupError::HalOpen(e.to_string()));
            return;
        }
        if let Err(e) = self
            .context
            .vendor
            .send_async_command(VendorCommand::ConfigureFirmware)
        {
            error!("Vendor refused firmware configuration: {}", e);
            self.startup_failed(StartupError::InitializationFailed);
        }
    }

    fn initialization_complete(&mut self, success: bool) {
        if !success {
            self.startup_failed(StartupError::InitializationFailed);
            return;
        }
        if self
            .context
            .orchestrator
            .lock()
            .unwrap()
            .initialization_complete()
        {
            self.context.startup_alarm.cancel();
            self.context.events.emit(EngineEvent::StartupSucceeded);
        }
    }

    fn startup_failed(&mut self, error: StartupError) {
        if self
            .context
            .orchestrator
            .lock()
            .unwrap()
            .startup_failed(error.clone())
        {
            self.context.startup_alarm.cancel();
            self.context.events.emit(EngineEvent::StartupFailed(error));
        }
    }

    fn vendor_finished(&mut self, command: VendorCommand, success: bool) -> bool {
        debug!("Vendor finished {:?}, success: {}", command, success);
        match command {
            VendorCommand::ConfigureFirmware => self.initialization_complete(success),
            VendorCommand::ConfigureSco => self.request_buffer_size(hci::read_buffer_size_command()),
            VendorCommand::DoEpilog => {
                info!("Epilog finished");
                return false;
            }
        }
        true
    }

    fn postload(&mut self) {
        info!("Starting postload");
        self.buffer_sizes = BufferSizes::default();
        if let Err(e) = self
            .context
            .vendor
            .send_async_command(VendorCommand::ConfigureSco)
        {
            // no completion will follow, carry on as if it had
            debug!("Vendor refused SCO configuration: {}", e);
            self.request_buffer_size(hci::read_buffer_size_command());
        }
    }

    fn request_buffer_size(&mut self, command: Packet) {
        let handle = self.context.handle.clone();
        let continuation = Continuation::Callbacks {
            on_complete: Some(Box::new(move |event| {
                handle.post_internal(WorkItem::BufferSizeResponse(event))
            })),
            on_status: None,
        };
        match PendingCommand::new(command, continuation) {
            Ok(pending) => {
                self.commands.push_back(pending);
                self.pump_commands();
            }
            Err(e) => error!("Couldn't queue buffer size request: {}", e),
        }
    }

    fn buffer_size_response(&mut self, event: Packet) {
        let Some(response) = hci::parse_buffer_size_response(&event) else {
            error!("Malformed buffer size response {:?}", event);
            return;
        };
        let data_size = (response.status == HCI_SUCCESS).then_some(response.data_size);

        match response.opcode {
            HCI_READ_BUFFER_SIZE => {
                if let Some(size) = data_size {
                    self.fragmenter.set_acl_data_size(size);
                }
                self.buffer_sizes.acl = data_size;
                self.request_buffer_size(hci::le_read_buffer_size_command());
            }
            HCI_LE_READ_BUFFER_SIZE => {
                if let Some(size) = data_size {
                    self.fragmenter.set_ble_acl_data_size(size);
                }
                self.buffer_sizes.ble_acl = data_size;
                let BufferSizes { acl, ble_acl } = self.buffer_sizes;
                info!("Postload finished, ACL {:?}, BLE ACL {:?}", acl, ble_acl);
                self.context.callbacks.postload_finished(acl, ble_acl);
                self.context.events.emit(EngineEvent::PostloadFinished {
                    acl_data_size: acl,
                    ble_acl_data_size: ble_acl,
                });
            }
            opcode => error!("Unexpected buffer size response opcode 0x{:04x}", opcode),
        }
    }

    /// Releases per-session state and hands back the long lived collaborators.
    pub fn close(mut self) -> (Box<dyn Hal>, Box<dyn Fragmenter>) {
        self.fragmenter.cleanup();
        self.context.low_power.cleanup();
        self.hal.close();
        (self.hal, self.fragmenter)
    }
}
