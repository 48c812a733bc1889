// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The transport engine.
//!
//! An [`Engine`] is constructed with its collaborators, then driven through
//! `start` and `shutdown`. While running it owns a worker thread named
//! `hci_thread`; every public operation is marshalled onto that thread through
//! an [`EngineHandle`]. The handle is also what the HAL and the vendor library
//! use to report back.

pub mod assembler;
pub mod correlator;
pub mod credit;
pub mod dispatch;
pub mod lifecycle;
mod worker;

#[cfg(test)]
pub(crate) mod mocks;

pub use self::correlator::{CompleteCallback, StatusCallback};
pub use self::lifecycle::{LifecycleState, StartupFuture};

use self::correlator::{Continuation, Correlator, PendingCommand};
use self::dispatch::UpwardDispatcher;
use self::lifecycle::Orchestrator;
use self::worker::{WorkItem, Worker, WorkerContext};
use crate::api::{
    AbortOnFatal, BDAddr, EngineEvent, Fragmenter, Hal, HciCallbacks, LowPowerCommand,
    LowPowerManager, NoLowPower, SnoopSink, Supervisor, Vendor, VendorCommand,
};
use crate::common::alarm::{Alarm, TimerService};
use crate::common::events::EventBroadcaster;
use crate::common::future::{reply_channel, ReplyFuture};
use crate::config::EngineConfig;
use crate::inject::HciInjector;
use crate::protocol::{HeapAllocator, Packet, PacketAllocator, PacketKind};
use crate::{Error, Result};
use futures::channel::mpsc::UnboundedSender;
use futures::stream::Stream;
use log::{debug, error, info, trace, warn};
use static_assertions::assert_impl_all;
use std::fmt::{self, Debug, Formatter};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Cloneable access to a running engine's work queue.
///
/// Transmits are refused with [`Error::NotRunning`] once shutdown has begun.
/// Notifications from the HAL and vendor library are always delivered while
/// the worker is alive, since shutdown itself may wait on them.
#[derive(Clone)]
pub struct EngineHandle {
    sender: Sender<WorkItem>,
    accepting: Arc<AtomicBool>,
}

impl EngineHandle {
    fn new(sender: Sender<WorkItem>) -> EngineHandle {
        EngineHandle {
            sender,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    fn post(&self, item: WorkItem) -> Result<()> {
        if !self.is_accepting() {
            return Err(Error::NotRunning);
        }
        self.sender.send(item).map_err(|_| Error::NotRunning)
    }

    pub(crate) fn post_internal(&self, item: WorkItem) {
        if let Err(e) = self.sender.send(item) {
            trace!("HCI worker is gone, dropping {:?}", e.0);
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Queues a packet for the controller. Commands are tracked like
    /// [`transmit_command`](Self::transmit_command) with no callbacks.
    pub fn transmit(&self, packet: Packet) -> Result<()> {
        match packet.kind() {
            PacketKind::Command => {
                debug!("Legacy transmit of command, use transmit_command instead");
                self.transmit_command(packet, None, None)
            }
            PacketKind::Acl | PacketKind::Sco => self.post(WorkItem::Packet(packet)),
            PacketKind::Event => Err(Error::InvalidPacket(
                "events can't be sent to the controller".to_string(),
            )),
        }
    }

    /// Queues a command. `on_complete` receives the Command Complete event,
    /// `on_status` the status and the command itself if a Command Status
    /// answers it instead.
    pub fn transmit_command(
        &self,
        command: Packet,
        on_complete: Option<CompleteCallback>,
        on_status: Option<StatusCallback>,
    ) -> Result<()> {
        let continuation = match (on_complete, on_status) {
            (None, None) => Continuation::None,
            (on_complete, on_status) => Continuation::Callbacks {
                on_complete,
                on_status,
            },
        };
        self.post(WorkItem::Command(PendingCommand::new(command, continuation)?))
    }

    /// Queues a command and returns a future for the event that answers it,
    /// whether Command Complete or Command Status.
    pub fn transmit_command_futured(&self, command: Packet) -> Result<ReplyFuture<Packet>> {
        let (responder, future) = reply_channel();
        let pending = PendingCommand::new(command, Continuation::Future(responder))?;
        self.post(WorkItem::Command(pending))?;
        Ok(future)
    }

    /// Queues a command on behalf of the vendor library. Accepted until the
    /// worker exits so that an epilog can still talk to the controller.
    pub fn send_internal_command(
        &self,
        command: Packet,
        on_complete: Option<CompleteCallback>,
    ) -> Result<()> {
        let pending = PendingCommand::new(
            command,
            Continuation::Callbacks {
                on_complete,
                on_status: None,
            },
        )?;
        self.sender
            .send(WorkItem::Command(pending))
            .map_err(|_| Error::NotRunning)
    }

    /// The HAL has bytes of `kind` ready to be read.
    pub fn data_ready(&self, kind: PacketKind) {
        self.post_internal(WorkItem::DataReady(kind));
    }

    /// A HAL that frames packets itself hands over a complete inbound packet.
    pub fn packet_received(&self, packet: Packet) {
        self.post_internal(WorkItem::Received(packet));
    }

    /// The controller finished its initialization, for HALs that report it
    /// directly rather than through [`VendorCommand::ConfigureFirmware`].
    pub fn initialization_complete(&self, success: bool) {
        self.post_internal(WorkItem::InitializationComplete(success));
    }

    pub fn vendor_command_finished(&self, command: VendorCommand, success: bool) {
        self.post_internal(WorkItem::VendorFinished(command, success));
    }

    /// Blocks until everything queued before this call has been processed.
    #[cfg(test)]
    pub(crate) fn flush(&self) {
        let (done, wait) = channel();
        self.post_internal(WorkItem::Flush(done));
        let _ = wait.recv_timeout(std::time::Duration::from_secs(5));
    }
}

impl Debug for EngineHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Per-session state, present between `start` and `shutdown`.
struct Running {
    handle: EngineHandle,
    worker: JoinHandle<Worker>,
    correlator: Correlator,
    startup_alarm: Arc<Alarm>,
    epilog_alarm: Alarm,
    injector: Option<HciInjector>,
    // dropped last, it cancels every alarm above
    _timers: TimerService,
}

pub struct Engine {
    config: EngineConfig,
    vendor: Arc<dyn Vendor>,
    snoop: Arc<dyn SnoopSink>,
    low_power: Arc<dyn LowPowerManager>,
    supervisor: Arc<dyn Supervisor>,
    allocator: Arc<dyn PacketAllocator>,
    dispatcher: Arc<UpwardDispatcher>,
    events: EventBroadcaster,
    orchestrator: Arc<Mutex<Orchestrator>>,
    // The HAL and fragmenter live on the worker while running.
    parked: Option<(Box<dyn Hal>, Box<dyn Fragmenter>)>,
    running: Option<Running>,
}

impl Engine {
    pub fn new(
        hal: Box<dyn Hal>,
        vendor: Arc<dyn Vendor>,
        snoop: Arc<dyn SnoopSink>,
        fragmenter: Box<dyn Fragmenter>,
    ) -> Engine {
        Engine {
            config: EngineConfig::default(),
            vendor,
            snoop,
            low_power: Arc::new(NoLowPower),
            supervisor: Arc::new(AbortOnFatal),
            allocator: Arc::new(HeapAllocator),
            dispatcher: Arc::new(UpwardDispatcher::default()),
            events: EventBroadcaster::default(),
            orchestrator: Arc::new(Mutex::new(Orchestrator::default())),
            parked: Some((hal, fragmenter)),
            running: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Engine {
        self.config = config;
        self
    }

    /// Replaces the default [`AbortOnFatal`] supervisor.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Engine {
        self.supervisor = supervisor;
        self
    }

    pub fn with_low_power_manager(mut self, low_power: Arc<dyn LowPowerManager>) -> Engine {
        self.low_power = low_power;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PacketAllocator>) -> Engine {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.orchestrator.lock().unwrap().state()
    }

    /// The handle of the current session, if started.
    pub fn handle(&self) -> Option<EngineHandle> {
        self.running.as_ref().map(|r| r.handle.clone())
    }

    fn running_handle(&self) -> Result<&EngineHandle> {
        self.running
            .as_ref()
            .map(|r| &r.handle)
            .ok_or(Error::NotRunning)
    }

    /// Lifecycle notifications from now on.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = EngineEvent> + Send>> {
        self.events.event_stream()
    }

    /// Brings the controller up. An error means the vendor library (or the
    /// engine's own threads) could not be opened; otherwise the returned
    /// future reports how initialization went.
    pub fn start(
        &mut self,
        address: BDAddr,
        callbacks: Arc<dyn HciCallbacks>,
    ) -> Result<StartupFuture> {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }
        if self.parked.is_none() {
            return Err(Error::Other(
                "HAL and fragmenter were lost with a failed worker thread".to_string(),
            ));
        }
        let startup = self.orchestrator.lock().unwrap().begin_start()?;
        info!("Starting HCI transport for {}", address);

        if let Err(e) = self.launch(callbacks) {
            error!("Unable to start the HCI worker: {}", e);
            self.shutdown();
            return Err(e);
        }
        let handle = self.running_handle()?.clone();

        if let Err(e) = self.vendor.open(address, handle.clone()) {
            error!("Vendor library failed to open: {}", e);
            self.shutdown();
            return Err(match e {
                Error::VendorOpen(message) => Error::VendorOpen(message),
                other => Error::VendorOpen(other.to_string()),
            });
        }
        handle.post_internal(WorkItem::Preload);

        if let Some(port) = self.config.inject_port {
            match HciInjector::open(("127.0.0.1", port), handle) {
                Ok(injector) => {
                    if let Some(running) = self.running.as_mut() {
                        running.injector = Some(injector);
                    }
                }
                Err(e) => warn!("HCI inject server not started: {}", e),
            }
        }
        Ok(startup)
    }

    fn launch(&mut self, callbacks: Arc<dyn HciCallbacks>) -> Result<()> {
        let timers = TimerService::new("hci_timer")?;
        let (sender, receiver) = channel();
        let handle = EngineHandle::new(sender);
        let correlator = Correlator::new(
            timers.alarm("command_response_timer"),
            self.config.command_timeout(),
            self.supervisor.clone(),
            self.events.clone(),
        );
        let startup_alarm = Arc::new(timers.alarm("startup_timer"));

        let (hal, fragmenter) = self.parked.take().ok_or(Error::AlreadyStarted)?;
        let worker = Worker::new(
            hal,
            fragmenter,
            WorkerContext {
                vendor: self.vendor.clone(),
                snoop: self.snoop.clone(),
                low_power: self.low_power.clone(),
                callbacks,
                allocator: self.allocator.clone(),
                dispatcher: self.dispatcher.clone(),
                correlator: correlator.clone(),
                orchestrator: self.orchestrator.clone(),
                startup_alarm: startup_alarm.clone(),
                startup_timeout: self.config.startup_timeout(),
                events: self.events.clone(),
                handle: handle.clone(),
            },
        );
        let worker = thread::Builder::new()
            .name("hci_thread".to_string())
            .spawn(move || worker.run(receiver))?;

        let timed_out = handle.clone();
        startup_alarm.set(self.config.startup_timeout(), move || {
            timed_out.post_internal(WorkItem::StartupTimedOut)
        });

        self.running = Some(Running {
            handle,
            worker,
            correlator,
            startup_alarm,
            epilog_alarm: timers.alarm("epilog_timer"),
            injector: None,
            _timers: timers,
        });
        Ok(())
    }

    /// Stops the engine. Commands still waiting for an answer and a startup
    /// future still pending are abandoned: they never resolve. Calling this
    /// again, or on an engine that never started, does nothing.
    ///
    /// Must not be called from one of the engine's own callbacks.
    pub fn shutdown(&mut self) {
        let Some(was_ready) = self.orchestrator.lock().unwrap().begin_shutdown() else {
            debug!("Shutdown already happened for this session");
            return;
        };
        info!("Shutting down HCI transport");

        if let Some(mut running) = self.running.take() {
            if let Some(injector) = running.injector.take() {
                injector.close();
            }
            running.handle.accepting.store(false, Ordering::SeqCst);
            running.startup_alarm.cancel();

            if was_ready {
                let handle = running.handle.clone();
                running
                    .epilog_alarm
                    .set(self.config.epilog_timeout(), move || {
                        info!("Epilog wait timer expired");
                        handle.post_internal(WorkItem::Stop)
                    });
                running.handle.post_internal(WorkItem::Epilog);
            } else {
                running.handle.post_internal(WorkItem::Stop);
            }

            match running.worker.join() {
                Ok(worker) => self.parked = Some(worker.close()),
                Err(_) => error!("HCI worker thread panicked"),
            }
            running.epilog_alarm.cancel();
            running.correlator.abandon_all();
        }

        if let Err(e) = self.vendor.set_chip_power(false) {
            warn!("Unable to power the chip off: {}", e);
        }
        self.vendor.close();

        self.orchestrator.lock().unwrap().finish_shutdown();
        self.events.emit(EngineEvent::Stopped);
    }

    pub fn transmit(&self, packet: Packet) -> Result<()> {
        self.running_handle()?.transmit(packet)
    }

    pub fn transmit_command(
        &self,
        command: Packet,
        on_complete: Option<CompleteCallback>,
        on_status: Option<StatusCallback>,
    ) -> Result<()> {
        self.running_handle()?
            .transmit_command(command, on_complete, on_status)
    }

    pub fn transmit_command_futured(&self, command: Packet) -> Result<ReplyFuture<Packet>> {
        self.running_handle()?.transmit_command_futured(command)
    }

    /// Reassembled ACL and SCO packets, and events nobody registered for,
    /// are delivered here.
    pub fn set_receive_queue(&self, queue: UnboundedSender<Packet>) {
        self.dispatcher.set_data_queue(Some(queue));
    }

    /// Delivers events with `event_code` to `queue` instead of the receive
    /// queue.
    pub fn register_event_queue(&self, event_code: u8, queue: UnboundedSender<Packet>) {
        self.dispatcher.register_event_queue(event_code, Some(queue));
    }

    pub fn unregister_event_queue(&self, event_code: u8) {
        self.dispatcher.register_event_queue(event_code, None);
    }

    pub fn set_chip_power(&self, on: bool) -> Result<()> {
        debug!("Setting bluetooth chip power on to: {}", on);
        self.vendor.set_chip_power(on)
    }

    /// Runs SCO configuration and reads the controller's buffer sizes.
    /// Completion is reported through [`HciCallbacks::postload_finished`].
    pub fn do_postload(&self) -> Result<()> {
        debug!("Posting postload work item");
        self.running_handle()?.post(WorkItem::Postload)
    }

    /// Forwards `command` to the low power manager on the worker thread.
    pub fn send_low_power_command(&self, command: LowPowerCommand) -> Result<()> {
        self.running_handle()?.post(WorkItem::LowPower(command))
    }

    pub fn turn_on_logging<P: AsRef<Path>>(&self, path: P) {
        debug!("Turning on snoop logging to {:?}", path.as_ref());
        self.snoop.open(path.as_ref());
    }

    pub fn turn_off_logging(&self) {
        debug!("Turning off snoop logging");
        self.snoop.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("handle", &self.handle())
            .finish()
    }
}

// Ensure that the exported types implement all the expected traits.
assert_impl_all!(Engine: Debug, Send);
assert_impl_all!(EngineHandle: Clone, Debug, Send, Sync);
assert_impl_all!(StartupFuture: Send);
