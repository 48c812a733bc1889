// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! In-memory collaborators for the engine tests.

use super::EngineHandle;
use crate::api::{
    BDAddr, Hal, HciCallbacks, LowPowerCommand, LowPowerManager, SnoopSink, Supervisor, Vendor,
    VendorCommand,
};
use crate::protocol::{hci, Packet, PacketKind};
use crate::{Error, FatalEngineError, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Polls `condition` for up to five seconds.
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn complete(credits: u8, opcode: u16) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    vec![0x0e, 0x04, credits, lo, hi, 0x00]
}

pub fn status(status: u8, credits: u8, opcode: u16) -> Vec<u8> {
    let [lo, hi] = opcode.to_le_bytes();
    vec![0x0f, 0x04, status, credits, lo, hi]
}

#[derive(Default)]
struct HalState {
    inbound: HashMap<PacketKind, VecDeque<u8>>,
    transmitted: Vec<(PacketKind, Vec<u8>)>,
    finished: Vec<PacketKind>,
    engine: Option<EngineHandle>,
    open: bool,
    closed: bool,
    fail_open: bool,
}

/// A byte level HAL. Clones share state, so a test keeps one while the
/// engine owns another.
#[derive(Clone, Default)]
pub struct MockHal {
    state: Arc<Mutex<HalState>>,
}

impl MockHal {
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    /// Makes `bytes` readable and tells the engine about it.
    pub fn feed(&self, kind: PacketKind, bytes: &[u8]) {
        let engine = {
            let mut state = self.state.lock().unwrap();
            state.inbound.entry(kind).or_default().extend(bytes);
            state.engine.clone()
        };
        engine.expect("HAL not opened").data_ready(kind);
    }

    /// Waits until the engine has consumed and handled every fed byte.
    pub fn settle(&self, handle: &EngineHandle) {
        loop {
            handle.flush();
            let drained = self
                .state
                .lock()
                .unwrap()
                .inbound
                .values()
                .all(|bytes| bytes.is_empty());
            if drained {
                break;
            }
        }
    }

    pub fn transmitted(&self, kind: PacketKind) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .transmitted
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// How many packets of any kind went to the controller so far.
    pub fn transmit_count(&self) -> usize {
        self.state.lock().unwrap().transmitted.len()
    }

    pub fn finished(&self) -> Vec<PacketKind> {
        self.state.lock().unwrap().finished.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Hal for MockHal {
    fn open(&mut self, engine: EngineHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(Error::HalOpen("no such device".to_string()));
        }
        state.engine = Some(engine);
        state.open = true;
        state.closed = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.closed = true;
        state.engine = None;
    }

    fn read_data(&mut self, kind: PacketKind, buf: &mut [u8], _block: bool) -> usize {
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.inbound.get_mut(&kind) else {
            return 0;
        };
        let n = buf.len().min(pending.len());
        for (slot, byte) in buf.iter_mut().zip(pending.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn transmit_data(&mut self, kind: PacketKind, data: &[u8]) -> usize {
        self.state
            .lock()
            .unwrap()
            .transmitted
            .push((kind, data.to_vec()));
        data.len()
    }

    fn packet_finished(&mut self, kind: PacketKind) {
        self.state.lock().unwrap().finished.push(kind);
    }
}

struct VendorState {
    engine: Option<EngineHandle>,
    commands: Vec<VendorCommand>,
    power: Vec<bool>,
    auto_complete: bool,
    epilog_command: Option<u16>,
    accepting_at_epilog: Option<bool>,
    fail_open: bool,
    closed: bool,
}

/// Completes every asynchronous command right away unless told otherwise.
pub struct MockVendor {
    state: Mutex<VendorState>,
}

impl Default for MockVendor {
    fn default() -> Self {
        MockVendor {
            state: Mutex::new(VendorState {
                engine: None,
                commands: vec![],
                power: vec![],
                auto_complete: true,
                epilog_command: None,
                accepting_at_epilog: None,
                fail_open: false,
                closed: false,
            }),
        }
    }
}

impl MockVendor {
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().unwrap().auto_complete = auto_complete;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    /// Makes the epilog send `opcode` to the controller and finish once it
    /// is answered, like a chip that must be told to power down.
    pub fn set_epilog_command(&self, opcode: u16) {
        self.state.lock().unwrap().epilog_command = Some(opcode);
    }

    /// Whether the engine still took transmits when the epilog started.
    pub fn accepting_at_epilog(&self) -> Option<bool> {
        self.state.lock().unwrap().accepting_at_epilog
    }

    /// Reports `command` as finished, as the real library would from its own
    /// thread.
    pub fn finish(&self, command: VendorCommand, success: bool) {
        let engine = self.state.lock().unwrap().engine.clone();
        engine
            .expect("vendor not opened")
            .vendor_command_finished(command, success);
    }

    pub fn commands(&self) -> Vec<VendorCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn power(&self) -> Vec<bool> {
        self.state.lock().unwrap().power.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Vendor for MockVendor {
    fn open(&self, _address: BDAddr, engine: EngineHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(Error::VendorOpen("libbt-vendor missing".to_string()));
        }
        state.engine = Some(engine);
        state.closed = false;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.engine = None;
    }

    fn set_chip_power(&self, on: bool) -> Result<()> {
        self.state.lock().unwrap().power.push(on);
        Ok(())
    }

    fn send_async_command(&self, command: VendorCommand) -> Result<()> {
        let (engine, epilog_command) = {
            let mut state = self.state.lock().unwrap();
            state.commands.push(command);
            let epilog_command = match command {
                VendorCommand::DoEpilog => state.epilog_command,
                _ => None,
            };
            if epilog_command.is_some() {
                state.accepting_at_epilog = state.engine.as_ref().map(|e| e.is_accepting());
            }
            if state.auto_complete || epilog_command.is_some() {
                (state.engine.clone(), epilog_command)
            } else {
                (None, None)
            }
        };
        let Some(engine) = engine else {
            return Ok(());
        };
        match epilog_command {
            Some(opcode) => {
                let finisher = engine.clone();
                engine.send_internal_command(
                    hci::command(opcode),
                    Some(Box::new(move |_: Packet| {
                        finisher.vendor_command_finished(VendorCommand::DoEpilog, true)
                    })),
                )
            }
            None => {
                engine.vendor_command_finished(command, true);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingSnoop {
    captured: Mutex<Vec<(Packet, bool)>>,
    opened: Mutex<Vec<PathBuf>>,
    closed: Mutex<bool>,
}

impl RecordingSnoop {
    pub fn captured(&self) -> Vec<(Packet, bool)> {
        self.captured.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl SnoopSink for RecordingSnoop {
    fn open(&self, path: &Path) {
        self.opened.lock().unwrap().push(path.to_path_buf());
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn capture(&self, packet: &Packet, is_received: bool) {
        self.captured
            .lock()
            .unwrap()
            .push((packet.clone(), is_received));
    }
}

#[derive(Default)]
pub struct RecordingSupervisor {
    errors: Mutex<Vec<FatalEngineError>>,
}

impl RecordingSupervisor {
    pub fn errors(&self) -> Vec<FatalEngineError> {
        self.errors.lock().unwrap().clone()
    }
}

impl Supervisor for RecordingSupervisor {
    fn fatal_error(&self, error: FatalEngineError) {
        self.errors.lock().unwrap().push(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowPowerCall {
    Init,
    WakeAssert,
    TransmitDone,
    Command(LowPowerCommand),
    Cleanup,
}

/// Records each call together with how many packets the HAL had been given
/// at that point.
pub struct RecordingLowPower {
    hal: MockHal,
    calls: Mutex<Vec<(LowPowerCall, usize)>>,
}

impl RecordingLowPower {
    pub fn watching(hal: MockHal) -> RecordingLowPower {
        RecordingLowPower {
            hal,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<(LowPowerCall, usize)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: LowPowerCall) {
        let sent = self.hal.transmit_count();
        self.calls.lock().unwrap().push((call, sent));
    }
}

impl LowPowerManager for RecordingLowPower {
    fn init(&self) {
        self.record(LowPowerCall::Init);
    }

    fn cleanup(&self) {
        self.record(LowPowerCall::Cleanup);
    }

    fn wake_assert(&self) {
        self.record(LowPowerCall::WakeAssert);
    }

    fn transmit_done(&self) {
        self.record(LowPowerCall::TransmitDone);
    }

    fn post_command(&self, command: LowPowerCommand) {
        self.record(LowPowerCall::Command(command));
    }
}

#[derive(Default)]
pub struct RecordingCallbacks {
    transmitted: Mutex<Vec<Packet>>,
    postload: Mutex<Option<(Option<u16>, Option<u16>)>>,
}

impl RecordingCallbacks {
    pub fn transmitted(&self) -> Vec<Packet> {
        self.transmitted.lock().unwrap().clone()
    }

    pub fn postload(&self) -> Option<(Option<u16>, Option<u16>)> {
        *self.postload.lock().unwrap()
    }
}

impl HciCallbacks for RecordingCallbacks {
    fn transmit_finished(&self, packet: Packet, _all_fragments_sent: bool) {
        self.transmitted.lock().unwrap().push(packet);
    }

    fn postload_finished(&self, acl_data_size: Option<u16>, ble_acl_data_size: Option<u16>) {
        *self.postload.lock().unwrap() = Some((acl_data_size, ble_acl_data_size));
    }
}

pub struct Harness {
    pub hal: MockHal,
    pub vendor: Arc<MockVendor>,
    pub snoop: Arc<RecordingSnoop>,
    pub low_power: Arc<RecordingLowPower>,
    pub supervisor: Arc<RecordingSupervisor>,
    pub callbacks: Arc<RecordingCallbacks>,
}

impl Default for Harness {
    fn default() -> Self {
        let hal = MockHal::default();
        Harness {
            low_power: Arc::new(RecordingLowPower::watching(hal.clone())),
            hal,
            vendor: Default::default(),
            snoop: Default::default(),
            supervisor: Default::default(),
            callbacks: Default::default(),
        }
    }
}
