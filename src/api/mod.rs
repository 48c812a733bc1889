// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The interfaces the engine consumes from its collaborators, and the ones it
//! offers to the layer above.
//!
//! Every collaborator is a trait object so that a HAL driver, a vendor
//! library or a snoop writer can be swapped without touching the engine. The
//! engine's own tests run entirely on in-memory implementations of these
//! traits.

pub mod bdaddr;

pub use self::bdaddr::{BDAddr, ParseBDAddrError};
pub use crate::protocol::{HeapAllocator, Packet, PacketAllocator, PacketKind};

use crate::engine::EngineHandle;
use crate::{FatalEngineError, Result, StartupError};
use log::error;
use std::path::Path;
use std::time::Duration;

/// The serial/driver side of the link.
///
/// A byte level HAL reports readiness with
/// [`EngineHandle::data_ready`] and is then drained through `read_data` on the
/// engine's worker thread. A HAL that already frames packets itself hands them
/// over with [`EngineHandle::packet_received`] and can leave `read_data` at its
/// default.
pub trait Hal: Send {
    /// Called on the worker thread during start up. `engine` is the handle to
    /// report readiness and inbound packets on.
    fn open(&mut self, engine: EngineHandle) -> Result<()>;

    fn close(&mut self);

    /// Copies up to `buf.len()` pending bytes of `kind` into `buf` and returns
    /// how many were copied. With `block` unset this must not wait for more
    /// data to arrive.
    fn read_data(&mut self, _kind: PacketKind, _buf: &mut [u8], _block: bool) -> usize {
        0
    }

    /// Writes one complete packet (without H4 indicator) and returns the
    /// number of bytes accepted.
    fn transmit_data(&mut self, kind: PacketKind, data: &[u8]) -> usize;

    /// A full packet of `kind` was consumed from the stream.
    fn packet_finished(&mut self, _kind: PacketKind) {}
}

/// Asynchronous operations of the vendor library. Their completion is reported
/// back through [`EngineHandle::vendor_command_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorCommand {
    ConfigureFirmware,
    ConfigureSco,
    DoEpilog,
}

/// The chip specific library in charge of power and firmware.
pub trait Vendor: Send + Sync {
    fn open(&self, address: BDAddr, engine: EngineHandle) -> Result<()>;

    fn close(&self);

    fn set_chip_power(&self, on: bool) -> Result<()>;

    /// Starts `command`. An error means the command was not started and no
    /// completion will follow.
    fn send_async_command(&self, command: VendorCommand) -> Result<()>;
}

/// Side channel receiving a copy of every packet that crosses the transport.
/// Implementations must neither block nor fail the caller.
pub trait SnoopSink: Send + Sync {
    fn open(&self, _path: &Path) {}

    fn close(&self) {}

    fn capture(&self, packet: &Packet, is_received: bool);
}

/// Discards every capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnoop;

impl SnoopSink for NoSnoop {
    fn capture(&self, _packet: &Packet, _is_received: bool) {}
}

/// Requests the layer above can make of a [`LowPowerManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowPowerCommand {
    Disable,
    Enable,
    WakeAssert,
    WakeDeassert,
}

/// Drives the controller's sleep mode. The engine holds the controller awake
/// for the duration of every downward transmission.
pub trait LowPowerManager: Send + Sync {
    /// Called on the worker thread at start up, before the HAL is opened.
    fn init(&self) {}

    fn cleanup(&self) {}

    fn wake_assert(&self);

    fn transmit_done(&self);

    fn post_command(&self, command: LowPowerCommand);
}

/// For controllers without a sleep mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLowPower;

impl LowPowerManager for NoLowPower {
    fn wake_assert(&self) {}

    fn transmit_done(&self) {}

    fn post_command(&self, _command: LowPowerCommand) {}
}

/// What the engine offers a [`Fragmenter`] to push its output through.
pub trait FragmenterCallbacks {
    /// Sends one fragment to the controller. When `send_transmit_finished` is
    /// set this was the last fragment of the packet.
    fn transmit_fragment(&mut self, fragment: Packet, send_transmit_finished: bool);

    /// Hands a fully reassembled inbound packet to the layer above.
    fn dispatch_reassembled(&mut self, packet: Packet);

    /// Gives a packet that was only partially sent back to the layer above.
    fn transmit_finished(&mut self, packet: Packet, all_fragments_sent: bool);
}

/// Splits outbound payloads to the controller's buffer size and stitches
/// inbound continuations back together.
pub trait Fragmenter: Send {
    fn fragment_and_dispatch(&mut self, packet: Packet, callbacks: &mut dyn FragmenterCallbacks);

    fn reassemble_and_dispatch(&mut self, packet: Packet, callbacks: &mut dyn FragmenterCallbacks);

    fn set_acl_data_size(&mut self, _size: u16) {}

    fn set_ble_acl_data_size(&mut self, _size: u16) {}

    fn cleanup(&mut self) {}
}

/// Forwards every packet unchanged, in both directions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughFragmenter;

impl Fragmenter for PassthroughFragmenter {
    fn fragment_and_dispatch(&mut self, packet: Packet, callbacks: &mut dyn FragmenterCallbacks) {
        callbacks.transmit_fragment(packet, true);
    }

    fn reassemble_and_dispatch(&mut self, packet: Packet, callbacks: &mut dyn FragmenterCallbacks) {
        callbacks.dispatch_reassembled(packet);
    }
}

/// Notifications for the layer that started the engine.
pub trait HciCallbacks: Send + Sync {
    /// A data packet left the transport. Dropping it releases the buffer.
    fn transmit_finished(&self, _packet: Packet, _all_fragments_sent: bool) {}

    /// The postload sequence is over. Sizes are `None` when the controller
    /// did not report them.
    fn postload_finished(&self, _acl_data_size: Option<u16>, _ble_acl_data_size: Option<u16>) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl HciCallbacks for NoopCallbacks {}

/// Receives the errors the engine cannot recover from.
pub trait Supervisor: Send + Sync {
    fn fatal_error(&self, error: FatalEngineError);
}

/// Terminates the process on a fatal error, so that whatever manages the
/// Bluetooth process can restart it with a fresh controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnFatal;

impl Supervisor for AbortOnFatal {
    fn fatal_error(&self, error: FatalEngineError) {
        error!("{}, restarting the bluetooth process.", error);
        // give the logger a chance to flush
        std::thread::sleep(Duration::from_millis(10));
        std::process::abort();
    }
}

/// Lifecycle notifications, see [`Engine::events`](crate::engine::Engine::events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StartupSucceeded,
    StartupFailed(StartupError),
    PostloadFinished {
        acl_data_size: Option<u16>,
        ble_acl_data_size: Option<u16>,
    },
    Fatal(FatalEngineError),
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        sent: Vec<(Packet, bool)>,
        up: Vec<Packet>,
    }

    impl FragmenterCallbacks for Collect {
        fn transmit_fragment(&mut self, fragment: Packet, send_transmit_finished: bool) {
            self.sent.push((fragment, send_transmit_finished));
        }

        fn dispatch_reassembled(&mut self, packet: Packet) {
            self.up.push(packet);
        }

        fn transmit_finished(&mut self, _packet: Packet, _all_fragments_sent: bool) {
            panic!("passthrough never reports partial sends");
        }
    }

    #[test]
    fn passthrough_forwards_whole_packets() {
        let mut callbacks = Collect::default();
        let acl = Packet::new(PacketKind::Acl, vec![0x40, 0x20, 0x01, 0x00, 0xaa]);
        let event = Packet::new(PacketKind::Event, vec![0x05, 0x00]);

        PassthroughFragmenter.fragment_and_dispatch(acl.clone(), &mut callbacks);
        PassthroughFragmenter.reassemble_and_dispatch(event.clone(), &mut callbacks);

        assert_eq!(callbacks.sent, vec![(acl, true)]);
        assert_eq!(callbacks.up, vec![event]);
    }
}
