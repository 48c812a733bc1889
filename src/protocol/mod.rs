// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Packet model shared by every stage of the transport.

pub mod hci;

use std::fmt::{self, Debug, Formatter};

use hci::{
    HCI_ACL_PREAMBLE_SIZE, HCI_COMMAND_PREAMBLE_SIZE, HCI_EVENT_PREAMBLE_SIZE,
    HCI_SCO_PREAMBLE_SIZE,
};

/// The four HCI packet kinds, numbered as on an H4 UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command,
    Acl,
    Sco,
    Event,
}

impl PacketKind {
    pub fn from_h4(indicator: u8) -> Option<PacketKind> {
        match indicator {
            1 => Some(PacketKind::Command),
            2 => Some(PacketKind::Acl),
            3 => Some(PacketKind::Sco),
            4 => Some(PacketKind::Event),
            _ => None,
        }
    }

    pub fn h4(&self) -> u8 {
        match *self {
            PacketKind::Command => 1,
            PacketKind::Acl => 2,
            PacketKind::Sco => 3,
            PacketKind::Event => 4,
        }
    }

    /// Size of the fixed header that carries the body length.
    pub fn preamble_size(&self) -> usize {
        match *self {
            PacketKind::Command => HCI_COMMAND_PREAMBLE_SIZE,
            PacketKind::Acl => HCI_ACL_PREAMBLE_SIZE,
            PacketKind::Sco => HCI_SCO_PREAMBLE_SIZE,
            PacketKind::Event => HCI_EVENT_PREAMBLE_SIZE,
        }
    }
}

/// An owned HCI packet, preamble included.
///
/// `offset` marks where the packet starts inside `data`; everything before it
/// belongs to whoever produced the buffer. Ownership moves with the value, so
/// whichever stage holds the packet last drops it.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    data: Vec<u8>,
    offset: usize,
}

impl Packet {
    pub fn new(kind: PacketKind, data: Vec<u8>) -> Packet {
        Packet {
            kind,
            data,
            offset: 0,
        }
    }

    /// Wraps `data`, skipping `offset` leading bytes. The offset is clamped to
    /// the buffer length.
    pub fn with_offset(kind: PacketKind, data: Vec<u8>, offset: usize) -> Packet {
        let offset = offset.min(data.len());
        Packet { kind, data, offset }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Logical length, counted from the offset.
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..]
    }

    /// Shortens the logical length to `len`. Has no effect if the packet is
    /// already shorter.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(self.offset + len);
    }

    pub fn into_vec(mut self) -> Vec<u8> {
        if self.offset > 0 {
            self.data.drain(..self.offset);
        }
        self.data
    }

    /// Opcode of a command packet, read little endian from its first two
    /// bytes.
    pub fn opcode(&self) -> Option<u16> {
        match (self.kind, self.as_bytes()) {
            (PacketKind::Command, [lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    pub fn event_code(&self) -> Option<u8> {
        match self.kind {
            PacketKind::Event => self.as_bytes().first().copied(),
            _ => None,
        }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:?}[", self.kind)?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, "]")
    }
}

/// Hands out buffers for inbound packets. Returning `None` tells the frame
/// assembler to drop the packet currently on the wire.
pub trait PacketAllocator: Send + Sync {
    fn allocate(&self, kind: PacketKind, size: usize) -> Option<Packet>;
}

/// Allocates from the heap, reporting failure instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl PacketAllocator for HeapAllocator {
    fn allocate(&self, kind: PacketKind, size: usize) -> Option<Packet> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).ok()?;
        data.resize(size, 0);
        Some(Packet::new(kind, data))
    }
}
