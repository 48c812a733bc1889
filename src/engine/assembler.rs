// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Inbound framing. One [`FrameAssembler`] per packet kind turns the HAL's
//! byte stream into complete packets.

use crate::protocol::hci::{body_length, PREAMBLE_BUFFER_SIZE};
use crate::protocol::{Packet, PacketAllocator, PacketKind};
use log::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    New,
    Preamble,
    Body,
    /// Discarding the rest of a packet no buffer could be allocated for.
    Ignore,
    Finished,
}

#[derive(Debug)]
pub struct FrameAssembler {
    kind: PacketKind,
    state: ReceiveState,
    remaining: usize,
    preamble: [u8; PREAMBLE_BUFFER_SIZE],
    index: usize,
    packet: Option<Packet>,
}

impl FrameAssembler {
    pub fn new(kind: PacketKind) -> FrameAssembler {
        FrameAssembler {
            kind,
            state: ReceiveState::New,
            remaining: 0,
            preamble: [0; PREAMBLE_BUFFER_SIZE],
            index: 0,
            packet: None,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// Drops any partially assembled packet.
    pub fn reset(&mut self) {
        self.state = ReceiveState::New;
        self.remaining = 0;
        self.index = 0;
        self.packet = None;
    }

    /// Advances the state machine by one byte and returns the state it ends
    /// in. Does no I/O.
    pub fn accept(&mut self, byte: u8, allocator: &dyn PacketAllocator) -> ReceiveState {
        if self.state == ReceiveState::New {
            self.remaining = self.kind.preamble_size();
            self.preamble = [0; PREAMBLE_BUFFER_SIZE];
            self.index = 0;
            self.state = ReceiveState::Preamble;
        }

        match self.state {
            ReceiveState::Preamble => {
                self.preamble[self.index] = byte;
                self.index += 1;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.remaining = body_length(self.kind, &self.preamble[..self.index]);
                    self.state = self.start_body(allocator);
                }
            }
            ReceiveState::Body => {
                if let Some(packet) = self.packet.as_mut() {
                    packet.as_bytes_mut()[self.index] = byte;
                }
                self.index += 1;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = ReceiveState::Finished;
                }
            }
            ReceiveState::Ignore => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = ReceiveState::New;
                }
            }
            ReceiveState::Finished => {
                error!(
                    "{:?} assembler was left in the finished state, dropping byte",
                    self.kind
                );
            }
            ReceiveState::New => {}
        }
        self.state
    }

    fn start_body(&mut self, allocator: &dyn PacketAllocator) -> ReceiveState {
        let size = self.index + self.remaining;
        let packet = allocator
            .allocate(self.kind, size)
            .filter(|packet| packet.len() >= size);
        match packet {
            Some(mut packet) => {
                packet.truncate(size);
                packet.as_bytes_mut()[..self.index].copy_from_slice(&self.preamble[..self.index]);
                self.packet = Some(packet);
                if self.remaining > 0 {
                    ReceiveState::Body
                } else {
                    ReceiveState::Finished
                }
            }
            None => {
                error!(
                    "Error getting buffer for incoming {:?} packet of {} bytes",
                    self.kind, size
                );
                // nothing to skip for an empty body
                if self.remaining == 0 {
                    ReceiveState::New
                } else {
                    ReceiveState::Ignore
                }
            }
        }
    }

    /// Copies whatever body bytes `read` has on hand straight into the packet.
    fn fill_body<R>(&mut self, read: &mut R)
    where
        R: FnMut(&mut [u8]) -> usize,
    {
        let Some(packet) = self.packet.as_mut() else {
            return;
        };
        let end = self.index + self.remaining;
        let copied = read(&mut packet.as_bytes_mut()[self.index..end]).min(self.remaining);
        self.index += copied;
        self.remaining -= copied;
        if self.remaining == 0 {
            self.state = ReceiveState::Finished;
        }
    }

    /// Pulls bytes through `read` until one packet is complete or the source
    /// runs dry. `read` must not block; it returns the number of bytes it
    /// copied, 0 when nothing is pending.
    ///
    /// At most one packet is produced per call, so that assemblers of
    /// different kinds take turns on the worker.
    pub fn pump<R>(&mut self, mut read: R, allocator: &dyn PacketAllocator) -> Option<Packet>
    where
        R: FnMut(&mut [u8]) -> usize,
    {
        let mut byte = [0u8; 1];
        while read(&mut byte) != 0 {
            if self.accept(byte[0], allocator) == ReceiveState::Body {
                self.fill_body(&mut read);
            }
            if self.state == ReceiveState::Finished {
                self.state = ReceiveState::New;
                let packet = self.packet.take();
                trace!("Assembled {:?}", packet);
                return packet;
            }
        }
        None
    }
}
