// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! HCI wire constants and the few event layouts the transport itself reads.

use super::{Packet, PacketKind};

pub const HCI_COMMAND_PREAMBLE_SIZE: usize = 3;
pub const HCI_ACL_PREAMBLE_SIZE: usize = 4;
pub const HCI_SCO_PREAMBLE_SIZE: usize = 3;
pub const HCI_EVENT_PREAMBLE_SIZE: usize = 2;

/// Largest preamble of any kind (ACL).
pub const PREAMBLE_BUFFER_SIZE: usize = 4;

/// Offset of the little endian body length inside an ACL preamble.
pub const ACL_LENGTH_OFFSET: usize = 2;

pub const EVT_COMMAND_COMPLETE: u8 = 0x0e;
pub const EVT_COMMAND_STATUS: u8 = 0x0f;

/// Opcode a controller uses in unsolicited Command Complete events that only
/// hand out credits.
pub const HCI_COMMAND_NONE: u16 = 0x0000;

pub const HCI_READ_BUFFER_SIZE: u16 = 0x1005;
pub const HCI_LE_READ_BUFFER_SIZE: u16 = 0x2002;

pub const HCI_SUCCESS: u8 = 0x00;

/// Body length announced by a complete preamble. ACL carries a 16 bit length,
/// every other kind a single trailing byte.
pub fn body_length(kind: PacketKind, preamble: &[u8]) -> usize {
    match kind {
        PacketKind::Acl => u16::from_le_bytes([
            preamble[ACL_LENGTH_OFFSET],
            preamble[ACL_LENGTH_OFFSET + 1],
        ]) as usize,
        _ => preamble[kind.preamble_size() - 1] as usize,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandComplete {
    pub credits: u8,
    pub opcode: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub status: u8,
    pub credits: u8,
    pub opcode: u16,
}

/// The events the correlator intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlEvent {
    Complete(CommandComplete),
    Status(CommandStatus),
}

impl FlowControlEvent {
    pub fn opcode(&self) -> u16 {
        match self {
            FlowControlEvent::Complete(c) => c.opcode,
            FlowControlEvent::Status(s) => s.opcode,
        }
    }

    pub fn credits(&self) -> u8 {
        match self {
            FlowControlEvent::Complete(c) => c.credits,
            FlowControlEvent::Status(s) => s.credits,
        }
    }
}

/// Reads the credit/opcode fields out of a Command Complete or Command Status
/// event. Returns `None` for any other event, and for one too short to hold
/// the fields.
pub fn parse_flow_control(event: &Packet) -> Option<FlowControlEvent> {
    let bytes = event.as_bytes();
    match event.event_code()? {
        EVT_COMMAND_COMPLETE => match bytes {
            [_, _, credits, lo, hi, ..] => Some(FlowControlEvent::Complete(CommandComplete {
                credits: *credits,
                opcode: u16::from_le_bytes([*lo, *hi]),
            })),
            _ => None,
        },
        EVT_COMMAND_STATUS => match bytes {
            [_, _, status, credits, lo, hi, ..] => {
                Some(FlowControlEvent::Status(CommandStatus {
                    status: *status,
                    credits: *credits,
                    opcode: u16::from_le_bytes([*lo, *hi]),
                }))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Builds a parameterless command.
pub fn command(opcode: u16) -> Packet {
    let [lo, hi] = opcode.to_le_bytes();
    Packet::new(PacketKind::Command, vec![lo, hi, 0])
}

pub fn read_buffer_size_command() -> Packet {
    command(HCI_READ_BUFFER_SIZE)
}

pub fn le_read_buffer_size_command() -> Packet {
    command(HCI_LE_READ_BUFFER_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeResponse {
    pub opcode: u16,
    pub status: u8,
    /// Only meaningful when `status` is [`HCI_SUCCESS`].
    pub data_size: u16,
}

/// Parses the Command Complete answering Read Buffer Size or LE Read Buffer
/// Size. Both put the ACL data packet length right after the status byte.
pub fn parse_buffer_size_response(event: &Packet) -> Option<BufferSizeResponse> {
    if event.event_code()? != EVT_COMMAND_COMPLETE {
        return None;
    }
    // skip event code, parameter length and credits
    match event.as_bytes().get(3..)? {
        [op_lo, op_hi, status, rest @ ..] => {
            let data_size = match rest {
                [lo, hi, ..] if *status == HCI_SUCCESS => u16::from_le_bytes([*lo, *hi]),
                _ => 0,
            };
            Some(BufferSizeResponse {
                opcode: u16::from_le_bytes([*op_lo, *op_hi]),
                status: *status,
                data_size,
            })
        }
        _ => None,
    }
}
