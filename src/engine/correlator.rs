// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pairs sent commands with the Command Complete / Command Status event that
//! answers them, and watches for a controller that stopped answering.

use crate::api::{EngineEvent, Supervisor};
use crate::common::alarm::Alarm;
use crate::common::events::EventBroadcaster;
use crate::common::future::Responder;
use crate::protocol::hci::{
    parse_flow_control, FlowControlEvent, HCI_COMMAND_NONE, HCI_COMMAND_PREAMBLE_SIZE,
};
use crate::protocol::{Packet, PacketKind};
use crate::{Error, FatalEngineError, Result};
use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Receives the Command Complete event.
pub type CompleteCallback = Box<dyn FnOnce(Packet) + Send>;
/// Receives the status byte of the Command Status event, and the command it
/// answers.
pub type StatusCallback = Box<dyn FnOnce(u8, Packet) + Send>;

/// What happens once a command is answered. Whatever is not handed to a
/// continuation is dropped by the engine.
pub enum Continuation {
    None,
    Callbacks {
        on_complete: Option<CompleteCallback>,
        on_status: Option<StatusCallback>,
    },
    /// Resolved with whichever event answers the command.
    Future(Responder<Packet>),
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Continuation::None => f.write_str("None"),
            Continuation::Callbacks {
                on_complete,
                on_status,
            } => f
                .debug_struct("Callbacks")
                .field("on_complete", &on_complete.is_some())
                .field("on_status", &on_status.is_some())
                .finish(),
            Continuation::Future(_) => f.write_str("Future"),
        }
    }
}

#[derive(Debug)]
pub struct PendingCommand {
    opcode: u16,
    enqueued_at: Instant,
    continuation: Continuation,
    command: Packet,
}

impl PendingCommand {
    pub fn new(command: Packet, continuation: Continuation) -> Result<PendingCommand> {
        if command.kind() != PacketKind::Command || command.len() < HCI_COMMAND_PREAMBLE_SIZE {
            return Err(Error::InvalidPacket(format!(
                "not a command: {:?}",
                command
            )));
        }
        let opcode = command
            .opcode()
            .ok_or_else(|| Error::InvalidPacket(format!("no opcode in {:?}", command)))?;
        Ok(PendingCommand {
            opcode,
            enqueued_at: Instant::now(),
            continuation,
            command,
        })
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn command(&self) -> &Packet {
        &self.command
    }
}

/// Outcome of offering an inbound event to the correlator.
#[derive(Debug, PartialEq, Eq)]
pub enum Interception {
    /// Not a flow control event, it goes on to the layer above.
    Forward(Packet),
    /// A Command Complete or Command Status. The controller now grants
    /// `credits` commands.
    Consumed { credits: u8 },
}

struct Inner {
    // Shared with the timer thread.
    pending: Mutex<VecDeque<PendingCommand>>,
    alarm: Alarm,
    timeout: Duration,
    supervisor: Arc<dyn Supervisor>,
    events: EventBroadcaster,
}

#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new(
        alarm: Alarm,
        timeout: Duration,
        supervisor: Arc<dyn Supervisor>,
        events: EventBroadcaster,
    ) -> Correlator {
        Correlator {
            inner: Arc::new(Inner {
                pending: Mutex::new(VecDeque::new()),
                alarm,
                timeout,
                supervisor,
                events,
            }),
        }
    }

    /// Starts waiting for the answer to a command that is being sent now.
    pub fn register(&self, mut command: PendingCommand) {
        trace!("Waiting for response to 0x{:04x}", command.opcode);
        command.enqueued_at = Instant::now();
        self.inner.pending.lock().unwrap().push_back(command);
        self.update_timer();
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Inspects an inbound event. Command Complete and Command Status are
    /// consumed here, and the continuation of the command they answer runs
    /// on the calling thread.
    pub fn intercept(&self, event: Packet) -> Interception {
        let Some(flow) = parse_flow_control(&event) else {
            return Interception::Forward(event);
        };
        let waiting = self.take_waiting(flow.opcode());
        self.update_timer();

        match (flow, waiting) {
            (FlowControlEvent::Complete(complete), None) => {
                if complete.opcode != HCI_COMMAND_NONE {
                    warn!(
                        "Command complete event with no matching command (opcode: 0x{:04x})",
                        complete.opcode
                    );
                }
            }
            (FlowControlEvent::Status(status), None) => {
                warn!(
                    "Command status event with no matching command (opcode: 0x{:04x})",
                    status.opcode
                );
            }
            (FlowControlEvent::Complete(_), Some(waiting)) => match waiting.continuation {
                Continuation::Callbacks {
                    on_complete: Some(on_complete),
                    ..
                } => on_complete(event),
                Continuation::Future(responder) => responder.resolve(event),
                _ => {}
            },
            (FlowControlEvent::Status(status), Some(waiting)) => match waiting.continuation {
                Continuation::Callbacks {
                    on_status: Some(on_status),
                    ..
                } => on_status(status.status, waiting.command),
                Continuation::Future(responder) => responder.resolve(event),
                _ => {}
            },
        }

        Interception::Consumed {
            credits: flow.credits(),
        }
    }

    /// Removes the first command waiting on `opcode`, so that repeated
    /// opcodes are answered in the order they were sent.
    fn take_waiting(&self, opcode: u16) -> Option<PendingCommand> {
        let mut pending = self.inner.pending.lock().unwrap();
        let position = pending.iter().position(|c| c.opcode == opcode)?;
        pending.remove(position)
    }

    /// Points the watchdog at the oldest command still waiting.
    fn update_timer(&self) {
        let oldest = self
            .inner
            .pending
            .lock()
            .unwrap()
            .front()
            .map(|c| c.enqueued_at);
        match oldest {
            None => self.inner.alarm.cancel(),
            Some(enqueued_at) => {
                let after = self.inner.timeout.saturating_sub(enqueued_at.elapsed());
                let inner = Arc::downgrade(&self.inner);
                self.inner
                    .alarm
                    .set(after, move || Correlator::command_timed_out(inner));
            }
        }
    }

    fn command_timed_out(inner: Weak<Inner>) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let correlator = Correlator { inner };
        let oldest = correlator
            .inner
            .pending
            .lock()
            .unwrap()
            .front()
            .map(|c| (c.opcode, c.enqueued_at.elapsed()));

        match oldest {
            None => error!("Command timeout with no commands pending response"),
            Some((_, elapsed)) if elapsed < correlator.inner.timeout => correlator.update_timer(),
            Some((opcode, elapsed)) => {
                error!(
                    "Timeout waiting for response to a command. opcode: 0x{:04x}",
                    opcode
                );
                let fatal = FatalEngineError::CommandTimeout { opcode, elapsed };
                correlator.inner.events.emit(EngineEvent::Fatal(fatal.clone()));
                correlator.inner.supervisor.fatal_error(fatal);
            }
        }
    }

    /// Drops every waiting command without running its continuation, and
    /// stops the watchdog.
    pub fn abandon_all(&self) -> usize {
        self.inner.alarm.cancel();
        let abandoned: Vec<PendingCommand> = self.inner.pending.lock().unwrap().drain(..).collect();
        if !abandoned.is_empty() {
            debug!("Abandoning {} commands pending response", abandoned.len());
        }
        abandoned.len()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}
