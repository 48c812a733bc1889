// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::common::util::send_or_prune;
use crate::protocol::Packet;
use dashmap::DashMap;
use futures::channel::mpsc::UnboundedSender;
use log::{debug, trace};
use std::sync::Mutex;

/// Routes inbound packets to the queues registered by the layer above.
///
/// Events go to the queue registered for their event code, falling back to
/// the data queue. ACL and SCO always go to the data queue.
#[derive(Debug, Default)]
pub struct UpwardDispatcher {
    event_queues: DashMap<u8, UnboundedSender<Packet>>,
    data_queue: Mutex<Option<UnboundedSender<Packet>>>,
}

impl UpwardDispatcher {
    pub fn set_data_queue(&self, queue: Option<UnboundedSender<Packet>>) {
        *self.data_queue.lock().unwrap() = queue;
    }

    pub fn register_event_queue(&self, event_code: u8, queue: Option<UnboundedSender<Packet>>) {
        match queue {
            Some(queue) => {
                self.event_queues.insert(event_code, queue);
            }
            None => {
                self.event_queues.remove(&event_code);
            }
        }
    }

    /// Returns the packet when nobody is listening for it.
    pub fn dispatch(&self, packet: Packet) -> Result<(), Packet> {
        let packet = match packet.event_code() {
            Some(code) => match self.dispatch_event(code, packet) {
                Ok(()) => return Ok(()),
                Err(packet) => packet,
            },
            None => packet,
        };
        send_or_prune(&self.data_queue, packet).map_err(|packet| {
            trace!("No receive queue for {:?}, dropping", packet.kind());
            packet
        })
    }

    fn dispatch_event(&self, code: u8, packet: Packet) -> Result<(), Packet> {
        let Some(queue) = self.event_queues.get(&code).map(|q| q.value().clone()) else {
            return Err(packet);
        };
        match queue.unbounded_send(packet) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Receiver for event 0x{:02x} went away", code);
                self.event_queues.remove(&code);
                Err(e.into_inner())
            }
        }
    }

    pub fn has_data_queue(&self) -> bool {
        self.data_queue.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketKind;
    use futures::channel::mpsc;

    fn event(code: u8) -> Packet {
        Packet::new(PacketKind::Event, vec![code, 0x00])
    }

    #[test]
    fn events_prefer_their_registration() {
        let dispatcher = UpwardDispatcher::default();
        let (data_tx, mut data_rx) = mpsc::unbounded();
        let (le_tx, mut le_rx) = mpsc::unbounded();
        dispatcher.set_data_queue(Some(data_tx));
        dispatcher.register_event_queue(0x3e, Some(le_tx));

        assert!(dispatcher.dispatch(event(0x3e)).is_ok());
        assert!(dispatcher.dispatch(event(0x05)).is_ok());
        let acl = Packet::new(PacketKind::Acl, vec![0x40, 0x20, 0x00, 0x00]);
        assert!(dispatcher.dispatch(acl.clone()).is_ok());

        assert_eq!(le_rx.try_recv().unwrap(), event(0x3e));
        assert_eq!(data_rx.try_recv().unwrap(), event(0x05));
        assert_eq!(data_rx.try_recv().unwrap(), acl);
    }

    #[test]
    fn closed_queues_are_pruned() {
        let dispatcher = UpwardDispatcher::default();
        let (data_tx, data_rx) = mpsc::unbounded();
        let (le_tx, le_rx) = mpsc::unbounded();
        dispatcher.set_data_queue(Some(data_tx));
        dispatcher.register_event_queue(0x3e, Some(le_tx));
        drop(le_rx);
        drop(data_rx);

        assert_eq!(dispatcher.dispatch(event(0x3e)), Err(event(0x3e)));
        assert!(dispatcher.event_queues.is_empty());
        assert!(!dispatcher.has_data_queue());
    }

    #[test]
    fn unregistering_falls_back_to_data_queue() {
        let dispatcher = UpwardDispatcher::default();
        let (data_tx, mut data_rx) = mpsc::unbounded();
        let (le_tx, _le_rx) = mpsc::unbounded();
        dispatcher.set_data_queue(Some(data_tx));
        dispatcher.register_event_queue(0x3e, Some(le_tx));
        dispatcher.register_event_queue(0x3e, None);

        assert!(dispatcher.dispatch(event(0x3e)).is_ok());
        assert_eq!(data_rx.try_recv().unwrap(), event(0x3e));
    }
}
