// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use crate::api::EngineEvent;
use futures::stream::{Stream, StreamExt};
use log::trace;
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Fans [`EngineEvent`]s out to every subscribed stream. Subscribers that lag
/// more than the channel capacity miss events rather than block the engine.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    events_channel: broadcast::Sender<EngineEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        let (broadcast_sender, _) = broadcast::channel(16);
        EventBroadcaster {
            events_channel: broadcast_sender,
        }
    }
}

impl EventBroadcaster {
    pub fn emit(&self, event: EngineEvent) {
        if let Err(lost) = self.events_channel.send(event) {
            trace!("Lost engine event, while nothing subscribed: {:?}", lost);
        }
    }

    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = EngineEvent> + Send>> {
        let receiver = self.events_channel.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|x| async move { x.ok() }))
    }
}
