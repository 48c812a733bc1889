// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use futures::channel::mpsc::UnboundedSender;
use std::sync::Mutex;

/// Pushes `item` into the queue held in `slot`. Returns the item back when
/// there is no queue, or when its receiver has been dropped, in which case the
/// queue is removed from the slot.
pub fn send_or_prune<T>(slot: &Mutex<Option<UnboundedSender<T>>>, item: T) -> Result<(), T> {
    let mut slot = slot.lock().unwrap();
    let Some(sender) = slot.as_ref() else {
        return Err(item);
    };
    match sender.unbounded_send(item) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Remove sender if the other end of the channel has been dropped.
            *slot = None;
            Err(e.into_inner())
        }
    }
}
