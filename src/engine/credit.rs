// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use log::trace;

/// Number of commands the controller currently accepts.
///
/// A controller coming out of reset accepts exactly one command. Afterwards
/// every Command Complete and Command Status event carries the new absolute
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditGate {
    credits: u8,
}

impl Default for CreditGate {
    fn default() -> Self {
        CreditGate { credits: 1 }
    }
}

impl CreditGate {
    pub fn new() -> CreditGate {
        Self::default()
    }

    pub fn available(&self) -> u8 {
        self.credits
    }

    /// Takes one credit if there is one.
    pub fn try_acquire(&mut self) -> bool {
        match self.credits.checked_sub(1) {
            Some(left) => {
                self.credits = left;
                true
            }
            None => false,
        }
    }

    pub fn replace(&mut self, credits: u8) {
        trace!("Command credits {} -> {}", self.credits, credits);
        self.credits = credits;
    }
}
