// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The local controller address handed to the vendor library at start up.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;

/// A 6 byte Bluetooth device address, most significant byte first.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr")
)]
#[derive(Copy, Clone, Hash, Eq, PartialEq, Default)]
pub struct BDAddr {
    address: [u8; 6],
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseBDAddrError {
    #[error("Bluetooth address has to be 6 bytes long")]
    IncorrectByteCount,
    #[error("Address byte {0:?} is not two hex digits")]
    MalformedByte(String),
}

impl BDAddr {
    /// The address in HCI wire order, least significant byte first.
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut wire = self.address;
        wire.reverse();
        wire
    }

    /// Reads an address in HCI wire order.
    pub fn from_le_bytes(mut wire: [u8; 6]) -> BDAddr {
        wire.reverse();
        BDAddr { address: wire }
    }
}

impl From<[u8; 6]> for BDAddr {
    fn from(address: [u8; 6]) -> Self {
        BDAddr { address }
    }
}

impl AsRef<[u8]> for BDAddr {
    fn as_ref(&self) -> &[u8] {
        &self.address
    }
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let a = &self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl FromStr for BDAddr {
    type Err = ParseBDAddrError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aabbccddeeff`, any hex case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<&str> = if s.contains(':') {
            s.split(':').collect()
        } else if s.len() == 12 && s.is_char_boundary(2) {
            (0..6)
                .map(|i| s.get(i * 2..i * 2 + 2))
                .collect::<Option<Vec<_>>>()
                .ok_or(ParseBDAddrError::IncorrectByteCount)?
        } else {
            return Err(ParseBDAddrError::IncorrectByteCount);
        };

        if digits.len() != 6 {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        let mut address = [0; 6];
        for (byte, digit) in address.iter_mut().zip(digits) {
            // exactly two hex digits, no sign
            if digit.len() != 2 || !digit.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseBDAddrError::MalformedByte(digit.to_string()));
            }
            *byte = u8::from_str_radix(digit, 16)
                .map_err(|_| ParseBDAddrError::MalformedByte(digit.to_string()))?;
        }
        Ok(BDAddr { address })
    }
}
