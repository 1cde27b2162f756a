// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Couldn't reserve {size} bytes of memory for an arena")]
    OutOfMemory { size: usize },

    #[error("An arena must have a non-zero size")]
    ZeroSized,

    #[error("Arena exhausted: requested {requested} bytes (alignment {alignment}), but only {free} of {capacity} bytes are free and the largest free range is {largest} bytes")]
    Exhausted {
        requested: usize,
        alignment: usize,
        free: usize,
        largest: usize,
        capacity: usize,
    },

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Address {0:#x} is not a live allocation of this arena")]
    UnknownAllocation(usize),

    #[error("A buffer of {len} elements of {elem_size} bytes each overflows the address space")]
    SizeOverflow { len: usize, elem_size: usize },
}
