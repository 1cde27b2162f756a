// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Filter bank errors. These are all detected when the filter bank is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterBankError {
    #[error("The filter coefficient table has {got} entries, but {nr_channels} channels x {nr_taps} taps requires {expected}")]
    CoefficientTableSize {
        expected: usize,
        got: usize,
        nr_channels: usize,
        nr_taps: usize,
    },

    #[error("The number of channels ({0}) must be a power of two")]
    ChannelsNotPowerOfTwo(usize),

    #[error("The number of taps must be at least 1")]
    NoTaps,

    #[error("The prototype filter has no DC response for channel {channel}; try another window or more taps")]
    DegenerateChannel { channel: usize },
}
