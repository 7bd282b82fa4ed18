// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod channel;
pub mod frame;
pub mod relay;
pub mod rewrite;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use channel::{
    normalize_interface, validate_pair, ChannelConfig, ChannelConnection, ChannelDriver, ChannelId,
    ChannelInfo, ChannelRole, ConfigError, OpenError, RecvError, SendError, DEFAULT_BITRATE,
};
pub use frame::{Frame, FrameError};
pub use relay::{Relay, RelaySettings, StartError, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETURN_TIMEOUT};
pub use rewrite::{RewriteRule, RewriteTable, RuleError};
