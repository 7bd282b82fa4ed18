// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod controller;
mod worker;

pub use worker::{Relay, RelaySettings, StartError, DEFAULT_RECEIVE_TIMEOUT, DEFAULT_RETURN_TIMEOUT};
