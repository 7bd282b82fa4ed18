// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

/// Highest identifier representable in the 11-bit standard format.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Highest identifier representable in the 29-bit extended format.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit.
pub const MAX_DLC: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("identifier 0x{0:X} exceeds 29 bits")]
    IdOutOfRange(u32),
    #[error("identifier 0x{0:X} does not fit the 11-bit standard format")]
    NotStandard(u32),
    #[error("payload of {0} bytes exceeds {MAX_DLC}")]
    PayloadTooLong(usize),
}

/// Milliseconds elapsed since the process-wide monotonic epoch.
///
/// The epoch is fixed the first time any frame is stamped.
pub fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One frame seen on (or destined for) a bus endpoint.
///
/// Frames are values: rewriting or restamping yields a new frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    id: u32,
    extended: bool,
    data: Vec<u8>,
    timestamp_ms: u64,
}

impl Frame {
    /// Build a frame stamped now. Identifiers above 0x7FF select the
    /// extended format automatically.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        Self::with_format(id, id > STANDARD_ID_MAX, data)
    }

    /// Build a frame with an explicit identifier format.
    pub fn with_format(id: u32, extended: bool, data: &[u8]) -> Result<Self, FrameError> {
        if id > EXTENDED_ID_MAX {
            return Err(FrameError::IdOutOfRange(id));
        }
        if !extended && id > STANDARD_ID_MAX {
            return Err(FrameError::NotStandard(id));
        }
        if data.len() > MAX_DLC {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        Ok(Self {
            id,
            extended,
            data: data.to_vec(),
            timestamp_ms: monotonic_ms(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Copy of this frame carrying `id`, stamped now.
    ///
    /// The extended flag is kept unless `id` needs the extended format.
    pub fn with_id(&self, id: u32) -> Result<Self, FrameError> {
        Self::with_format(id, self.extended || id > STANDARD_ID_MAX, &self.data)
    }

    /// Same frame stamped with the current monotonic time.
    pub fn restamped(self) -> Self {
        Self {
            timestamp_ms: monotonic_ms(),
            ..self
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID=0x{:X} DATA=", self.id)?;
        for (idx, byte) in self.data.iter().enumerate() {
            if idx > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}
