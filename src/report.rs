//! K-Pod input report decoder
//!
//! The K-Pod answers every status request with a fixed 8-byte report:
//!
//! | Byte | Content                                            |
//! |------|----------------------------------------------------|
//! | 0    | Report tag (`0x75` = status)                       |
//! | 1-2  | Encoder ticks since last report, little-endian i16 |
//! | 3    | Button / hold / rocker bit field                   |
//! | 4-7  | Unused                                             |
//!
//! Byte 3 layout: bits 0-3 button index (0 = none), bit 4 hold flag,
//! bits 5-6 rocker switch (0 center, 1 right, 2 left).
//!
//! SPDX-License-Identifier: GPL-3.0

use serde::Serialize;

/// Length of every K-Pod report, inbound and outbound
pub const REPORT_LEN: usize = 8;

/// Report tag for status reports (and status requests)
pub const STATUS_TAG: u8 = 0x75;

/// Report ID used when sending commands (the K-Pod uses unnumbered reports)
pub const COMMAND_REPORT_ID: u8 = 0x00;

/// Outbound command soliciting a fresh status report
pub const STATUS_REQUEST: [u8; REPORT_LEN] = [STATUS_TAG, 0, 0, 0, 0, 0, 0, 0];

/// Bit field masks and shifts for byte 3
mod field {
    pub const BUTTON_MASK: u8 = 0x0F;
    pub const HOLD_MASK: u8 = 0x10;
    pub const ROCKER_MASK: u8 = 0x60;
    pub const ROCKER_SHIFT: u8 = 5;
}

// ============================================================================
// Field types
// ============================================================================

/// Position of the three-way rocker switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rocker {
    Center,
    Right,
    Left,
    /// Reserved value 3, reported by the device in an error state
    Invalid,
}

impl Rocker {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Rocker::Center,
            1 => Rocker::Right,
            2 => Rocker::Left,
            _ => Rocker::Invalid,
        }
    }

    /// Scale hint for encoder turns made in this rocker position
    ///
    /// An invalid rocker position degrades to the center (normal) scale.
    pub fn scale_hint(self) -> ScaleHint {
        match self {
            Rocker::Left => ScaleHint::Coarse,
            Rocker::Center | Rocker::Invalid => ScaleHint::Normal,
            Rocker::Right => ScaleHint::Fine,
        }
    }
}

/// Step size hint for an encoder turn
///
/// The actual multiplier is up to the consumer; nominally coarse is 100x and
/// normal 10x the fine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleHint {
    Coarse,
    Normal,
    Fine,
}

impl ScaleHint {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleHint::Coarse => "coarse",
            ScaleHint::Normal => "normal",
            ScaleHint::Fine => "fine",
        }
    }
}

impl std::fmt::Display for ScaleHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic event decoded from a status report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnobEvent {
    /// The knob was turned; negative deltas are counter-clockwise
    EncoderTurn { delta: i16, scale: ScaleHint },
    /// A button (1-15) was freshly pressed
    ButtonPress { index: u8 },
}

// ============================================================================
// Status report
// ============================================================================

/// Fields of a parsed status report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub ticks: i16,
    pub button: u8,
    pub hold: bool,
    pub rocker: Rocker,
}

impl StatusReport {
    /// Parse a raw report
    ///
    /// Returns `None` for reports shorter than [`REPORT_LEN`] and for any tag
    /// other than [`STATUS_TAG`]; other tags are reserved by the device.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < REPORT_LEN || data[0] != STATUS_TAG {
            return None;
        }

        let ticks = i16::from_le_bytes([data[1], data[2]]);
        let bits = data[3];

        Some(Self {
            ticks,
            button: bits & field::BUTTON_MASK,
            hold: bits & field::HOLD_MASK != 0,
            rocker: Rocker::from_bits((bits & field::ROCKER_MASK) >> field::ROCKER_SHIFT),
        })
    }

    /// Events carried by this report, encoder turn first
    pub fn events(&self) -> Vec<KnobEvent> {
        let mut events = Vec::with_capacity(2);

        if self.ticks != 0 {
            if self.rocker == Rocker::Invalid {
                tracing::debug!(ticks = self.ticks, "Rocker switch reports invalid position, using normal scale");
            }
            events.push(KnobEvent::EncoderTurn {
                delta: self.ticks,
                scale: self.rocker.scale_hint(),
            });
        }

        if self.button > 0 && !self.hold {
            events.push(KnobEvent::ButtonPress { index: self.button });
        }

        events
    }
}

/// Decode a raw input report into zero, one or two events
pub fn decode(data: &[u8]) -> Vec<KnobEvent> {
    match StatusReport::parse(data) {
        Some(report) => {
            tracing::trace!(
                ticks = report.ticks,
                button = report.button,
                hold = report.hold,
                rocker = ?report.rocker,
                "Status report"
            );
            report.events()
        }
        None => Vec::new(),
    }
}
