use thiserror::Error;

/// The four ASCII bytes "lava" read as a big-endian word.
pub const MAGIC: u32 = 0x6C61_7661;

/// Largest knob value that is still accepted (exclusive).
pub const KNOB_LIMIT: u16 = 0xFFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("Knob value {0:#x} out of range, must be below {KNOB_LIMIT:#x}")]
    KnobOutOfRange(u16),
}

/// How a bug id is turned into the 4 bytes written over its DUA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    #[default]
    Plain,
    /// Low half identifies the bug, high half carries the knob.
    Knob(u16),
}

impl TriggerMode {
    pub fn encode(self, bug_id: u64) -> Result<[u8; 4], TriggerError> {
        match self {
            TriggerMode::Plain => Ok(encode_plain(bug_id)),
            TriggerMode::Knob(knob) => encode_knob(bug_id, knob),
        }
    }
}

/// `MAGIC - bug_id` modulo 2^32, little-endian.
pub fn encode_plain(bug_id: u64) -> [u8; 4] {
    MAGIC.wrapping_sub(bug_id as u32).to_le_bytes()
}

/// `(knob << 16) | ((MAGIC & 0xFFFF) - bug_id mod 2^16)`, little-endian.
pub fn encode_knob(bug_id: u64, knob: u16) -> Result<[u8; 4], TriggerError> {
    if knob >= KNOB_LIMIT {
        return Err(TriggerError::KnobOutOfRange(knob));
    }
    let trigger16 = (MAGIC as u16).wrapping_sub(bug_id as u16);
    let packed = (u32::from(knob) << 16) | u32::from(trigger16);
    Ok(packed.to_le_bytes())
}
