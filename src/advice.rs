//! Fixed-width advice record codec.
//!
//! The wire record is exactly `1 + 1 + 8 = 10` bytes: a version byte, a
//! state byte, and a little-endian physical block number. Everything past
//! those ten bytes in a request's metadata slot is opaque and must not be
//! interpreted.

/// Length in bytes of an encoded advice record.
pub const ADVICE_RECORD_LEN: usize = 10;

const CURRENT_VERSION: u8 = 2;
const LEGACY_VERSION: u8 = 1;

/// A hint that a chunk was previously stored at `pbn`, carrying an opaque
/// `state` byte defined by the data path. Must be verified before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advice {
    pub state: u8,
    pub pbn: u64,
}

/// Encode `advice` into the fixed-width wire format.
pub fn encode(advice: Advice) -> [u8; ADVICE_RECORD_LEN] {
    let mut buf = [0u8; ADVICE_RECORD_LEN];
    buf[0] = CURRENT_VERSION;
    buf[1] = advice.state;
    buf[2..10].copy_from_slice(&advice.pbn.to_le_bytes());
    buf
}

/// Decode a raw advice record, but only if the request succeeded and the
/// index reported the chunk as found. Any other version than the current
/// one (notably the legacy value `1`) is rejected and logged.
pub fn decode(found: bool, request_succeeded: bool, payload: &[u8; ADVICE_RECORD_LEN]) -> Option<Advice> {
    if !request_succeeded || !found {
        return None;
    }

    let version = payload[0];
    if version != CURRENT_VERSION {
        if version == LEGACY_VERSION {
            tracing::warn!("rejecting legacy-format advice record (version {version})");
        } else {
            tracing::warn!("rejecting advice record with unrecognized version {version}");
        }
        return None;
    }

    let state = payload[1];
    let pbn = u64::from_le_bytes(payload[2..10].try_into().expect("slice is exactly 8 bytes"));
    Some(Advice { state, pbn })
}
