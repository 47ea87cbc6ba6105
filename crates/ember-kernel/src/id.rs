//! Bit-packed device identifiers.
//!
//! A [`DeviceId`] packs a registry slot index together with that slot's
//! generation ("reuse") counter; a [`DeviceHandle`] additionally packs the
//! session slot of one open call.  Both are opaque integers to callers.
//! Decoding exactly inverts encoding, including across reuse-counter
//! wraparound.
//!
//! An ID by itself is never proof of liveness: the registry validates it by
//! comparing the embedded reuse field against the slot's live counter, which
//! is what defeats stale handles after a slot has been freed and reissued.

use std::fmt;

/// Bits reserved for the registry slot index inside a [`DeviceId`].
pub const INDEX_BITS: u32 = 16;
/// Bits reserved for the reuse counter inside a [`DeviceId`].
pub const REUSE_BITS: u32 = 16;
/// Bits reserved for the session slot inside a [`DeviceHandle`].
pub const SESSION_BITS: u32 = 16;

/// Highest representable registry slot count.
pub const MAX_DEVICE_SLOTS: usize = 1 << INDEX_BITS;
/// Highest representable session slot count.
pub const MAX_SESSION_SLOTS: usize = 1 << SESSION_BITS;
/// Largest reuse-counter value before wraparound.
pub const MAX_REUSE: u32 = (1 << REUSE_BITS) - 1;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const SESSION_MASK: u64 = (1 << SESSION_BITS) - 1;

// The two fields must tile a u32 exactly, and the handle must fit a u64.
const _: () = assert!(INDEX_BITS + REUSE_BITS == u32::BITS);
const _: () = assert!(INDEX_BITS + REUSE_BITS + SESSION_BITS <= u64::BITS);

/// Advance a reuse counter, wrapping to 1 (never 0) past [`MAX_REUSE`].
pub(crate) fn next_reuse(reuse: u32) -> u32 {
    if reuse >= MAX_REUSE { 1 } else { reuse + 1 }
}

/// Packed identifier for a registered device: `reuse_count | registry_index`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Pack a reuse counter and registry index.
    pub(crate) fn new(reuse: u32, index: usize) -> Self {
        debug_assert!(index < MAX_DEVICE_SLOTS);
        debug_assert!(reuse <= MAX_REUSE);
        DeviceId((reuse << INDEX_BITS) | (index as u32 & INDEX_MASK))
    }

    /// The registry slot index field.
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// The reuse counter field.
    pub fn reuse(self) -> u32 {
        self.0 >> INDEX_BITS
    }

    /// The packed integer form.
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Reconstruct from the packed integer form.
    pub fn from_raw(raw: u32) -> Self {
        DeviceId(raw)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId(index={}, reuse={})", self.index(), self.reuse())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.reuse())
    }
}

/// Packed identifier for one open session: `device_id | session_index`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Pack a device ID and session slot index.
    pub(crate) fn new(id: DeviceId, session: usize) -> Self {
        debug_assert!(session < MAX_SESSION_SLOTS);
        DeviceHandle(((id.as_raw() as u64) << SESSION_BITS) | (session as u64 & SESSION_MASK))
    }

    /// The device ID field.
    pub fn device_id(self) -> DeviceId {
        DeviceId::from_raw((self.0 >> SESSION_BITS) as u32)
    }

    /// The session slot field.
    pub fn session_index(self) -> usize {
        (self.0 & SESSION_MASK) as usize
    }

    /// The packed integer form.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from the packed integer form.
    pub fn from_raw(raw: u64) -> Self {
        DeviceHandle(raw)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceHandle(device={}, session={})",
            self.device_id(),
            self.session_index()
        )
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id(), self.session_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_round_trip() {
        let id = DeviceId::new(7, 21);
        assert_eq!(id.index(), 21);
        assert_eq!(id.reuse(), 7);
        assert_eq!(DeviceId::from_raw(id.as_raw()), id);
    }

    #[test]
    fn device_id_extremes_round_trip() {
        let id = DeviceId::new(MAX_REUSE, MAX_DEVICE_SLOTS - 1);
        assert_eq!(id.index(), MAX_DEVICE_SLOTS - 1);
        assert_eq!(id.reuse(), MAX_REUSE);

        let id = DeviceId::new(0, 0);
        assert_eq!(id.index(), 0);
        assert_eq!(id.reuse(), 0);
    }

    #[test]
    fn reuse_counter_wraps_to_one() {
        assert_eq!(next_reuse(0), 1);
        assert_eq!(next_reuse(1), 2);
        assert_eq!(next_reuse(MAX_REUSE - 1), MAX_REUSE);
        // Past the field width it rolls to 1, keeping 0 out of circulation.
        assert_eq!(next_reuse(MAX_REUSE), 1);
    }

    #[test]
    fn handle_round_trip() {
        let id = DeviceId::new(3, 5);
        let handle = DeviceHandle::new(id, 2);
        assert_eq!(handle.device_id(), id);
        assert_eq!(handle.session_index(), 2);
        assert_eq!(DeviceHandle::from_raw(handle.as_raw()), handle);
    }

    #[test]
    fn handle_session_extremes() {
        let id = DeviceId::new(MAX_REUSE, MAX_DEVICE_SLOTS - 1);
        let handle = DeviceHandle::new(id, MAX_SESSION_SLOTS - 1);
        assert_eq!(handle.device_id(), id);
        assert_eq!(handle.session_index(), MAX_SESSION_SLOTS - 1);
    }

    #[test]
    fn ids_with_different_reuse_are_distinct() {
        let first = DeviceId::new(1, 4);
        let second = DeviceId::new(2, 4);
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
    }
}
