//! Capability labels and small label-set utilities.
//!
//! A [`Label`] is a short fixed-size opaque tag compared by exact byte
//! equality.  Drivers register under one or more labels; callers discover and
//! open devices by asking for a label set.  Label lists are unordered and are
//! not deduplicated automatically.

use std::fmt;

use crate::error::{KernelError, Result};

/// Byte length of a label.  Shorter strings are zero-padded.
pub const LABEL_LEN: usize = 16;

/// A fixed-size opaque capability tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label([u8; LABEL_LEN]);

impl Label {
    /// The all-zero label, used to wipe label slots on unregistration.
    pub const EMPTY: Label = Label([0; LABEL_LEN]);

    /// Build a label from a string of at most [`LABEL_LEN`] bytes.
    pub fn new(tag: &str) -> Result<Self> {
        let bytes = tag.as_bytes();
        if bytes.is_empty() || bytes.len() > LABEL_LEN {
            return Err(KernelError::invalid(format!(
                "label must be 1..={LABEL_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut buf = [0u8; LABEL_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Label(buf))
    }

    /// Build a label from raw bytes.
    pub const fn from_bytes(bytes: [u8; LABEL_LEN]) -> Self {
        Label(bytes)
    }

    /// Raw byte view.
    pub const fn as_bytes(&self) -> &[u8; LABEL_LEN] {
        &self.0
    }

    /// Whether this is the all-zero label.
    pub fn is_empty(&self) -> bool {
        self.0 == [0; LABEL_LEN]
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({self})")
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(LABEL_LEN);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", &self.0[..end]),
        }
    }
}

/// `true` iff every label in `required` appears somewhere in `present`.
///
/// AND semantics over unordered sets: order and duplicates are irrelevant,
/// and an empty `required` list matches everything.
pub fn labels_match(required: &[Label], present: &[Label]) -> bool {
    required.iter().all(|needle| present.contains(needle))
}

/// A fixed-capacity, unordered collection of labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    items: Vec<Label>,
    capacity: usize,
}

impl LabelSet {
    /// Create an empty set bounded at `capacity` labels.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a set from an existing list, failing if it exceeds `capacity`.
    pub fn from_slice(labels: &[Label], capacity: usize) -> Result<Self> {
        if labels.len() > capacity {
            return Err(KernelError::invalid(format!(
                "label list of {} exceeds capacity {capacity}",
                labels.len()
            )));
        }
        Ok(Self {
            items: labels.to_vec(),
            capacity,
        })
    }

    /// Append one label; fails when the set is at capacity.
    pub fn append(&mut self, label: Label) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(KernelError::invalid("label set is at capacity"));
        }
        self.items.push(label);
        Ok(())
    }

    /// Append every label from `other`; fails if the result would overflow.
    pub fn extend_from(&mut self, other: &[Label]) -> Result<()> {
        if self.items.len() + other.len() > self.capacity {
            return Err(KernelError::invalid("label set is at capacity"));
        }
        self.items.extend_from_slice(other);
        Ok(())
    }

    /// Whether `label` appears in the set.
    pub fn contains(&self, label: &Label) -> bool {
        self.items.contains(label)
    }

    /// Whether every label in `required` appears in the set.
    pub fn contains_all(&self, required: &[Label]) -> bool {
        labels_match(required, &self.items)
    }

    /// Remove the first occurrence of `label`, compacting the set.
    pub fn remove(&mut self, label: &Label) -> Result<()> {
        match self.items.iter().position(|l| l == label) {
            Some(idx) => {
                self.items.remove(idx);
                Ok(())
            }
            None => Err(KernelError::invalid("label not present in set")),
        }
    }

    /// Replace the first occurrence of `old` with `new`, in place.
    pub fn replace(&mut self, old: &Label, new: Label) -> Result<()> {
        match self.items.iter().position(|l| l == old) {
            Some(idx) => {
                self.items[idx] = new;
                Ok(())
            }
            None => Err(KernelError::invalid("label not present in set")),
        }
    }

    /// Drop every label.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Slice view of the labels.
    pub fn as_slice(&self) -> &[Label] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of labels the set can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
