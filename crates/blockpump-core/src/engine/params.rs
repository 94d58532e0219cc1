//! Parameter storage shared by the engine backends
//!
//! Each control handle owns a fixed-length array of floats. Reads and writes
//! address a sub-range by offset; anything past the end is a size mismatch.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{ControlHandle, EngineError, EngineResult};

#[derive(Default)]
pub(crate) struct ParameterTable {
    values: Mutex<HashMap<ControlHandle, Vec<f32>>>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_range(len: usize, offset: usize, count: usize) -> EngineResult<()> {
        match offset.checked_add(count) {
            Some(end) if end <= len && count > 0 => Ok(()),
            _ => Err(EngineError::SizeMismatch {
                expected: len.saturating_sub(offset),
                actual: count,
            }),
        }
    }

    /// Replace the whole table
    pub fn reset<I>(&self, entries: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = (ControlHandle, Vec<f32>)>,
    {
        let mut values = self.values.lock().map_err(|_| EngineError::Poisoned)?;
        *values = entries.into_iter().collect();
        Ok(())
    }

    pub fn set(&self, handle: ControlHandle, src: &[f32], offset: usize) -> EngineResult<()> {
        let mut values = self.values.lock().map_err(|_| EngineError::Poisoned)?;
        let slot = values
            .get_mut(&handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        Self::check_range(slot.len(), offset, src.len())?;
        slot[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn get(&self, handle: ControlHandle, dest: &mut [f32], offset: usize) -> EngineResult<()> {
        let values = self.values.lock().map_err(|_| EngineError::Poisoned)?;
        let slot = values.get(&handle).ok_or(EngineError::InvalidHandle(handle))?;
        Self::check_range(slot.len(), offset, dest.len())?;
        dest.copy_from_slice(&slot[offset..offset + dest.len()]);
        Ok(())
    }

    /// First element of a parameter, if the handle exists
    pub fn scalar(&self, handle: ControlHandle) -> Option<f32> {
        let values = self.values.lock().ok()?;
        values.get(&handle).and_then(|v| v.first().copied())
    }

    pub fn contains(&self, handle: ControlHandle) -> bool {
        self.values
            .lock()
            .map(|v| v.contains_key(&handle))
            .unwrap_or(false)
    }
}
