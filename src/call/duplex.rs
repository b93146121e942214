//! Half-duplex audio device ownership
//!
//! Recording and playback take turns holding the device. A lease is held
//! for exactly as long as its recorder or player is alive.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Error, Result};

/// Who currently holds the audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Capture,
    Playback,
}

impl DeviceRole {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Playback => "playback",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single audio device of one call
#[derive(Debug, Clone, Default)]
pub struct AudioDevice {
    holder: Arc<Mutex<Option<DeviceRole>>>,
}

impl AudioDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the device for `role`
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplexViolation`] if the device is already held
    pub fn acquire(&self, role: DeviceRole) -> Result<DeviceLease> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *holder {
            return Err(Error::DuplexViolation(current.as_str()));
        }
        *holder = Some(role);
        tracing::trace!(role = %role, "audio device acquired");

        Ok(DeviceLease {
            holder: Arc::clone(&self.holder),
            role,
        })
    }

    /// Current holder, if any
    #[must_use]
    pub fn holder(&self) -> Option<DeviceRole> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on the [`AudioDevice`]; released on drop
#[derive(Debug)]
pub struct DeviceLease {
    holder: Arc<Mutex<Option<DeviceRole>>>,
    role: DeviceRole,
}

impl DeviceLease {
    #[must_use]
    pub const fn role(&self) -> DeviceRole {
        self.role
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        *holder = None;
        tracing::trace!(role = %self.role, "audio device released");
    }
}
