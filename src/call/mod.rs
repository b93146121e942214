//! Client side of a voice call
//!
//! The controller alternates between recording the user and playing the
//! companion's reply, uploading each utterance to the call endpoint.

pub mod client;
pub mod controller;
pub mod duplex;
pub mod session;

pub use client::{HttpUplink, UplinkReply, VoiceUplink};
pub use controller::{CallDevices, CallSessionController};
pub use duplex::{AudioDevice, DeviceLease, DeviceRole};
pub use session::{CallEvent, CallSession, CallSettings, CallState};
