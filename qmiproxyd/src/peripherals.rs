// src/peripherals.rs

//! Interfaces to the hardware collaborators the proxy drives as side effects.
//!
//! Mixer control and the host wake line live outside this daemon's core; the
//! proxy only tells them what to do. The default implementations log the
//! request so a build without those drivers still runs end to end.

use log::info;
use std::time::Duration;

use crate::constants::CallMode;

/// The audio path a call needs.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AudioProfile {
    CircuitSwitched,
    VoLte,
}

impl AudioProfile {
    pub fn for_mode(mode: CallMode) -> Self {
        match mode {
            CallMode::Lte => AudioProfile::VoLte,
            _ => AudioProfile::CircuitSwitched,
        }
    }
}

pub trait AudioControl: Send {
    fn start_audio(&mut self, profile: AudioProfile);
    fn stop_audio(&mut self);
}

pub trait HostWaker: Send {
    /// Raises the host wake line and holds it for `hold`.
    fn wake_host(&mut self, hold: Duration);
}

/// Records audio requests without touching a mixer.
#[derive(Debug, Default)]
pub struct LoggingAudio {
    active: Option<AudioProfile>,
}

impl AudioControl for LoggingAudio {
    fn start_audio(&mut self, profile: AudioProfile) {
        if self.active != Some(profile) {
            info!("Audio on: {:?}", profile);
            self.active = Some(profile);
        }
    }

    fn stop_audio(&mut self) {
        if self.active.take().is_some() {
            info!("Audio off");
        }
    }
}

/// Records wake requests without touching a GPIO.
#[derive(Debug, Default)]
pub struct LoggingWaker;

impl HostWaker for LoggingWaker {
    fn wake_host(&mut self, hold: Duration) {
        info!("Waking host for {:?}", hold);
    }
}
