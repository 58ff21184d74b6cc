//! Notifications emitted by the hook

use serde::{Deserialize, Serialize};

use super::state::LoadTransition;

/// Something that happened during a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    /// Attached to a matching process
    Hooked { process_id: u32, base_address: usize },
    /// The attached process went away or was detached
    Unhooked,
    GameLoaded,
    GameUnloaded,
}

impl HookEvent {
    /// The load transition this event reports, if any
    pub fn transition(&self) -> Option<LoadTransition> {
        match self {
            Self::GameLoaded => Some(LoadTransition::Loaded),
            Self::GameUnloaded => Some(LoadTransition::Unloaded),
            _ => None,
        }
    }
}

impl From<LoadTransition> for HookEvent {
    fn from(transition: LoadTransition) -> Self {
        match transition {
            LoadTransition::Loaded => Self::GameLoaded,
            LoadTransition::Unloaded => Self::GameUnloaded,
        }
    }
}

/// Callback type for hook events
pub type HookCallback = Box<dyn Fn(&HookEvent) + Send + Sync>;

/// Event handler that can have multiple listeners
#[derive(Default)]
pub struct EventHandler {
    callbacks: Vec<HookCallback>,
}

impl EventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback for hook events
    pub fn on_event(&mut self, callback: HookCallback) {
        self.callbacks.push(callback);
    }

    /// Deliver an event to every listener, in registration order
    pub fn emit(&self, event: &HookEvent) {
        for callback in &self.callbacks {
            callback(event);
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.callbacks.is_empty()
    }
}
