//! Process hook lifecycle
//!
//! [`ProcessHook`] attaches to a process by main window title, tracks whether
//! the game is loaded, and exposes memory access and code injection while
//! attached. The host drives it by calling [`ProcessHook::refresh`], either on
//! its own schedule or through [`ProcessHook::poll_until`].

mod check;
mod events;
mod state;

pub use check::{LoadedCheck, PointerLoadedCheck};
pub use events::{EventHandler, HookCallback, HookEvent};
pub use state::{HookState, LoadTracker, LoadTransition, NOT_LOADED};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::asm::{Assemble, IcedAssembler};
use crate::config::HookConfig;
use crate::error::{ConfigError, InjectError};
use crate::inject::{Allocation, CodeInjector};
use crate::memory::{platform_finder, MemoryAccessor, ProcessFinder, ProcessMemory};

/// Serializable snapshot of a hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookStatus {
    pub window_title: String,
    pub state: HookState,
    pub process_id: Option<u32>,
    pub base_address: Option<usize>,
    pub game_loaded_time_ms: i64,
    pub refresh_interval_ms: u64,
}

impl HookStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Attachment to a game process plus its loaded state
pub struct ProcessHook<L = PointerLoadedCheck> {
    config: HookConfig,
    finder: Box<dyn ProcessFinder>,
    check: L,
    assembler: Box<dyn Assemble>,
    /// Present exactly while attached
    memory: Option<MemoryAccessor>,
    base_address: usize,
    tracker: LoadTracker,
    events: EventHandler,
}

impl ProcessHook<PointerLoadedCheck> {
    /// Hook whose loaded check follows the configured `loaded_pointer`
    pub fn from_config(config: HookConfig) -> Result<Self, ConfigError> {
        Self::from_config_with_finder(config, platform_finder())
    }

    pub fn from_config_with_finder(
        config: HookConfig,
        finder: Box<dyn ProcessFinder>,
    ) -> Result<Self, ConfigError> {
        let check = config
            .loaded_pointer
            .as_ref()
            .map(PointerLoadedCheck::from_config)
            .ok_or_else(|| {
                ConfigError::Invalid("loaded_pointer is required to build the loaded check".into())
            })?;
        Self::with_finder(config, finder, check)
    }
}

impl<L: LoadedCheck> ProcessHook<L> {
    /// Hook using the platform's process finder
    pub fn new(config: HookConfig, check: L) -> Result<Self, ConfigError> {
        Self::with_finder(config, platform_finder(), check)
    }

    pub fn with_finder(
        config: HookConfig,
        finder: Box<dyn ProcessFinder>,
        check: L,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tracker: LoadTracker::new(config.refresh_interval_ms),
            config,
            finder,
            check,
            assembler: Box::new(IcedAssembler::new()),
            memory: None,
            base_address: 0,
            events: EventHandler::new(),
        })
    }

    /// Replace the assembler used by the code operations
    pub fn with_assembler(mut self, assembler: Box<dyn Assemble>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.config.refresh_interval_ms)
    }

    /// Register a listener; events are delivered synchronously from `refresh` and `detach`
    pub fn on_event(&mut self, callback: HookCallback) {
        self.events.on_event(callback);
    }

    /// Re-validate the attachment, attach if needed and advance the loaded state
    pub fn refresh(&mut self) -> Vec<HookEvent> {
        let mut events = Vec::new();

        let exited = self
            .memory
            .as_ref()
            .is_some_and(|memory| !memory.process().is_valid());
        if exited {
            log::info!("Process {} is gone", self.process_id().unwrap_or(0));
            self.release(&mut events);
        }

        if self.memory.is_none() {
            self.try_attach(&mut events);
        }

        if let Some(memory) = &self.memory {
            let loaded_now = self.check.is_loaded(memory);
            if let Some(transition) = self.tracker.advance(loaded_now) {
                log::info!("Game {:?}", transition);
                events.push(transition.into());
            }
        }

        self.emit(&events);
        events
    }

    /// Drop the attachment
    ///
    /// Reports an unload first when the game was loaded.
    pub fn detach(&mut self) -> Vec<HookEvent> {
        let mut events = Vec::new();
        if self.memory.is_some() {
            log::info!("Detaching from process {}", self.process_id().unwrap_or(0));
            self.release(&mut events);
        }
        self.emit(&events);
        events
    }

    /// Refresh every interval until `running` is cleared
    pub fn poll_until(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            self.refresh();
            std::thread::sleep(self.refresh_interval());
        }
    }

    fn try_attach(&mut self, events: &mut Vec<HookEvent>) {
        let Some(pid) = self.finder.find_process(&self.config.window_title) else {
            return;
        };
        let Some(process) = self.finder.open_process(pid) else {
            log::debug!("Found process {} but could not open it", pid);
            return;
        };

        let min_lifetime = Duration::from_millis(self.config.min_lifetime_ms);
        if let Some(uptime) = process.uptime() {
            if uptime < min_lifetime {
                log::debug!(
                    "Process {} is too young ({:?} < {:?})",
                    pid,
                    uptime,
                    min_lifetime
                );
                return;
            }
        }

        let process: Arc<dyn ProcessMemory> = Arc::from(process);
        self.base_address = process.base_address();
        log::info!(
            "Attached to '{}' (pid {}, base 0x{:X})",
            self.config.window_title,
            pid,
            self.base_address
        );

        self.memory = Some(MemoryAccessor::new(process));
        events.push(HookEvent::Hooked {
            process_id: pid,
            base_address: self.base_address,
        });
    }

    fn release(&mut self, events: &mut Vec<HookEvent>) {
        if let Some(transition) = self.tracker.reset() {
            events.push(transition.into());
        }
        self.memory = None;
        self.base_address = 0;
        events.push(HookEvent::Unhooked);
    }

    fn emit(&self, events: &[HookEvent]) {
        for event in events {
            self.events.emit(event);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.memory.is_some()
    }

    pub fn is_game_loaded(&self) -> bool {
        self.is_attached() && self.tracker.is_loaded()
    }

    pub fn state(&self) -> HookState {
        match (self.is_attached(), self.tracker.is_loaded()) {
            (false, _) => HookState::Unattached,
            (true, false) => HookState::NotLoaded,
            (true, true) => HookState::Loaded,
        }
    }

    /// Attached and owning the foreground window
    pub fn focused(&self) -> bool {
        match self.process_id() {
            Some(pid) => self.finder.foreground_process_id() == Some(pid),
            None => false,
        }
    }

    /// Milliseconds since the game loaded, or [`NOT_LOADED`]
    pub fn game_loaded_time_ms(&self) -> i64 {
        self.tracker.elapsed_ms()
    }

    pub fn elapsed_loaded_time(&self) -> Option<Duration> {
        u64::try_from(self.tracker.elapsed_ms())
            .ok()
            .map(Duration::from_millis)
    }

    /// Main module base captured on attach
    pub fn base_address(&self) -> Option<usize> {
        self.memory.as_ref().map(|_| self.base_address)
    }

    pub fn process_id(&self) -> Option<u32> {
        self.memory.as_ref().map(|m| m.process().process_id())
    }

    /// Memory access for the attached process
    pub fn memory(&self) -> Option<&MemoryAccessor> {
        self.memory.as_ref()
    }

    pub fn status(&self) -> HookStatus {
        HookStatus {
            window_title: self.config.window_title.clone(),
            state: self.state(),
            process_id: self.process_id(),
            base_address: self.base_address(),
            game_loaded_time_ms: self.game_loaded_time_ms(),
            refresh_interval_ms: self.config.refresh_interval_ms,
        }
    }

    fn injector(&self) -> Result<CodeInjector<'_>, InjectError> {
        let memory = self.memory.as_ref().ok_or(InjectError::NotAttached)?;
        Ok(CodeInjector::new(memory.process(), self.assembler.as_ref())
            .with_radius(self.config.allocation_radius))
    }

    /// Assemble, run to completion in the target and release the code
    pub fn assemble_and_execute(&self, source: &str) -> Result<(), InjectError> {
        self.injector()?.assemble_and_execute(source)
    }

    /// Patch `site_len` bytes at `address`, padding with `nop`
    pub fn assemble_and_inject(
        &self,
        source: &str,
        address: usize,
        site_len: usize,
    ) -> Result<Vec<u8>, InjectError> {
        self.injector()?.assemble_and_inject(source, address, site_len)
    }

    /// Assemble into memory the caller owns; release it with [`Self::free_allocation`]
    pub fn assemble_allocate_write(
        &self,
        source: &str,
        near: Option<usize>,
        executable: bool,
    ) -> Result<Allocation, InjectError> {
        self.injector()?
            .assemble_allocate_write(source, near, executable)
    }

    pub fn free_allocation(&self, allocation: Allocation) -> Result<bool, InjectError> {
        Ok(self.injector()?.free(allocation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MockProcess, MockProcessFinder, PointerChain};

    const BASE: usize = 0x140000000;

    fn hook_with<L: LoadedCheck>(finder: &MockProcessFinder, check: L) -> ProcessHook<L> {
        let config = HookConfig::new("Game").with_refresh_interval(100);
        ProcessHook::with_finder(config, Box::new(finder.clone()), check).unwrap()
    }

    #[test]
    fn test_unattached_without_process() {
        let finder = MockProcessFinder::new();
        let mut hook = hook_with(&finder, |_: &MemoryAccessor| true);

        assert!(hook.refresh().is_empty());
        assert_eq!(hook.state(), HookState::Unattached);
        assert_eq!(hook.game_loaded_time_ms(), NOT_LOADED);
        assert_eq!(hook.base_address(), None);
        assert!(!hook.focused());
    }

    #[test]
    fn test_from_config_uses_loaded_pointer() {
        let process = MockProcess::new();
        let finder = MockProcessFinder::new();
        finder.add_process("Game", process.clone());
        let config = HookConfig::new("Game").with_loaded_pointer(0x200, &[0x18]);

        let mut hook = ProcessHook::from_config_with_finder(config, Box::new(finder)).unwrap();
        assert_eq!(hook.check.chain(), &PointerChain::module_offset(0x200, &[0x18]));

        process.poke_ptr(BASE + 0x200, 0x2000_0000);
        process.poke_ptr(0x2000_0018, 0);
        hook.refresh();
        assert_eq!(hook.state(), HookState::NotLoaded);

        process.poke_ptr(0x2000_0018, 0x3000_0000);
        assert_eq!(hook.refresh(), vec![HookEvent::GameLoaded]);
        assert!(hook.is_game_loaded());
    }

    #[test]
    fn test_from_config_requires_loaded_pointer() {
        let finder = MockProcessFinder::new();
        let result = ProcessHook::from_config_with_finder(HookConfig::new("Game"), Box::new(finder));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_attach_captures_base() {
        let finder = MockProcessFinder::new();
        finder.add_process("Game", MockProcess::new().with_pid(7));
        let mut hook = hook_with(&finder, |_: &MemoryAccessor| false);

        let events = hook.refresh();
        assert_eq!(
            events,
            vec![HookEvent::Hooked {
                process_id: 7,
                base_address: BASE
            }]
        );
        assert_eq!(hook.state(), HookState::NotLoaded);
        assert_eq!(hook.process_id(), Some(7));
        assert_eq!(hook.base_address(), Some(BASE));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let finder = MockProcessFinder::new();
        let result = ProcessHook::with_finder(
            HookConfig::new(""),
            Box::new(finder),
            |_: &MemoryAccessor| true,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pointer_check_drives_state() {
        let process = MockProcess::new();
        let finder = MockProcessFinder::new();
        finder.add_process("Game", process.clone());
        let check = PointerLoadedCheck::new(PointerChain::module_offset(0x200, &[0]));
        let mut hook = hook_with(&finder, check);

        hook.refresh();
        assert_eq!(hook.state(), HookState::NotLoaded);

        process.poke_ptr(BASE + 0x200, 0x2000_0000);
        process.poke_ptr(0x2000_0000, 0x3000_0000);
        assert_eq!(hook.refresh(), vec![HookEvent::GameLoaded]);
        assert_eq!(hook.state(), HookState::Loaded);
        assert_eq!(hook.elapsed_loaded_time(), Some(Duration::ZERO));
    }

    #[test]
    fn test_code_operations_need_attachment() {
        let finder = MockProcessFinder::new();
        let hook = hook_with(&finder, |_: &MemoryAccessor| false);

        assert!(matches!(
            hook.assemble_and_execute("ret"),
            Err(InjectError::NotAttached)
        ));
        assert!(matches!(
            hook.assemble_and_inject("nop", BASE, 1),
            Err(InjectError::NotAttached)
        ));
        assert!(matches!(
            hook.assemble_allocate_write("ret", None, true),
            Err(InjectError::NotAttached)
        ));
    }

    #[test]
    fn test_status_json() {
        let finder = MockProcessFinder::new();
        finder.add_process("Game", MockProcess::new().with_pid(9));
        let mut hook = hook_with(&finder, |_: &MemoryAccessor| true);
        hook.refresh();

        let status = hook.status();
        assert_eq!(status.state, HookState::Loaded);
        assert_eq!(status.game_loaded_time_ms, 0);

        let parsed: HookStatus = serde_json::from_str(&status.to_json().unwrap()).unwrap();
        assert_eq!(parsed, status);
        assert!(status.to_json().unwrap().contains("\"state\":\"loaded\""));
    }

    #[test]
    fn test_poll_until_stops() {
        let finder = MockProcessFinder::new();
        finder.add_process("Game", MockProcess::new());
        let config = HookConfig::new("Game").with_refresh_interval(1);
        let mut calls = 0;
        let running = AtomicBool::new(true);
        {
            let mut hook = ProcessHook::with_finder(
                config,
                Box::new(finder),
                |_: &MemoryAccessor| {
                    calls += 1;
                    if calls == 3 {
                        running.store(false, Ordering::SeqCst);
                    }
                    true
                },
            )
            .unwrap();
            hook.poll_until(&running);
            assert_eq!(hook.game_loaded_time_ms(), 2);
        }
        assert_eq!(calls, 3);
    }
}
