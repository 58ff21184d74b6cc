//! Traits for process memory access and process discovery
//!
//! These traits allow for dependency injection, enabling mock implementations
//! for testing without requiring actual running processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Lowest address the allocator will ever hand out
pub const MIN_USER_ADDRESS: usize = 0x10000;

/// Highest canonical user-mode address on x64
pub const MAX_USER_ADDRESS: usize = 0x7FFF_FFFF_FFFF;

/// Page protection requested for an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Protection {
    /// Data only
    ReadWrite,
    /// Code that will be executed or jumped to
    ReadWriteExecute,
}

/// State of a region of the target's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free,
    Reserved,
    Committed,
}

/// A contiguous region of the target's address space with uniform state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
    pub state: RegionState,
}

impl MemoryRegion {
    /// One past the last address of the region
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn is_free(&self) -> bool {
        self.state == RegionState::Free
    }
}

/// Trait for reading, writing and managing memory of an attached process
///
/// Read and write failures are routine (unmapped or protected pages, a process
/// exiting mid-call) and are reported through `Option`/`bool`.
pub trait ProcessMemory: Send + Sync {
    /// Read raw bytes from memory
    fn read_bytes(&self, address: usize, size: usize) -> Option<Vec<u8>>;

    /// Write raw bytes to memory
    fn write_bytes(&self, address: usize, data: &[u8]) -> bool;

    /// Check if the process is still running
    fn is_valid(&self) -> bool;

    /// Process ID
    fn process_id(&self) -> u32;

    /// Base address of the main module
    fn base_address(&self) -> usize;

    /// Size of the main module
    fn module_size(&self) -> usize;

    /// Whether pointers in the target are 8 bytes wide
    fn is_64_bit(&self) -> bool {
        true
    }

    /// How long the process has been running, if the platform can tell
    fn uptime(&self) -> Option<Duration> {
        None
    }

    /// Describe the region containing `address`
    fn query_region(&self, _address: usize) -> Option<MemoryRegion> {
        None
    }

    /// Reserve and commit `size` bytes, at `address` when given
    fn allocate(&self, _address: Option<usize>, _size: usize, _protection: Protection) -> Option<usize> {
        None
    }

    /// Release an allocation made by [`ProcessMemory::allocate`]
    fn free(&self, _address: usize) -> bool {
        false
    }

    /// Run code at `address` on a new thread in the target and wait for it to return
    fn execute(&self, _address: usize) -> bool {
        false
    }

    /// Alignment of addresses returned by [`ProcessMemory::allocate`]
    fn allocation_granularity(&self) -> usize {
        0x10000
    }

    /// Read a u32 from memory
    fn read_u32(&self, address: usize) -> Option<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Some(u32::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Read a u64 from memory
    fn read_u64(&self, address: usize) -> Option<u64> {
        let bytes = self.read_bytes(address, 8)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Read a pointer sized for the target process
    fn read_ptr(&self, address: usize) -> Option<usize> {
        if self.is_64_bit() {
            self.read_u64(address).map(|v| v as usize)
        } else {
            self.read_u32(address).map(|v| v as usize)
        }
    }
}

/// Trait for finding and attaching to processes
pub trait ProcessFinder: Send + Sync {
    /// Find a process whose main window title equals `window_title`
    fn find_process(&self, window_title: &str) -> Option<u32>;

    /// Open a process for reading, writing and code injection
    fn open_process(&self, pid: u32) -> Option<Box<dyn ProcessMemory>>;

    /// Process owning the current foreground window
    fn foreground_process_id(&self) -> Option<u32>;
}

// =============================================================================
// Mock Implementations for Testing
// =============================================================================

const MOCK_PAGE_SIZE: usize = 0x1000;

struct MockState {
    /// Byte-granular memory contents
    memory: BTreeMap<usize, u8>,
    pid: u32,
    base: usize,
    size: usize,
    valid: bool,
    is_64_bit: bool,
    uptime: Option<Duration>,
    /// Extra occupied ranges seen by `query_region`
    reserved: Vec<(usize, usize)>,
    /// Live allocations: address -> (size, protection)
    allocations: BTreeMap<usize, (usize, Protection)>,
    /// Ranges that reject writes
    protected: Vec<(usize, usize)>,
    freed: Vec<usize>,
    executed: Vec<usize>,
    reads: usize,
    writes: usize,
    allocation_enabled: bool,
    execute_succeeds: bool,
}

/// In-memory stand-in for a live process
///
/// Clones share state, so a test can keep one handle while the hook owns another.
#[derive(Clone)]
pub struct MockProcess {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcess {
    /// Create a new mock process
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                memory: BTreeMap::new(),
                pid: 1000,
                base: 0x140000000,
                size: 0x4000000,
                valid: true,
                is_64_bit: true,
                uptime: None,
                reserved: Vec::new(),
                allocations: BTreeMap::new(),
                protected: Vec::new(),
                freed: Vec::new(),
                executed: Vec::new(),
                reads: 0,
                writes: 0,
                allocation_enabled: true,
                execute_succeeds: true,
            })),
        }
    }

    /// Set the process ID
    pub fn with_pid(self, pid: u32) -> Self {
        self.state.lock().pid = pid;
        self
    }

    /// Set the base address
    pub fn with_base(self, base: usize) -> Self {
        self.state.lock().base = base;
        self
    }

    /// Set the module size
    pub fn with_size(self, size: usize) -> Self {
        self.state.lock().size = size;
        self
    }

    /// Set how long the process has been running
    pub fn with_uptime(self, uptime: Duration) -> Self {
        self.state.lock().uptime = Some(uptime);
        self
    }

    /// Use 4-byte pointers
    pub fn with_32_bit(self) -> Self {
        self.state.lock().is_64_bit = false;
        self
    }

    /// Store bytes without counting as a process write
    pub fn poke(&self, address: usize, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, &byte) in data.iter().enumerate() {
            state.memory.insert(address + i, byte);
        }
    }

    /// Store a u32
    pub fn poke_u32(&self, address: usize, value: u32) {
        self.poke(address, &value.to_ne_bytes());
    }

    /// Store a pointer-sized value
    pub fn poke_ptr(&self, address: usize, value: usize) {
        if self.state.lock().is_64_bit {
            self.poke(address, &(value as u64).to_ne_bytes());
        } else {
            self.poke(address, &(value as u32).to_ne_bytes());
        }
    }

    /// Inspect bytes without counting as a process read
    pub fn peek(&self, address: usize, size: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        (address..address + size)
            .map(|a| state.memory.get(&a).copied())
            .collect()
    }

    /// Simulate process exit
    pub fn invalidate(&self) {
        self.state.lock().valid = false;
    }

    /// Make every later allocation attempt fail
    pub fn deny_allocations(&self) {
        self.state.lock().allocation_enabled = false;
    }

    /// Make every later remote execution fail
    pub fn fail_execution(&self) {
        self.state.lock().execute_succeeds = false;
    }

    /// Mark a range as mapped so the allocator has to avoid it
    pub fn reserve(&self, address: usize, size: usize) {
        self.state.lock().reserved.push((address, size));
    }

    /// Make writes into a range fail
    pub fn protect(&self, address: usize, size: usize) {
        self.state.lock().protected.push((address, size));
    }

    /// Number of `read_bytes` calls performed so far
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    /// Number of successful `write_bytes` calls performed so far
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    /// Allocations that have not been freed: (address, size, protection)
    pub fn live_allocations(&self) -> Vec<(usize, usize, Protection)> {
        self.state
            .lock()
            .allocations
            .iter()
            .map(|(&address, &(size, protection))| (address, size, protection))
            .collect()
    }

    /// Addresses passed to a successful `free`
    pub fn freed(&self) -> Vec<usize> {
        self.state.lock().freed.clone()
    }

    /// Addresses passed to `execute`
    pub fn executed(&self) -> Vec<usize> {
        self.state.lock().executed.clone()
    }
}

impl MockState {
    fn occupied(&self) -> Vec<(usize, usize)> {
        let mut ranges = vec![(self.base, self.base + self.size)];
        ranges.extend(self.reserved.iter().map(|&(a, s)| (a, a + s)));
        ranges.extend(
            self.allocations
                .iter()
                .map(|(&a, &(s, _))| (a, a + round_up(s, MOCK_PAGE_SIZE))),
        );
        ranges.sort_unstable();
        ranges
    }

    fn overlaps_occupied(&self, start: usize, end: usize) -> bool {
        self.occupied().iter().any(|&(s, e)| start < e && s < end)
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

impl ProcessMemory for MockProcess {
    fn read_bytes(&self, address: usize, size: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.valid {
            return None;
        }
        state.reads += 1;

        let end = address.checked_add(size)?;
        (address..end)
            .map(|a| state.memory.get(&a).copied())
            .collect()
    }

    fn write_bytes(&self, address: usize, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        if !state.valid {
            return false;
        }

        let end = address + data.len();
        if state
            .protected
            .iter()
            .any(|&(a, s)| address < a + s && a < end)
        {
            return false;
        }

        for (i, &byte) in data.iter().enumerate() {
            state.memory.insert(address + i, byte);
        }
        state.writes += 1;
        true
    }

    fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    fn process_id(&self) -> u32 {
        self.state.lock().pid
    }

    fn base_address(&self) -> usize {
        self.state.lock().base
    }

    fn module_size(&self) -> usize {
        self.state.lock().size
    }

    fn is_64_bit(&self) -> bool {
        self.state.lock().is_64_bit
    }

    fn uptime(&self) -> Option<Duration> {
        self.state.lock().uptime
    }

    fn query_region(&self, address: usize) -> Option<MemoryRegion> {
        let state = self.state.lock();
        if !state.valid || !(MIN_USER_ADDRESS..=MAX_USER_ADDRESS).contains(&address) {
            return None;
        }

        let occupied = state.occupied();
        if let Some(&(start, end)) = occupied.iter().find(|&&(s, e)| (s..e).contains(&address)) {
            return Some(MemoryRegion {
                base: start,
                size: end - start,
                state: RegionState::Committed,
            });
        }

        let free_start = occupied
            .iter()
            .filter(|&&(_, e)| e <= address)
            .map(|&(_, e)| e)
            .max()
            .unwrap_or(MIN_USER_ADDRESS);
        let free_end = occupied
            .iter()
            .filter(|&&(s, _)| s > address)
            .map(|&(s, _)| s)
            .min()
            .unwrap_or(MAX_USER_ADDRESS + 1);

        Some(MemoryRegion {
            base: free_start,
            size: free_end - free_start,
            state: RegionState::Free,
        })
    }

    fn allocate(&self, address: Option<usize>, size: usize, protection: Protection) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.valid || !state.allocation_enabled || size == 0 {
            return None;
        }

        let granularity = 0x10000;
        let span = round_up(size, MOCK_PAGE_SIZE);
        let start = match address {
            Some(requested) => {
                let start = requested / granularity * granularity;
                if start < MIN_USER_ADDRESS
                    || start + span > MAX_USER_ADDRESS + 1
                    || state.overlaps_occupied(start, start + span)
                {
                    return None;
                }
                start
            }
            None => {
                let mut candidate = 0x7FF0_0000_0000usize;
                while state.overlaps_occupied(candidate, candidate + span) {
                    candidate += granularity;
                }
                candidate
            }
        };

        state.allocations.insert(start, (size, protection));
        for a in start..start + size {
            state.memory.insert(a, 0);
        }
        Some(start)
    }

    fn free(&self, address: usize) -> bool {
        let mut state = self.state.lock();
        let Some((size, _)) = state.allocations.remove(&address) else {
            return false;
        };
        for a in address..address + size {
            state.memory.remove(&a);
        }
        state.freed.push(address);
        true
    }

    fn execute(&self, address: usize) -> bool {
        let mut state = self.state.lock();
        if !state.valid {
            return false;
        }
        state.executed.push(address);
        state.execute_succeeds
    }

    fn allocation_granularity(&self) -> usize {
        0x10000
    }
}

struct FinderState {
    /// (window title, process)
    processes: Vec<(String, MockProcess)>,
    foreground: Option<u32>,
}

/// Mock process finder for testing
///
/// Clones share state, like [`MockProcess`].
#[derive(Clone)]
pub struct MockProcessFinder {
    state: Arc<Mutex<FinderState>>,
}

impl Default for MockProcessFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessFinder {
    /// Create a new mock process finder
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FinderState {
                processes: Vec::new(),
                foreground: None,
            })),
        }
    }

    /// Add a mock process with the given main window title
    pub fn add_process(&self, window_title: &str, process: MockProcess) {
        self.state
            .lock()
            .processes
            .push((window_title.to_string(), process));
    }

    /// Remove a mock process entirely
    pub fn remove_process(&self, pid: u32) {
        self.state
            .lock()
            .processes
            .retain(|(_, p)| p.process_id() != pid);
    }

    /// Set the process owning the foreground window
    pub fn set_foreground(&self, pid: Option<u32>) {
        self.state.lock().foreground = pid;
    }
}

impl ProcessFinder for MockProcessFinder {
    fn find_process(&self, window_title: &str) -> Option<u32> {
        self.state
            .lock()
            .processes
            .iter()
            .find(|(title, process)| title == window_title && process.is_valid())
            .map(|(_, process)| process.process_id())
    }

    fn open_process(&self, pid: u32) -> Option<Box<dyn ProcessMemory>> {
        let by_pid: HashMap<u32, MockProcess> = self
            .state
            .lock()
            .processes
            .iter()
            .map(|(_, p)| (p.process_id(), p.clone()))
            .collect();
        by_pid
            .get(&pid)
            .cloned()
            .map(|p| Box::new(p) as Box<dyn ProcessMemory>)
    }

    fn foreground_process_id(&self) -> Option<u32> {
        self.state.lock().foreground
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns fewer bytes than asked for
    struct TruncatingProcess;

    impl ProcessMemory for TruncatingProcess {
        fn read_bytes(&self, _address: usize, size: usize) -> Option<Vec<u8>> {
            Some(vec![0xAB; size / 2])
        }

        fn write_bytes(&self, _address: usize, _data: &[u8]) -> bool {
            false
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn process_id(&self) -> u32 {
            1
        }

        fn base_address(&self) -> usize {
            0x400000
        }

        fn module_size(&self) -> usize {
            0x1000
        }
    }

    #[test]
    fn test_short_read_yields_none() {
        let process = TruncatingProcess;
        assert_eq!(process.read_u32(0x400000), None);
        assert_eq!(process.read_u64(0x400000), None);
        assert_eq!(process.read_ptr(0x400000), None);
    }

    #[test]
    fn test_mock_process_new() {
        let process = MockProcess::new();
        assert!(process.is_valid());
        assert_eq!(process.base_address(), 0x140000000);
        assert_eq!(process.module_size(), 0x4000000);
        assert!(process.is_64_bit());
    }

    #[test]
    fn test_mock_process_builders() {
        let process = MockProcess::new()
            .with_pid(42)
            .with_base(0x7FFE0000)
            .with_size(0x1000)
            .with_uptime(Duration::from_secs(3));
        assert_eq!(process.process_id(), 42);
        assert_eq!(process.base_address(), 0x7FFE0000);
        assert_eq!(process.module_size(), 0x1000);
        assert_eq!(process.uptime(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_mock_process_write_and_read() {
        let process = MockProcess::new();
        assert!(process.write_bytes(0x1000, &[1, 2, 3, 4, 5]));
        assert_eq!(process.read_bytes(0x1001, 3), Some(vec![2, 3, 4]));
        assert_eq!(process.read_u32(0x1000), Some(u32::from_ne_bytes([1, 2, 3, 4])));
    }

    #[test]
    fn test_mock_process_overlapping_writes() {
        let process = MockProcess::new();
        process.poke(0x1000, &[0; 8]);
        assert!(process.write_bytes(0x1004, &[0xAA, 0xBB]));
        assert_eq!(
            process.read_bytes(0x1000, 8),
            Some(vec![0, 0, 0, 0, 0xAA, 0xBB, 0, 0])
        );
    }

    #[test]
    fn test_mock_process_read_unmapped() {
        let process = MockProcess::new();
        process.poke(0x1000, &[1, 2]);
        assert_eq!(process.read_bytes(0x1000, 4), None);
        assert_eq!(process.read_u64(0x9999), None);
    }

    #[test]
    fn test_mock_process_invalidate() {
        let process = MockProcess::new();
        process.poke_u32(0x1000, 7);
        process.invalidate();
        assert!(!process.is_valid());
        assert_eq!(process.read_u32(0x1000), None);
        assert!(!process.write_bytes(0x1000, &[1]));
    }

    #[test]
    fn test_mock_process_protected_range() {
        let process = MockProcess::new();
        process.protect(0x2000, 0x10);
        assert!(!process.write_bytes(0x200C, &[0; 8]));
        assert!(process.write_bytes(0x2010, &[0; 8]));
        assert_eq!(process.write_count(), 1);
    }

    #[test]
    fn test_mock_process_ptr_width() {
        let process = MockProcess::new().with_32_bit();
        process.poke_ptr(0x1000, 0x2000);
        assert_eq!(process.peek(0x1000, 4), Some(0x2000u32.to_ne_bytes().to_vec()));
        assert_eq!(process.read_ptr(0x1000), Some(0x2000));
    }

    #[test]
    fn test_mock_process_clone_shares_state() {
        let process = MockProcess::new();
        let other = process.clone();
        other.poke_u32(0x1000, 0xDEADBEEF);
        assert_eq!(process.read_u32(0x1000), Some(0xDEADBEEF));
        assert_eq!(other.read_count(), 1);
    }

    #[test]
    fn test_mock_query_region_module() {
        let process = MockProcess::new();
        let region = process.query_region(0x140000010).unwrap();
        assert_eq!(region.base, 0x140000000);
        assert_eq!(region.state, RegionState::Committed);
    }

    #[test]
    fn test_mock_query_region_free_gap() {
        let process = MockProcess::new();
        process.reserve(0x100000000, 0x10000);
        let region = process.query_region(0x120000000).unwrap();
        assert!(region.is_free());
        assert_eq!(region.base, 0x100010000);
        assert_eq!(region.end(), 0x140000000);
    }

    #[test]
    fn test_mock_allocate_and_free() {
        let process = MockProcess::new();
        let address = process
            .allocate(Some(0x13FFF0000), 0x20, Protection::ReadWriteExecute)
            .unwrap();
        assert_eq!(address, 0x13FFF0000);
        assert_eq!(process.read_bytes(address, 0x20), Some(vec![0; 0x20]));
        assert_eq!(
            process.live_allocations(),
            vec![(address, 0x20, Protection::ReadWriteExecute)]
        );

        // Occupied now
        assert!(process.allocate(Some(0x13FFF0000), 0x20, Protection::ReadWrite).is_none());

        assert!(process.free(address));
        assert!(!process.free(address));
        assert!(process.live_allocations().is_empty());
        assert_eq!(process.freed(), vec![address]);
    }

    #[test]
    fn test_mock_allocate_inside_module_fails() {
        let process = MockProcess::new();
        assert!(process
            .allocate(Some(0x140010000), 0x10, Protection::ReadWrite)
            .is_none());
    }

    #[test]
    fn test_mock_deny_allocations() {
        let process = MockProcess::new();
        process.deny_allocations();
        assert!(process.allocate(None, 0x10, Protection::ReadWrite).is_none());
    }

    #[test]
    fn test_mock_execute() {
        let process = MockProcess::new();
        assert!(process.execute(0x1234));
        process.fail_execution();
        assert!(!process.execute(0x5678));
        assert_eq!(process.executed(), vec![0x1234, 0x5678]);
    }

    // =============================================================================
    // MockProcessFinder tests
    // =============================================================================

    #[test]
    fn test_mock_finder_not_found() {
        let finder = MockProcessFinder::new();
        assert_eq!(finder.find_process("ELDEN RING™"), None);
    }

    #[test]
    fn test_mock_finder_matches_exact_title() {
        let finder = MockProcessFinder::new();
        finder.add_process("DARK SOULS III", MockProcess::new().with_pid(1234));

        assert_eq!(finder.find_process("DARK SOULS III"), Some(1234));
        assert_eq!(finder.find_process("dark souls iii"), None);
    }

    #[test]
    fn test_mock_finder_skips_exited_process() {
        let finder = MockProcessFinder::new();
        let process = MockProcess::new().with_pid(1234);
        finder.add_process("Game", process.clone());
        process.invalidate();

        assert_eq!(finder.find_process("Game"), None);
    }

    #[test]
    fn test_mock_finder_open_process() {
        let finder = MockProcessFinder::new();
        let process = MockProcess::new().with_pid(1234);
        process.poke_u32(0x1000, 0xDEADBEEF);
        finder.add_process("Game", process);

        let opened = finder.open_process(1234).unwrap();
        assert_eq!(opened.read_u32(0x1000), Some(0xDEADBEEF));
        assert!(finder.open_process(9999).is_none());
    }

    #[test]
    fn test_mock_finder_foreground() {
        let finder = MockProcessFinder::new();
        assert_eq!(finder.foreground_process_id(), None);
        finder.set_foreground(Some(77));
        assert_eq!(finder.foreground_process_id(), Some(77));
    }
}
