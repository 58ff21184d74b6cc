//! Process finding and module information

#[cfg(target_os = "windows")]
use windows::Win32::Foundation::HANDLE;

/// Information about an attached process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Base address of the main module
    pub base_address: usize,
    /// Size of the main module
    pub module_size: usize,
    /// Whether the process is 64-bit
    pub is_64_bit: bool,
}

/// Information about a module loaded in a process
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Module name
    pub name: String,
    /// Base address
    pub base_address: usize,
    /// Size in bytes
    pub size: usize,
}

#[cfg(target_os = "windows")]
struct TitleSearch<'a> {
    title: &'a str,
    pid: Option<u32>,
}

/// Find the process owning a visible top-level window with this exact title
#[cfg(target_os = "windows")]
pub fn find_process_by_window_title(title: &str) -> Option<u32> {
    use windows::Win32::Foundation::LPARAM;
    use windows::Win32::UI::WindowsAndMessaging::EnumWindows;

    let mut search = TitleSearch { title, pid: None };

    // SAFETY: the callback only dereferences LPARAM as the `TitleSearch` that
    // outlives this call.
    unsafe {
        // Stopping early makes EnumWindows report an error
        let _ = EnumWindows(
            Some(match_window_title),
            LPARAM(&mut search as *mut TitleSearch as isize),
        );
    }

    search.pid
}

#[cfg(target_os = "windows")]
unsafe extern "system" fn match_window_title(
    hwnd: windows::Win32::Foundation::HWND,
    lparam: windows::Win32::Foundation::LPARAM,
) -> windows::Win32::Foundation::BOOL {
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::UI::WindowsAndMessaging::{
        GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible,
    };

    let search = unsafe { &mut *(lparam.0 as *mut TitleSearch) };

    if !unsafe { IsWindowVisible(hwnd) }.as_bool() {
        return BOOL(1);
    }

    let mut buffer = [0u16; 512];
    let len = unsafe { GetWindowTextW(hwnd, &mut buffer) };
    if len <= 0 {
        return BOOL(1);
    }

    if String::from_utf16_lossy(&buffer[..len as usize]) == search.title {
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };
        search.pid = Some(pid);
        return BOOL(0); // Stop enumeration
    }
    BOOL(1)
}

/// Process owning the foreground window
#[cfg(target_os = "windows")]
pub fn foreground_process_id() -> Option<u32> {
    use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

    unsafe {
        let hwnd = GetForegroundWindow();
        if hwnd.0.is_null() {
            return None;
        }
        let mut pid = 0u32;
        GetWindowThreadProcessId(hwnd, Some(&mut pid));
        (pid != 0).then_some(pid)
    }
}

/// Main module (the executable image) of a process
#[cfg(target_os = "windows")]
pub fn main_module_info(pid: u32) -> Option<ModuleInfo> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Module32FirstW, MODULEENTRY32W, TH32CS_SNAPMODULE,
        TH32CS_SNAPMODULE32,
    };

    unsafe {
        let snapshot =
            CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid).ok()?;

        let mut entry = MODULEENTRY32W {
            dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
            ..Default::default()
        };

        // The first module in the snapshot is the executable
        let module = if Module32FirstW(snapshot, &mut entry).is_ok() {
            let name = String::from_utf16_lossy(
                &entry.szModule[..entry
                    .szModule
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(entry.szModule.len())],
            );
            Some(ModuleInfo {
                name,
                base_address: entry.modBaseAddr as usize,
                size: entry.modBaseSize as usize,
            })
        } else {
            None
        };

        let _ = CloseHandle(snapshot);
        module
    }
}

/// Check if a process is 64-bit (Windows)
#[cfg(target_os = "windows")]
pub fn check_is_64_bit(handle: HANDLE) -> bool {
    use windows::Win32::Foundation::BOOL;
    use windows::Win32::System::Threading::IsWow64Process;

    unsafe {
        let mut is_wow64 = BOOL(0);
        if IsWow64Process(handle, &mut is_wow64).is_ok() {
            // WOW64 means a 32-bit process on 64-bit Windows
            return !is_wow64.as_bool();
        }
    }

    std::mem::size_of::<usize>() == 8
}

/// Check if a process is still running by its HANDLE
#[cfg(target_os = "windows")]
pub fn is_process_running_by_handle(handle: HANDLE) -> bool {
    use windows::Win32::System::Threading::GetExitCodeProcess;

    // STILL_ACTIVE is 259 (STATUS_PENDING)
    const STILL_ACTIVE: u32 = 259;

    if handle.is_invalid() {
        return false;
    }

    unsafe {
        let mut exit_code = 0u32;
        if GetExitCodeProcess(handle, &mut exit_code).is_ok() {
            return exit_code == STILL_ACTIVE;
        }
    }

    false
}

/// Find a process by its command name or executable file name (Linux)
///
/// Linux has no portable notion of a main window, so the configured title is
/// matched against the process name instead.
#[cfg(target_os = "linux")]
pub fn find_process_by_name(process_name: &str) -> Option<u32> {
    use std::fs;
    use std::path::Path;

    let wanted = process_name.to_lowercase();

    for entry in fs::read_dir("/proc").ok()?.flatten() {
        let path = entry.path();
        let Some(pid) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };

        let comm = fs::read_to_string(path.join("comm")).unwrap_or_default();
        let exe_name = fs::read_link(path.join("exe"))
            .ok()
            .and_then(|p| Path::new(&p).file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();

        if comm.trim().to_lowercase() == wanted || exe_name.to_lowercase() == wanted {
            return Some(pid);
        }
    }

    None
}

/// One line of /proc/[pid]/maps
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MapsEntry {
    pub start: usize,
    pub end: usize,
    pub path: String,
}

#[cfg(target_os = "linux")]
pub(crate) fn parse_maps(maps: &str) -> Vec<MapsEntry> {
    maps.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (start, end) = parts.next()?.split_once('-')?;
            let path = parts.nth(4).unwrap_or_default().to_string();
            Some(MapsEntry {
                start: usize::from_str_radix(start, 16).ok()?,
                end: usize::from_str_radix(end, 16).ok()?,
                path,
            })
        })
        .collect()
}

#[cfg(target_os = "linux")]
pub(crate) fn read_maps(pid: u32) -> Vec<MapsEntry> {
    std::fs::read_to_string(format!("/proc/{}/maps", pid))
        .map(|maps| parse_maps(&maps))
        .unwrap_or_default()
}

/// Main module (the mapped executable) of a process (Linux)
#[cfg(target_os = "linux")]
pub fn main_module_info(pid: u32) -> Option<ModuleInfo> {
    let exe = std::fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
    let exe = exe.to_string_lossy().to_string();

    let mappings: Vec<MapsEntry> = read_maps(pid)
        .into_iter()
        .filter(|m| m.path == exe)
        .collect();
    let base = mappings.first()?.start;
    let end = mappings.last()?.end;

    let name = std::path::Path::new(&exe)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Some(ModuleInfo {
        name,
        base_address: base,
        size: end - base,
    })
}

/// Check if a process is still running by its PID (Linux)
#[cfg(target_os = "linux")]
pub fn is_process_running(pid: u32) -> bool {
    // Zombies keep their /proc entry
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| stat_field(&stat, 3).map(|state| state != "Z"))
        .unwrap_or(false)
}

/// How long a process has been running (Linux)
#[cfg(target_os = "linux")]
pub fn process_uptime(pid: u32) -> Option<std::time::Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let start_ticks: u64 = stat_field(&stat, 22)?.parse().ok()?;

    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    let system_secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;

    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }

    let started_secs = start_ticks as f64 / ticks_per_sec as f64;
    Some(std::time::Duration::from_secs_f64(
        (system_secs - started_secs).max(0.0),
    ))
}

/// Field `n` (1-based, as in proc(5)) of /proc/[pid]/stat
#[cfg(target_os = "linux")]
fn stat_field(stat: &str, n: usize) -> Option<&str> {
    // comm (field 2) is parenthesised and may contain spaces
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(n.checked_sub(3)?)
}
