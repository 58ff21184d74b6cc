//! Byte signatures for locating patch sites in game code

use super::traits::ProcessMemory;

/// Parse a pattern string into bytes with wildcards
///
/// Pattern format: "48 8B 05 ?? ?? ?? ?? 48 85 C0"
/// - Regular bytes are hex values (e.g., "48", "8B")
/// - Wildcards are "??" or "?" for any byte
///
/// Returns `None` if any token is neither a hex byte nor a wildcard.
pub fn parse_pattern(pattern: &str) -> Option<Vec<Option<u8>>> {
    pattern
        .split_whitespace()
        .map(|s| match s {
            "??" | "?" => Some(None),
            _ => u8::from_str_radix(s, 16).ok().map(Some),
        })
        .collect()
}

/// Turn known bytes into a pattern with no wildcards
///
/// Useful for locating code this crate has just written, e.g. an injected
/// stub whose bytes are known exactly.
pub fn bytes_to_pattern(bytes: &[u8]) -> Vec<Option<u8>> {
    bytes.iter().copied().map(Some).collect()
}

/// Scan a memory range for a pattern
///
/// Returns the address of the first match, or None if not found
pub fn scan_pattern(
    memory: &dyn ProcessMemory,
    base: usize,
    size: usize,
    pattern: &[Option<u8>],
) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > size {
        return None;
    }

    let data = memory.read_bytes(base, size)?;

    data.windows(pattern.len())
        .position(|window| {
            window
                .iter()
                .zip(pattern)
                .all(|(&byte, expected)| expected.map_or(true, |e| e == byte))
        })
        .map(|i| base + i)
}

/// Scan the main module for a pattern
pub fn scan_module(memory: &dyn ProcessMemory, pattern: &[Option<u8>]) -> Option<usize> {
    scan_pattern(memory, memory.base_address(), memory.module_size(), pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockProcess;

    #[test]
    fn test_parse_pattern_basic() {
        let pattern = parse_pattern("48 8B 05");
        assert_eq!(pattern, Some(vec![Some(0x48), Some(0x8B), Some(0x05)]));
    }

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let pattern = parse_pattern("48 8B ?? ? 00");
        assert_eq!(
            pattern,
            Some(vec![Some(0x48), Some(0x8B), None, None, Some(0x00)])
        );
    }

    #[test]
    fn test_parse_pattern_rejects_garbage() {
        assert_eq!(parse_pattern("48 ZZ"), None);
    }

    #[test]
    fn test_parse_pattern_empty() {
        assert_eq!(parse_pattern(""), Some(vec![]));
    }

    #[test]
    fn test_bytes_to_pattern() {
        assert_eq!(
            bytes_to_pattern(&[0xB8, 0x01, 0x00]),
            vec![Some(0xB8), Some(0x01), Some(0x00)]
        );
    }

    #[test]
    fn test_scan_pattern_found() {
        let process = MockProcess::new();
        process.poke(0x1000, &[0x00, 0x48, 0x8B, 0x05, 0x12, 0x34, 0x00, 0x00]);

        let pattern = parse_pattern("48 8B 05").unwrap();
        assert_eq!(scan_pattern(&process, 0x1000, 8, &pattern), Some(0x1001));
    }

    #[test]
    fn test_scan_pattern_match_at_end() {
        let process = MockProcess::new();
        process.poke(0x1000, &[0x00, 0x00, 0x90, 0xC3]);

        let pattern = bytes_to_pattern(&[0x90, 0xC3]);
        assert_eq!(scan_pattern(&process, 0x1000, 4, &pattern), Some(0x1002));
    }

    #[test]
    fn test_scan_pattern_with_wildcard() {
        let process = MockProcess::new();
        process.poke(0x1000, &[0x00, 0x48, 0x8B, 0xFF, 0x12, 0x34, 0x00, 0x00]);

        let pattern = parse_pattern("48 8B ?? 12").unwrap();
        assert_eq!(scan_pattern(&process, 0x1000, 8, &pattern), Some(0x1001));
    }

    #[test]
    fn test_scan_pattern_not_found() {
        let process = MockProcess::new();
        process.poke(0x1000, &[0x00, 0x00, 0x00, 0x00]);

        let pattern = parse_pattern("48 8B 05").unwrap();
        assert_eq!(scan_pattern(&process, 0x1000, 4, &pattern), None);
    }

    #[test]
    fn test_scan_module() {
        let process = MockProcess::new().with_base(0x400000).with_size(0x10);
        process.poke(0x400000, &[0xCC; 0x10]);
        process.poke(0x400009, &[0x48, 0x89, 0x5C]);

        let pattern = parse_pattern("48 89 5C").unwrap();
        assert_eq!(scan_module(&process, &pattern), Some(0x400009));
    }
}
