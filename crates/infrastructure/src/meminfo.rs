use std::io;
use std::path::PathBuf;

use ports::secondary::memory_port::MemoryProbe;

use crate::constants::{PAGE_SIZE, PROC_MEMINFO};

/// Reads available memory from `/proc/meminfo` as
/// `MemFree + Buffers + Cached`, converted to pages.
pub struct MeminfoProbe {
    path: PathBuf,
}

impl MeminfoProbe {
    pub fn new() -> Self {
        Self::with_path(PROC_MEMINFO)
    }

    /// Probe an alternate file with the same format.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for MeminfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for MeminfoProbe {
    fn available_pages(&self) -> io::Result<u64> {
        let content = std::fs::read_to_string(&self.path)?;
        let kb = available_kb_from(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: missing MemFree/Buffers/Cached", self.path.display()),
            )
        })?;
        Ok(kb * 1024 / PAGE_SIZE)
    }
}

/// Sum `MemFree`, `Buffers` and `Cached` in kB. All three must be present.
fn available_kb_from(content: &str) -> Option<u64> {
    let mut free = None;
    let mut buffers = None;
    let mut cached = None;
    for line in content.lines() {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match name {
            "MemFree" => &mut free,
            "Buffers" => &mut buffers,
            "Cached" => &mut cached,
            _ => continue,
        };
        // Format: "  12345 kB"
        let trimmed = rest.trim();
        let kb_str = trimmed.strip_suffix("kB").unwrap_or(trimmed).trim();
        *slot = Some(kb_str.parse::<u64>().ok()?);
    }
    Some(free? + buffers? + cached?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = "\
MemTotal:       16303976 kB
MemFree:          409600 kB
MemAvailable:    9000000 kB
Buffers:           40960 kB
Cached:          4096000 kB
SwapCached:            0 kB
";

    #[test]
    fn sums_free_buffers_cached() {
        assert_eq!(available_kb_from(SAMPLE), Some(409_600 + 40_960 + 4_096_000));
    }

    #[test]
    fn swap_cached_is_not_cached() {
        let content = "MemFree: 1 kB\nBuffers: 2 kB\nSwapCached: 100 kB\nCached: 3 kB\n";
        assert_eq!(available_kb_from(content), Some(6));
    }

    #[test]
    fn missing_field_is_none() {
        assert_eq!(available_kb_from("MemFree: 1 kB\nCached: 3 kB\n"), None);
        assert_eq!(available_kb_from(""), None);
    }

    #[test]
    fn garbage_value_is_none() {
        assert_eq!(
            available_kb_from("MemFree: lots kB\nBuffers: 2 kB\nCached: 3 kB\n"),
            None
        );
    }

    #[test]
    fn probe_converts_to_pages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemFree: 8 kB\nBuffers: 4 kB\nCached: 4 kB").unwrap();
        let probe = MeminfoProbe::with_path(file.path());
        assert_eq!(probe.available_pages().unwrap(), 4);
    }

    #[test]
    fn probe_reports_unreadable_file() {
        let probe = MeminfoProbe::with_path("/nonexistent/meminfo");
        assert!(probe.available_pages().is_err());
    }

    #[test]
    fn probe_reports_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemTotal: 8 kB").unwrap();
        let probe = MeminfoProbe::with_path(file.path());
        let err = probe.available_pages().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn live_meminfo_is_readable() {
        if std::path::Path::new(PROC_MEMINFO).exists() {
            assert!(MeminfoProbe::new().available_pages().unwrap() > 0);
        }
    }
}
