// /proc/diskstats reader
//
// Sums the cumulative read/write byte counters of every whole disk on the
// host. Used by the local source to derive disk I/O rates.

use std::fs;
use std::io;

const DISKSTATS_PATH: &str = "/proc/diskstats";

/// Size of a diskstats sector; the kernel always reports 512-byte units
const SECTOR_SIZE: u64 = 512;

/// Cumulative bytes read and written across all whole disks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskCounters {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Reads and sums `/proc/diskstats`
///
/// # Errors
/// Returns the I/O error when the file cannot be read (non-Linux hosts,
/// restricted containers).
pub fn read_disk_counters() -> io::Result<DiskCounters> {
    let content = fs::read_to_string(DISKSTATS_PATH)?;
    Ok(parse_disk_counters(&content))
}

/// Parses diskstats content and sums the byte counters of whole disks.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged w_sectors ...
/// Malformed lines are skipped.
pub fn parse_disk_counters(content: &str) -> DiskCounters {
    let mut counters = DiskCounters::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        if !is_whole_disk(parts[2]) {
            continue;
        }

        let get_val =
            |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        counters.read_bytes = counters
            .read_bytes
            .saturating_add(get_val(5).saturating_mul(SECTOR_SIZE));
        counters.written_bytes = counters
            .written_bytes
            .saturating_add(get_val(9).saturating_mul(SECTOR_SIZE));
    }

    counters
}

/// Whether a device name refers to a physical whole disk.
///
/// Partitions are skipped so their traffic is not counted twice, as are
/// virtual devices layered on top of real disks.
fn is_whole_disk(device: &str) -> bool {
    const VIRTUAL_PREFIXES: [&str; 6] = ["loop", "ram", "zram", "dm-", "md", "sr"];
    if VIRTUAL_PREFIXES.iter().any(|prefix| device.starts_with(prefix)) {
        return false;
    }

    // nvme0n1p1, mmcblk0p2
    if device.starts_with("nvme") || device.starts_with("mmcblk") {
        return match device.rfind('p') {
            Some(pos) => {
                let suffix = &device[pos + 1..];
                suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit())
            }
            None => true,
        };
    }

    // sda1, vdb2, xvda1
    !device.ends_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disk_counters_skips_partitions() {
        let content = "\
   8       0 sda 1234 0 100 100 5678 0 200 200 0 150 300 0 0 0 0
   8       1 sda1 1000 0 90 80 5000 0 190 180 0 130 260 0 0 0 0
 259       0 nvme0n1 9999 0 1000 500 8888 0 2000 400 5 1000 2000 0 0 0 0
 259       1 nvme0n1p1 9999 0 999 500 8888 0 1999 400 5 1000 2000 0 0 0 0
   7       0 loop0 10 0 50 1 0 0 0 0 0 1 1 0 0 0 0
 253       0 dm-0 10 0 70 1 10 0 70 0 0 1 1 0 0 0 0
";
        let counters = parse_disk_counters(content);

        assert_eq!(counters.read_bytes, (100 + 1000) * 512);
        assert_eq!(counters.written_bytes, (200 + 2000) * 512);
    }

    #[test]
    fn test_parse_disk_counters_ignores_malformed_lines() {
        let content = "garbage\n   8 0 sda 1 2 3\n";
        assert_eq!(parse_disk_counters(content), DiskCounters::default());
    }

    #[test]
    fn test_is_whole_disk() {
        assert!(is_whole_disk("sda"));
        assert!(is_whole_disk("xvdf"));
        assert!(is_whole_disk("nvme1n1"));
        assert!(is_whole_disk("mmcblk0"));
        assert!(!is_whole_disk("sda3"));
        assert!(!is_whole_disk("nvme1n1p3"));
        assert!(!is_whole_disk("mmcblk0p1"));
        assert!(!is_whole_disk("zram0"));
        assert!(!is_whole_disk("md127"));
    }
}
