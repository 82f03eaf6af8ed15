//! Resident memory sampling for context processes.
//!
//! Linux only; elsewhere sampling returns `None` and the memory limit is not
//! enforced.

use std::time::Duration;

/// How often a running context's RSS is sampled.
pub const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `/proc/<pid>/statm` reports pages; 4 KiB pages are assumed.
const PAGE_SIZE_KB: u64 = 4;

/// Resident set size of `pid` in KiB.
#[cfg(target_os = "linux")]
pub fn rss_kib(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    parse_statm_rss_kib(&contents)
}

#[cfg(not(target_os = "linux"))]
pub fn rss_kib(_pid: u32) -> Option<u64> {
    None
}

/// Parse the resident field (second column) of a statm line.
pub(crate) fn parse_statm_rss_kib(statm: &str) -> Option<u64> {
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE_KB)
}

/// True when `rss_kib` is known and above a non-zero limit given in MiB.
pub fn exceeds_limit(rss_kib: Option<u64>, limit_mib: u64) -> bool {
    limit_mib > 0 && rss_kib.is_some_and(|rss| rss > limit_mib.saturating_mul(1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resident_pages() {
        // 65536 pages * 4 KiB = 256 MiB
        assert_eq!(
            parse_statm_rss_kib("120000 65536 1200 10 0 5000 0\n"),
            Some(256 * 1024)
        );
    }

    #[test]
    fn rejects_short_or_garbage_lines() {
        assert_eq!(parse_statm_rss_kib("12345"), None);
        assert_eq!(parse_statm_rss_kib("a b c"), None);
        assert_eq!(parse_statm_rss_kib(""), None);
    }

    #[test]
    fn limit_check() {
        assert!(exceeds_limit(Some(2048 * 1024), 1024));
        assert!(!exceeds_limit(Some(512 * 1024), 1024));
        assert!(!exceeds_limit(Some(1024 * 1024), 1024));
        assert!(!exceeds_limit(None, 1024));
        // Zero disables the limit.
        assert!(!exceeds_limit(Some(4096 * 1024), 0));
    }

    #[test]
    fn one_page_over_limit_counts() {
        // 64 MiB plus a single 4 KiB page.
        let statm = format!("0 {} 0 0 0 0 0", 64 * 256 + 1);
        let rss = parse_statm_rss_kib(&statm);
        assert!(exceeds_limit(rss, 64));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_own_rss() {
        let rss = rss_kib(std::process::id());
        assert!(rss.is_some_and(|kib| kib > 0));
    }
}
