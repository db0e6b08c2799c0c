//! Process-table renaming.
//!
//! A waiting booster shows up as `booster-<tag>`; once it has consumed a
//! request it shows the target's name instead. Two mechanisms cooperate:
//! `prctl(PR_SET_NAME)` for the kernel comm (what `top` shows), and an
//! in-place overwrite of the argv region (what `ps` shows). The argv region
//! is located through `/proc/self/stat`; writes never go past its original
//! end, shorter titles are NUL-padded.
//!
//! Renaming is best-effort. A failure must never abort a launch, so errors
//! are logged at debug and swallowed.

use std::ffi::CString;
use std::fs;

use tracing::debug;

/// Kernel comm limit is 16 bytes including the NUL.
const COMM_MAX: usize = 15;

pub fn set(title: &str) {
    set_comm(title);
    if let Some((start, end)) = argv_region() {
        overwrite_region(start, end, title.as_bytes());
    } else {
        debug!("argv region unavailable, comm rename only");
    }
}

fn set_comm(title: &str) {
    let comm: Vec<u8> = title
        .bytes()
        .filter(|&b| b != 0)
        .take(COMM_MAX)
        .collect();
    if let Ok(name) = CString::new(comm) {
        if let Err(e) = nix::sys::prctl::set_name(&name) {
            debug!("prctl name change failed: {e}");
        }
    }
}

/// `arg_start`/`arg_end` from `/proc/self/stat` (fields 48 and 49). The comm
/// field can itself contain spaces and parentheses, so parsing starts after
/// the last `)`.
fn argv_region() -> Option<(usize, usize)> {
    let stat = fs::read_to_string("/proc/self/stat").ok()?;
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    let start: usize = fields.get(45)?.parse().ok()?;
    let end: usize = fields.get(46)?.parse().ok()?;
    if start == 0 || end <= start {
        return None;
    }
    Some((start, end))
}

fn overwrite_region(start: usize, end: usize, title: &[u8]) {
    let len = end - start;
    // Leave room for a terminating NUL inside the original region.
    let copy = title.len().min(len.saturating_sub(1));

    unsafe {
        let dst = start as *mut u8;
        std::ptr::copy_nonoverlapping(title.as_ptr(), dst, copy);
        std::ptr::write_bytes(dst.add(copy), 0, len - copy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_reflects_title() {
        set("prewarm-title");
        let comm = nix::sys::prctl::get_name().unwrap();
        assert_eq!(comm.to_str().unwrap(), "prewarm-title");
    }

    #[test]
    fn long_title_is_truncated_in_comm() {
        set("a-title-well-past-the-comm-limit");
        let comm = nix::sys::prctl::get_name().unwrap();
        assert_eq!(comm.to_bytes().len(), COMM_MAX);
    }

    #[test]
    fn argv_region_is_sane() {
        let (start, end) = argv_region().expect("test runner has an argv region");
        assert!(start < end);
    }
}
