//! Injected I/O failures for tests.
//!
//! A failpoint is a named site in the I/O path. Enabled failpoints make the
//! site return an error instead of touching the disk. They are armed per
//! thread, or process-wide through `QUARRY_FAILPOINTS=name1,name2`.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

pub const PAGER_READ: &str = "pager.read_page";
pub const PAGER_WRITE: &str = "pager.write_page";
pub const CATALOG_SAVE: &str = "catalog.save";

thread_local! {
    /// Armed failpoints and the number of hits to let through first.
    static FAILPOINTS: RefCell<HashMap<String, usize>> = RefCell::new(HashMap::new());
}

pub fn enable(name: &str) {
    enable_after(name, 0);
}

/// Arms `name` so that it passes `skip` times and fails from then on.
pub fn enable_after(name: &str, skip: usize) {
    FAILPOINTS.with(|points| {
        points.borrow_mut().insert(name.to_string(), skip);
    });
}

pub fn disable(name: &str) {
    FAILPOINTS.with(|points| {
        points.borrow_mut().remove(name);
    });
}

pub fn clear() {
    FAILPOINTS.with(|points| points.borrow_mut().clear());
}

/// Arms `name` until the returned guard is dropped.
pub fn scoped(name: &str) -> FailpointGuard {
    enable(name);
    FailpointGuard {
        name: name.to_string(),
    }
}

pub struct FailpointGuard {
    name: String,
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        disable(&self.name);
    }
}

fn env_enabled(name: &str) -> bool {
    std::env::var("QUARRY_FAILPOINTS")
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

/// Consumes one hit of `name` and reports whether the site should fail.
pub fn is_enabled(name: &str) -> bool {
    let local = FAILPOINTS.with(|points| match points.borrow_mut().get_mut(name) {
        Some(0) => true,
        Some(skip) => {
            *skip -= 1;
            false
        }
        None => false,
    });
    local || env_enabled(name)
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_after_skips_hits() {
        enable_after("test.skip", 2);
        assert!(maybe_fail("test.skip").is_ok());
        assert!(maybe_fail("test.skip").is_ok());
        assert!(maybe_fail("test.skip").is_err());
        assert!(maybe_fail("test.skip").is_err());
        disable("test.skip");
        assert!(maybe_fail("test.skip").is_ok());
    }

    #[test]
    fn test_scoped_guard_disarms() {
        {
            let _guard = scoped("test.scoped");
            assert!(is_enabled("test.scoped"));
        }
        assert!(!is_enabled("test.scoped"));
    }
}
