//! Named fault-injection points for I/O paths.
//!
//! A point fires when it was enabled on the current thread or listed in the
//! comma-separated `GRANITE_FAILPOINTS` environment variable.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

pub const HEAP_FILE_WRITE: &str = "heap_file.write_page";
pub const HEAP_FILE_READ: &str = "heap_file.read_page";
pub const IMAGE_LOG_APPEND: &str = "image_log.append";

const ENV_VAR: &str = "GRANITE_FAILPOINTS";

thread_local! {
    /// Armed points of this thread and how many more hits they fail; `None`
    /// fails every hit.
    static ARMED: RefCell<HashMap<String, Option<usize>>> = RefCell::new(HashMap::new());
}

/// Arms `name` on this thread until [`disable`] is called.
pub fn enable(name: &str) {
    ARMED.with(|armed| {
        armed.borrow_mut().insert(name.to_string(), None);
    });
}

/// Arms `name` on this thread for its next `hits` hits only.
pub fn enable_times(name: &str, hits: usize) {
    ARMED.with(|armed| {
        armed.borrow_mut().insert(name.to_string(), Some(hits));
    });
}

pub fn disable(name: &str) {
    ARMED.with(|armed| {
        armed.borrow_mut().remove(name);
    });
}

/// Disarms every point of this thread.
pub fn clear() {
    ARMED.with(|armed| armed.borrow_mut().clear());
}

/// Whether the next hit of `name` fails. Does not consume a limited hit.
pub fn is_enabled(name: &str) -> bool {
    let armed = ARMED.with(|armed| match armed.borrow().get(name) {
        Some(None) => true,
        Some(Some(left)) => *left > 0,
        None => false,
    });
    armed || env_lists(name)
}

fn env_lists(name: &str) -> bool {
    std::env::var(ENV_VAR)
        .map(|raw| raw.split(',').any(|point| point.trim() == name))
        .unwrap_or(false)
}

/// Called at an I/O site: errors when `name` is armed and counts the hit.
pub fn maybe_fail(name: &str) -> io::Result<()> {
    let fired = ARMED.with(|armed| match armed.borrow_mut().get_mut(name) {
        Some(None) => true,
        Some(Some(left)) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    });
    if fired || env_lists(name) {
        Err(io::Error::other(format!("failpoint {name} fired")))
    } else {
        Ok(())
    }
}

/// Arms a point on the current thread until the guard is dropped.
pub struct FailGuard {
    name: &'static str,
}

impl FailGuard {
    pub fn new(name: &'static str) -> Self {
        enable(name);
        Self { name }
    }

    /// Fails only the next `hits` hits of `name`.
    pub fn times(name: &'static str, hits: usize) -> Self {
        enable_times(name, hits);
        Self { name }
    }
}

impl Drop for FailGuard {
    fn drop(&mut self) {
        disable(self.name);
    }
}
