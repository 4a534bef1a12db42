use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a reentrancy flag for the lifetime of a pass. The flag is released
/// on drop, so a pass future dropped mid-await does not leave it stuck.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    /// `None` if another pass already holds the flag.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let flag = AtomicBool::new(false);
        let first = FlagGuard::acquire(&flag);
        assert!(first.is_some());
        assert!(FlagGuard::acquire(&flag).is_none());
        drop(first);
        assert!(FlagGuard::acquire(&flag).is_some());
    }
}
