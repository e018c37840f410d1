//! Reference-counted torch (camera LED) lock.
//!
//! Several consumers may want the torch lit at once (playback pulses, live
//! keying). The physical torch is switched on by the first `acquire` and off
//! by the last release. The count is never set directly: holders get a
//! `TorchGuard` and release by dropping it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CadenceError, Result};
use crate::output::OutputChannel;

/// Platform torch switch.
pub trait TorchDriver: Send + Sync + 'static {
    fn is_supported(&self) -> bool {
        true
    }

    fn set_torch(&self, on: bool) -> Result<()>;
}

/// Driver for devices without a torch. Every request reports `Unsupported`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTorch;

impl TorchDriver for UnsupportedTorch {
    fn is_supported(&self) -> bool {
        false
    }

    fn set_torch(&self, _on: bool) -> Result<()> {
        Err(CadenceError::Unsupported {
            channel: OutputChannel::Torch,
        })
    }
}

pub struct TorchLock {
    driver: Arc<dyn TorchDriver>,
    holders: Mutex<usize>,
}

impl TorchLock {
    pub fn new(driver: Arc<dyn TorchDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            holders: Mutex::new(0),
        })
    }

    /// Take a hold on the torch, switching it on if this is the first one.
    ///
    /// # Errors
    /// `Unsupported` / driver errors when the torch cannot be switched on.
    /// The count is left untouched in that case.
    pub fn acquire(self: &Arc<Self>) -> Result<TorchGuard> {
        if !self.driver.is_supported() {
            return Err(CadenceError::Unsupported {
                channel: OutputChannel::Torch,
            });
        }
        let mut holders = self.holders.lock();
        if *holders == 0 {
            self.driver.set_torch(true)?;
            debug!("torch on");
        }
        *holders += 1;
        Ok(TorchGuard {
            lock: Some(Arc::clone(self)),
        })
    }

    pub fn holders(&self) -> usize {
        *self.holders.lock()
    }

    pub fn is_on(&self) -> bool {
        self.holders() > 0
    }

    fn release(&self) {
        let mut holders = self.holders.lock();
        if *holders == 0 {
            return;
        }
        *holders -= 1;
        if *holders == 0 {
            match self.driver.set_torch(false) {
                Ok(()) => debug!("torch off"),
                Err(e) => warn!("failed to switch torch off: {e}"),
            }
        }
    }
}

impl std::fmt::Debug for TorchLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorchLock")
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}

/// One hold on the torch. Dropping it releases the hold.
#[must_use = "dropping the guard releases the torch immediately"]
pub struct TorchGuard {
    lock: Option<Arc<TorchLock>>,
}

impl TorchGuard {
    /// Release now. Equivalent to dropping; calling it twice is harmless.
    pub fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for TorchGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTorch {
        switches: Mutex<Vec<bool>>,
    }

    impl TorchDriver for RecordingTorch {
        fn set_torch(&self, on: bool) -> Result<()> {
            self.switches.lock().push(on);
            Ok(())
        }
    }

    #[test]
    fn balanced_acquire_release_leaves_torch_off() {
        for n in 1..=5 {
            let driver = Arc::new(RecordingTorch::default());
            let lock = TorchLock::new(driver.clone());
            let guards: Vec<_> = (0..n).map(|_| lock.acquire().unwrap()).collect();
            assert!(lock.is_on());
            drop(guards);
            assert!(!lock.is_on());
            assert_eq!(*driver.switches.lock(), vec![true, false], "n={n}");
        }
    }

    #[test]
    fn fewer_releases_keep_torch_on() {
        let driver = Arc::new(RecordingTorch::default());
        let lock = TorchLock::new(driver.clone());
        let mut guards: Vec<_> = (0..4).map(|_| lock.acquire().unwrap()).collect();
        for _ in 0..3 {
            guards.pop().unwrap().release();
        }
        assert!(lock.is_on());
        assert_eq!(lock.holders(), 1);
        assert_eq!(*driver.switches.lock(), vec![true]);
    }

    #[test]
    fn unsupported_torch_never_counts() {
        let lock = TorchLock::new(Arc::new(UnsupportedTorch));
        assert!(matches!(
            lock.acquire(),
            Err(CadenceError::Unsupported { .. })
        ));
        assert_eq!(lock.holders(), 0);
    }

    #[test]
    fn failed_switch_on_leaves_count_untouched() {
        struct Broken;
        impl TorchDriver for Broken {
            fn set_torch(&self, _on: bool) -> Result<()> {
                Err(CadenceError::driver(OutputChannel::Torch, "camera busy"))
            }
        }
        let lock = TorchLock::new(Arc::new(Broken));
        assert!(lock.acquire().is_err());
        assert!(!lock.is_on());
    }
}
