//! Allocation fault injection for tests. Fallible allocation points in the
//! transport consult try_alloc() before growing a buffer or attaching a
//! counter; a refused allocation surfaces as Error::out_of_memory() and the
//! caller rolls back. In release builds the gate compiles to a constant.
//!
//! Knobs come from the environment on first use, or from the setters below:
//!
//!   MALLOC_FAIL_NTH          fail every Nth gated allocation
//!   MALLOC_FAIL_GREATER_THAN fail any gated allocation above N bytes
//!   MALLOC_GUARDS            extra integrity assertions on guarded paths
//!   DISABLE_MEM_POOLS        disable the loader's spare-buffer pool

#![allow(dead_code)]

#[cfg(any(test, feature = "fault-injection"))]
mod gate {
    use std::env;
    use std::sync::Mutex;
    use std::sync::Once;

    use tracing::debug;

    struct FaultState {
        /// Countdown to the next injected failure. None = disabled.
        counter: Option<u32>,
        /// Reset value for counter after each injected failure. None = one-shot.
        fail_nth: Option<u32>,
        /// How many consecutive allocations fail once the countdown hits zero.
        failures_per_hit: u32,
        failures_left: u32,
        fail_greater_than: Option<usize>,
        guards: bool,
        disable_mem_pools: bool,
    }

    static INIT: Once = Once::new();
    static STATE: Mutex<FaultState> = Mutex::new(FaultState {
        counter: None,
        fail_nth: None,
        failures_per_hit: 1,
        failures_left: 0,
        fail_greater_than: None,
        guards: false,
        disable_mem_pools: false,
    });

    fn init_from_env() {
        INIT.call_once(|| {
            let mut state = STATE.lock().unwrap();
            if let Some(n) = env_u32("MALLOC_FAIL_NTH") {
                state.fail_nth = Some(n);
                state.counter = Some(n);
            }
            if let Some(n) = env_u32("MALLOC_FAIL_GREATER_THAN") {
                state.fail_greater_than = Some(n as usize);
            }
            state.guards = env::var_os("MALLOC_GUARDS").is_some();
            state.disable_mem_pools = env::var_os("DISABLE_MEM_POOLS").is_some();
        });
    }

    fn env_u32(name: &str) -> Option<u32> {
        env::var(name).ok().and_then(|v| v.parse().ok())
    }

    /// Returns false if this allocation should be treated as failed.
    pub fn try_alloc(size: usize) -> bool {
        init_from_env();
        let mut state = STATE.lock().unwrap();

        if let Some(limit) = state.fail_greater_than {
            if size > limit {
                debug!(size, limit, "injecting failure for oversized allocation");
                return false;
            }
        }

        if state.failures_left > 0 {
            state.failures_left -= 1;
            debug!(size, "injecting consecutive allocation failure");
            return false;
        }

        if let Some(counter) = state.counter {
            if counter == 0 {
                state.counter = state.fail_nth;
                state.failures_left = state.failures_per_hit.saturating_sub(1);
                debug!(size, "injecting allocation failure");
                return false;
            }
            state.counter = Some(counter - 1);
        }

        true
    }

    /// Fail the (n+1)th gated allocation from now, once (plus any configured
    /// consecutive failures), then disable the countdown again.
    pub fn set_fail_alloc_counter(n: u32) {
        init_from_env();
        let mut state = STATE.lock().unwrap();
        state.counter = Some(n);
        state.fail_nth = None;
        state.failures_left = 0;
    }

    /// How many consecutive allocations fail each time the countdown fires.
    pub fn set_fail_alloc_failures(count: u32) {
        init_from_env();
        STATE.lock().unwrap().failures_per_hit = count.max(1);
    }

    /// Disable any pending injected failures.
    pub fn clear_fail_alloc() {
        init_from_env();
        let mut state = STATE.lock().unwrap();
        state.counter = None;
        state.fail_nth = None;
        state.failures_left = 0;
    }

    pub fn guards_enabled() -> bool {
        init_from_env();
        STATE.lock().unwrap().guards
    }

    pub fn mem_pools_disabled() -> bool {
        init_from_env();
        STATE.lock().unwrap().disable_mem_pools
    }
}

#[cfg(any(test, feature = "fault-injection"))]
pub use gate::*;

#[cfg(not(any(test, feature = "fault-injection")))]
mod gate {
    #[inline(always)]
    pub fn try_alloc(_size: usize) -> bool {
        true
    }

    #[inline(always)]
    pub fn guards_enabled() -> bool {
        false
    }

    #[inline(always)]
    pub fn mem_pools_disabled() -> bool {
        false
    }
}

#[cfg(not(any(test, feature = "fault-injection")))]
pub use gate::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_fail_alloc_counter() {
        clear_fail_alloc();
        assert!(try_alloc(16));

        set_fail_alloc_counter(2);
        assert!(try_alloc(16));
        assert!(try_alloc(16));
        assert!(!try_alloc(16)); // the countdown fired
        assert!(try_alloc(16)); // one-shot, disabled again

        clear_fail_alloc();
    }
}
