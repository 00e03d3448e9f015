//! Thread, process and clock queries for the calling thread.

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// The processor the calling thread is running on right now, if the OS can
/// say. The answer can be stale by the time it is used.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_processor_number() -> Option<u32> {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn current_processor_number() -> Option<u32> {
    None
}

pub fn can_get_current_processor_number() -> bool {
    cfg!(any(target_os = "linux", target_os = "android"))
}

/// Gives up the rest of the time slice. `switch_count` is the caller's spin
/// iteration and does not change the behavior.
pub fn yield_thread(_switch_count: u32) {
    // SAFETY: sched_yield has no preconditions.
    unsafe {
        libc::sched_yield();
    }
}

/// Unix has no ideal-processor hint, so there is nothing to move.
pub fn set_current_thread_ideal_affinity(_src_processor: u16, _dst_processor: u16) -> bool {
    true
}

/// Raising priority needs privileges the collector does not assume.
pub fn boost_thread_priority() -> bool {
    false
}

pub fn current_process_id() -> u32 {
    std::process::id()
}

/// OS thread id, only meant for log correlation.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_id_for_logging() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn current_thread_id_for_logging() -> u64 {
    let mut tid = 0u64;
    // SAFETY: a null thread means the calling thread; `tid` is a valid
    // out-parameter.
    unsafe {
        libc::pthread_threadid_np(0, &mut tid);
    }
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios")))]
pub fn current_thread_id_for_logging() -> u64 {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as u64 }
}

fn clock_nanos(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: `ts` is a valid out-parameter.
    let ret = unsafe { libc::clock_gettime(clock, &mut ts) };
    if ret != 0 {
        return 0;
    }
    (ts.tv_sec as i64).saturating_mul(NANOS_PER_SECOND).saturating_add(ts.tv_nsec as i64)
}

/// Monotonic high-resolution counter in [`query_performance_frequency`]
/// ticks per second.
pub fn query_performance_counter() -> i64 {
    clock_nanos(libc::CLOCK_MONOTONIC)
}

pub fn query_performance_frequency() -> i64 {
    NANOS_PER_SECOND
}

/// Cheap monotonic milliseconds with tick-level precision.
pub fn low_precision_timestamp_ms() -> u64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let clock = libc::CLOCK_MONOTONIC_COARSE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let clock = libc::CLOCK_MONOTONIC;

    (clock_nanos(clock) / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_number() {
        if can_get_current_processor_number() {
            let cpu = current_processor_number().unwrap();
            assert!((cpu as usize) < crate::platform::cpuset::MAX_SUPPORTED_CPUS);
        } else {
            assert_eq!(current_processor_number(), None);
        }
    }

    #[test]
    fn test_clocks_are_monotonic() {
        let first = query_performance_counter();
        yield_thread(0);
        let second = query_performance_counter();
        assert!(second >= first);
        assert_eq!(query_performance_frequency(), 1_000_000_000);

        let coarse = low_precision_timestamp_ms();
        assert!(low_precision_timestamp_ms() >= coarse);
    }

    #[test]
    fn test_ids_and_hints() {
        assert_eq!(current_process_id(), std::process::id());
        let main_tid = current_thread_id_for_logging();
        let other_tid = std::thread::spawn(current_thread_id_for_logging).join().unwrap();
        assert_ne!(main_tid, other_tid);

        assert!(set_current_thread_ideal_affinity(0, 1));
        assert!(!boost_thread_priority());
    }
}
