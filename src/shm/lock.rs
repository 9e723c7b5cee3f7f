//! Cross-process segment lock: a TTAS spinlock on a u64 word in the mapping.
//!
//! The word holds 0 when free, otherwise the owner marker
//! `pid << 32 | thread_tag`. Another process can see (and, if the owner
//! process is gone, reclaim) the word; a runtime mutex could do neither.
//!
//! Acquisition backs off in three phases (spin hint, yield, short sleep) and
//! gives up with `LockTimeout` after `max_attempts` tries.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{MapError, Result};

/// How hard to try for a segment lock before reporting a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Total attempts before giving up.
    pub max_attempts: u32,
    /// Attempts separated only by a CPU spin hint.
    pub spin_attempts: u32,
    /// Attempts (after the spin phase) separated by `yield_now`.
    pub yield_attempts: u32,
    /// Pause between the remaining attempts.
    pub sleep: Duration,
    /// Reclaim a lock whose owner process no longer exists.
    pub recover_stale: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            max_attempts: 100_000,
            spin_attempts: 128,
            yield_attempts: 1024,
            sleep: Duration::from_micros(20),
            recover_stale: true,
        }
    }
}

/// Attempts between owner liveness probes once spinning is over.
const STALE_PROBE_INTERVAL: u32 = 256;

static NEXT_THREAD_TAG: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_TAG: u32 = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Marker written into a lock word by the calling thread.
pub fn owner_marker() -> u64 {
    let tag = THREAD_TAG.with(|t| *t);
    ((std::process::id() as u64) << 32) | tag as u64
}

/// Process id encoded in an owner marker.
#[inline]
pub fn marker_pid(marker: u64) -> u32 {
    (marker >> 32) as u32
}

/// Whether a process with this id still exists.
///
/// Our own pid is always alive: a thread of this process that dies while
/// holding a guard releases it during unwinding.
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() || pid == 0 {
        return true;
    }
    #[cfg(unix)]
    {
        // Signal 0 performs the permission and existence checks only.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// A lock word inside segment `segment`.
pub struct SegmentLock<'a> {
    word: &'a AtomicU64,
    segment: usize,
}

impl<'a> SegmentLock<'a> {
    pub fn new(word: &'a AtomicU64, segment: usize) -> Self {
        SegmentLock { word, segment }
    }

    /// Current owner marker, 0 when free.
    pub fn holder(&self) -> u64 {
        self.word.load(Ordering::Relaxed)
    }

    /// One CAS attempt.
    #[cfg(test)]
    pub fn try_lock(&self) -> Option<SegmentGuard<'a>> {
        let me = owner_marker();
        self.word
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| self.guard(me))
    }

    /// Acquire the lock or fail with `LockTimeout` once the policy's budget
    /// is spent.
    pub fn lock(&self, policy: &LockPolicy) -> Result<SegmentGuard<'a>> {
        let me = owner_marker();
        let attempts = policy.max_attempts.max(1);

        for attempt in 0..attempts {
            // Test: read before the CAS to keep the line shared while held
            let current = self.word.load(Ordering::Relaxed);
            if current == 0 {
                if self
                    .word
                    .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(self.guard(me));
                }
            } else if policy.recover_stale
                && attempt >= policy.spin_attempts
                && attempt % STALE_PROBE_INTERVAL == 0
            {
                if let Some(guard) = self.try_recover(current, me) {
                    return Ok(guard);
                }
            }
            backoff(attempt, policy);
        }

        let holder = self.holder();
        if policy.recover_stale && holder != 0 {
            if let Some(guard) = self.try_recover(holder, me) {
                return Ok(guard);
            }
        }
        tracing::warn!(
            segment = self.segment,
            holder = format_args!("{holder:#x}"),
            attempts,
            "timed out acquiring segment lock"
        );
        Err(MapError::LockTimeout {
            segment: self.segment,
            holder,
        })
    }

    /// Take over a lock whose owner process has exited.
    fn try_recover(&self, holder: u64, me: u64) -> Option<SegmentGuard<'a>> {
        let pid = marker_pid(holder);
        if process_alive(pid) {
            return None;
        }
        match self
            .word
            .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                tracing::warn!(
                    segment = self.segment,
                    dead_pid = pid,
                    "recovered segment lock left by an exited process"
                );
                Some(self.guard(me))
            }
            Err(_) => None,
        }
    }

    fn guard(&self, owner: u64) -> SegmentGuard<'a> {
        SegmentGuard {
            word: self.word,
            owner,
            segment: self.segment,
            _not_send: PhantomData,
        }
    }
}

#[inline]
fn backoff(attempt: u32, policy: &LockPolicy) {
    if attempt < policy.spin_attempts {
        std::hint::spin_loop();
    } else if attempt < policy.spin_attempts.saturating_add(policy.yield_attempts) {
        std::thread::yield_now();
    } else {
        std::thread::sleep(policy.sleep);
    }
}

/// Held segment lock. Released on drop, including during unwinding.
///
/// The owner marker names the acquiring thread, so the guard stays on it.
pub struct SegmentGuard<'a> {
    word: &'a AtomicU64,
    owner: u64,
    segment: usize,
    _not_send: PhantomData<*const ()>,
}

impl SegmentGuard<'_> {
    pub fn segment(&self) -> usize {
        self.segment
    }
}

impl Drop for SegmentGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        // Only clear our own marker; a recovered lock belongs to someone else.
        let _ = self
            .word
            .compare_exchange(self.owner, 0, Ordering::Release, Ordering::Relaxed);
    }
}
