//! Request-handle allocation: a monotonic `u32` counter that
//! never hands out 0, since 0 is reserved on the wire for "no handle" /ad-hoc
//! fire-and-forget responses and some servers echo it back verbatim (see
//! [`crate::dispatcher::pending`]'s handle-0 fallback).
//!
//! Grounded on the real async-opcua client's `AtomicHandle`, which starts at
//! 1 and wraps past `u32::MAX` back to 1 rather than overflowing into 0.

use std::sync::atomic::{AtomicU32, Ordering};

pub struct HandleAllocator {
    next: AtomicU32,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    pub fn next(&self) -> u32 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let candidate = current.wrapping_add(1);
            let next = if candidate == 0 { 1 } else { candidate };
            if self
                .next
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn never_hands_out_zero() {
        let allocator = HandleAllocator::new();
        for _ in 0..10 {
            assert_ne!(allocator.next(), 0);
        }
    }

    #[test]
    fn handles_are_unique_across_many_calls() {
        let allocator = HandleAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(allocator.next()));
        }
    }

    #[test]
    fn wraps_past_u32_max_back_to_one_skipping_zero() {
        let allocator = HandleAllocator { next: AtomicU32::new(u32::MAX) };
        assert_eq!(allocator.next(), u32::MAX);
        assert_eq!(allocator.next(), 1);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let allocator = Arc::new(HandleAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| allocator.next()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(all.insert(value), "duplicate handle {value}");
            }
        }
    }
}
