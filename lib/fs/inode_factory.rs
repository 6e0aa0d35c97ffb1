//! Inode address allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use super::InodeAddr;

/// Monotonically increasing inode allocator.
///
/// Addresses are unique for the lifetime of one mounted session and are never reused.
#[derive(Debug)]
pub struct InodeFactory {
    next_inode: AtomicU64,
}

impl InodeFactory {
    /// An allocator whose first address is `start`.
    #[must_use]
    pub fn new(start: InodeAddr) -> Self {
        Self {
            next_inode: AtomicU64::new(start),
        }
    }

    /// Hand out the next unused address.
    #[must_use]
    pub fn allocate(&self) -> InodeAddr {
        self.next_inode.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;

    #[test]
    fn allocation_starts_at_seed_and_increases() {
        let factory = InodeFactory::new(2);
        assert_eq!(factory.allocate(), 2);
        assert_eq!(factory.allocate(), 3);
        assert_eq!(factory.allocate(), 4);
    }

    #[test]
    fn concurrent_allocation_never_repeats() {
        let factory = Arc::new(InodeFactory::new(1));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let factory = Arc::clone(&factory);
                std::thread::spawn(move || (0..1000).map(|_| factory.allocate()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<_> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&8000));
    }
}
