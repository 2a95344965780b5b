//! RTP/RTCP port-pair allocator
//!
//! The pool holds every even port in the configured range; allocation hands
//! out `(port, port + 1)` and marks both used. Shared between the signaling
//! loop (allocation during SDP rewrite) and the media teardown path, so the
//! interior state is mutex-guarded.

use crate::error::{RelayError, RelayResult, ResourceType};
use std::collections::HashMap;
use std::sync::Mutex;

pub const RTP_PORT_START: u16 = 20000;
pub const RTP_PORT_END: u16 = 30000;

/// Pool usage counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortStats {
    pub total_pairs: usize,
    pub used_pairs: usize,
    pub available_pairs: usize,
}

struct AllocatorInner {
    available: Vec<u16>,
    allocated: HashMap<u16, String>, // port -> call id
    total_pairs: usize,
}

pub struct PortAllocator {
    inner: Mutex<AllocatorInner>,
}

impl PortAllocator {
    /// Pool over `[start, end)`, even RTP ports paired with odd RTCP ports
    pub fn new(start: u16, end: u16) -> Self {
        let start = if start % 2 == 0 { start } else { start + 1 };
        let available: Vec<u16> = (start..end).step_by(2).collect();
        let total_pairs = available.len();
        PortAllocator {
            inner: Mutex::new(AllocatorInner {
                available,
                allocated: HashMap::new(),
                total_pairs,
            }),
        }
    }

    /// Allocate an (RTP, RTCP) pair for a call
    pub fn allocate_pair(&self, call_id: &str) -> RelayResult<(u16, u16)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.available.is_empty() {
            let total = inner.total_pairs as u64;
            return Err(RelayError::resource_error(
                ResourceType::RtpPorts,
                total,
                total,
            ));
        }
        let rtp = inner.available.remove(0);
        let rtcp = rtp + 1;
        inner.allocated.insert(rtp, call_id.to_string());
        inner.allocated.insert(rtcp, call_id.to_string());
        Ok((rtp, rtcp))
    }

    /// Return a pair to the pool
    pub fn release_pair(&self, rtp: u16, rtcp: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.allocated.remove(&rtp);
        inner.allocated.remove(&rtcp);
        if !inner.available.contains(&rtp) {
            inner.available.push(rtp);
            inner.available.sort_unstable();
        }
    }

    pub fn stats(&self) -> PortStats {
        let inner = self.inner.lock().unwrap();
        let used = inner.allocated.len() / 2;
        PortStats {
            total_pairs: inner.total_pairs,
            used_pairs: used,
            available_pairs: inner.total_pairs - used,
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(RTP_PORT_START, RTP_PORT_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_even_odd() {
        let allocator = PortAllocator::new(20000, 20010);
        let (rtp, rtcp) = allocator.allocate_pair("call-1").unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let allocator = PortAllocator::new(20000, 20004);
        let (a, a1) = allocator.allocate_pair("call-1").unwrap();
        let (b, _b1) = allocator.allocate_pair("call-2").unwrap();
        assert_ne!(a, b);
        let err = allocator.allocate_pair("call-3").unwrap_err();
        assert_eq!(err.category(), "resource");

        allocator.release_pair(a, a1);
        let (c, _) = allocator.allocate_pair("call-3").unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_stats() {
        let allocator = PortAllocator::new(20000, 20008);
        assert_eq!(allocator.stats().total_pairs, 4);
        let (rtp, rtcp) = allocator.allocate_pair("call-1").unwrap();
        assert_eq!(allocator.stats().used_pairs, 1);
        assert_eq!(allocator.stats().available_pairs, 3);
        allocator.release_pair(rtp, rtcp);
        assert_eq!(allocator.stats().used_pairs, 0);
    }

    #[test]
    fn test_double_release_is_harmless() {
        let allocator = PortAllocator::new(20000, 20004);
        let (rtp, rtcp) = allocator.allocate_pair("call-1").unwrap();
        allocator.release_pair(rtp, rtcp);
        allocator.release_pair(rtp, rtcp);
        assert_eq!(allocator.stats().available_pairs, 2);
    }
}
