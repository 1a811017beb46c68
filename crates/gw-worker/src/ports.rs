//! Engine port allocation

use crate::config::PortRange;
use std::collections::BTreeSet;

/// Hands out ports from a fixed range, lowest free first
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    used: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            used: BTreeSet::new(),
        }
    }

    /// Take the lowest free port, or `None` when the range is exhausted
    pub fn allocate(&mut self) -> Option<u16> {
        let port = (self.range.start..=self.range.end).find(|p| !self.used.contains(p))?;
        self.used.insert(port);
        Some(port)
    }

    /// Return a port; returns false if it was not allocated
    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.used.len()
    }

    pub fn capacity(&self) -> usize {
        self.range.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_port_first() {
        let mut ports = PortAllocator::new(PortRange::new(8080, 8082));
        assert_eq!(ports.allocate(), Some(8080));
        assert_eq!(ports.allocate(), Some(8081));
        assert!(ports.release(8080));
        assert_eq!(ports.allocate(), Some(8080));
        assert_eq!(ports.allocate(), Some(8082));
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn test_exhaustion() {
        let mut ports = PortAllocator::new(PortRange::new(9000, 9001));
        assert_eq!(ports.capacity(), 2);
        ports.allocate();
        ports.allocate();
        assert_eq!(ports.allocate(), None);
        assert!(!ports.release(9005));
        assert!(ports.release(9001));
        assert_eq!(ports.allocate(), Some(9001));
    }
}
