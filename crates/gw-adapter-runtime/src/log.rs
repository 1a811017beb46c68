//! Bounded buffer of recent process output

use std::collections::VecDeque;

/// Keeps the last `capacity` lines, dropping the oldest first
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let mut ring = LogRing::new(100);
        for i in 0..250 {
            ring.push(format!("line {}", i));
            assert!(ring.len() <= 100);
        }
        let lines = ring.lines();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "line 150");
        assert_eq!(lines[99], "line 249");
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut ring = LogRing::new(0);
        ring.push("ignored");
        assert!(ring.is_empty());
    }
}
