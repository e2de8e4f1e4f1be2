//! Priority event queue: FIFO within a band, bands drain high to low

use std::collections::VecDeque;

use super::{Event, Priority};

#[derive(Debug, Default)]
pub struct EventQueue {
    bands: [VecDeque<Event>; Priority::COUNT],
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.bands[event.priority().band()].push_back(event);
    }

    /// Next event of the highest non-empty band
    pub fn pop(&mut self) -> Option<Event> {
        self.bands.iter_mut().rev().find_map(|band| band.pop_front())
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(VecDeque::is_empty)
    }

    /// Drop every queued event without running a handler; returns how many
    pub fn clear(&mut self) -> usize {
        let count = self.len();
        for band in self.bands.iter_mut() {
            band.clear();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(event: Event) -> u32 {
        event.downcast::<u32>().unwrap()
    }

    #[test]
    fn test_fifo_within_band() {
        let mut queue = EventQueue::new();
        for i in 0..5u32 {
            queue.push(Event::new(i));
        }

        let drained: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(value).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_higher_bands_drain_first() {
        let mut queue = EventQueue::new();
        queue.push(Event::new(1u32).with_priority(Priority::Low));
        queue.push(Event::new(2u32));
        queue.push(Event::new(3u32).with_priority(Priority::Critical));
        queue.push(Event::new(4u32).with_priority(Priority::High));
        queue.push(Event::new(5u32));

        let drained: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(value).collect();
        assert_eq!(drained, vec![3, 4, 2, 5, 1]);
    }

    #[test]
    fn test_clear_counts_dropped() {
        let mut queue = EventQueue::new();
        queue.push(Event::new(1u32));
        queue.push(Event::new(2u32).with_priority(Priority::High));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }
}
