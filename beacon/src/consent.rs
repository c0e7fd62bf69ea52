use std::collections::{HashMap, VecDeque};

use crate::event::CapturedEvent;

/// Per-backend consent decisions. Consent is deny-by-default: a backend
/// that was never granted, or is unknown, reads as denied.
pub struct ConsentGate {
    granted: HashMap<String, bool>,
}

impl ConsentGate {
    pub fn new(backends: &[String]) -> Self {
        ConsentGate {
            granted: backends.iter().map(|name| (name.clone(), false)).collect(),
        }
    }

    pub fn knows(&self, backend: &str) -> bool {
        self.granted.contains_key(backend)
    }

    /// Returns true when the stored decision actually changed.
    pub fn set(&mut self, backend: &str, granted: bool) -> bool {
        match self.granted.get_mut(backend) {
            Some(current) if *current != granted => {
                *current = granted;
                true
            }
            _ => false,
        }
    }

    pub fn is_granted(&self, backend: &str) -> bool {
        self.granted.get(backend).copied().unwrap_or(false)
    }

    pub fn any_granted(&self) -> bool {
        self.granted.values().any(|granted| *granted)
    }
}

/// Events held while consent is unresolved, one bounded sublist per
/// backend. Each backend gets its own clone of every event so a grant for
/// one never disturbs what the others are still holding.
pub struct ConsentBuffer {
    sublists: HashMap<String, VecDeque<CapturedEvent>>,
    capacity: usize,
}

impl ConsentBuffer {
    pub fn new(backends: &[String], capacity: usize) -> Self {
        ConsentBuffer {
            sublists: backends
                .iter()
                .map(|name| (name.clone(), VecDeque::new()))
                .collect(),
            capacity,
        }
    }

    /// Clone `event` into every sublist, dropping each sublist's oldest
    /// entry if it is full. Returns how many events were dropped.
    pub fn buffer_all(&mut self, event: &CapturedEvent) -> usize {
        let mut dropped = 0;
        for sublist in self.sublists.values_mut() {
            if sublist.len() >= self.capacity {
                sublist.pop_front();
                dropped += 1;
            }
            sublist.push_back(event.clone());
        }
        dropped
    }

    /// Take the whole sublist for `backend`, leaving it empty.
    pub fn take(&mut self, backend: &str) -> Vec<CapturedEvent> {
        self.sublists
            .get_mut(backend)
            .map(|sublist| sublist.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put unflushed events back at the front, preserving order.
    pub fn restore(&mut self, backend: &str, events: Vec<CapturedEvent>) {
        if let Some(sublist) = self.sublists.get_mut(backend) {
            for event in events.into_iter().rev() {
                sublist.push_front(event);
            }
            sublist.truncate(self.capacity);
        }
    }

    /// Discard everything held for `backend`, returning the count.
    pub fn clear(&mut self, backend: &str) -> usize {
        match self.sublists.get_mut(backend) {
            Some(sublist) => {
                let cleared = sublist.len();
                sublist.clear();
                cleared
            }
            None => 0,
        }
    }

    pub fn clear_all(&mut self) {
        for sublist in self.sublists.values_mut() {
            sublist.clear();
        }
    }

    pub fn len(&self, backend: &str) -> usize {
        self.sublists.get(backend).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.sublists.values().all(VecDeque::is_empty)
    }
}
