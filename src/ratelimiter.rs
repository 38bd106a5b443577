use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding one-minute window of accepted connections per client IP.
pub struct RateLimiter {
    connections: HashMap<IpAddr, VecDeque<Instant>>,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_per_minute,
        }
    }

    pub fn check_and_add(&mut self, ip: IpAddr) -> bool {
        self.check_and_add_at(ip, Instant::now())
    }

    fn check_and_add_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        // Forget peers whose whole history has aged out.
        self.connections
            .retain(|_, entries| entries.back().map_or(false, |&t| now.duration_since(t) <= WINDOW));

        let entries = self.connections.entry(ip).or_default();
        while let Some(&time) = entries.front() {
            if now.duration_since(time) > WINDOW {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max_per_minute {
            false
        } else {
            entries.push_back(now);
            true
        }
    }
}
