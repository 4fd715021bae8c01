//! Scored path sets.
//!
//! Every exchange keeps a small set of addresses it believes the peer is
//! reachable on. Each path has a fixed category score plus a dynamic delta:
//! receiving on a path resets the delta, a failed send demotes it, a
//! confirmed break knocks it below zero. The active path is the best
//! non-negative one.

use std::net::IpAddr;
use std::time::Instant;

use e3x_lob::PathAddr;

/// Reachability class of a path, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCategory {
    /// Same host.
    Loopback,
    /// Private network.
    Lan,
    /// Public internet.
    Wan,
    /// Relayed through a bridge.
    Relay,
}

impl PathCategory {
    /// Base priority for the category.
    pub fn base_priority(self) -> i32 {
        match self {
            PathCategory::Loopback => 8,
            PathCategory::Lan => 6,
            PathCategory::Wan => 4,
            PathCategory::Relay => 1,
        }
    }

    /// Classify an address.
    pub fn of(addr: &PathAddr) -> PathCategory {
        match addr {
            PathAddr::Udp4 { ip, .. } => classify_ip(IpAddr::V4(*ip)),
            PathAddr::Udp6 { ip, .. } => classify_ip(IpAddr::V6(*ip)),
            PathAddr::Relay { .. } | PathAddr::Other(_) => PathCategory::Relay,
        }
    }
}

fn classify_ip(ip: IpAddr) -> PathCategory {
    if ip.is_loopback() {
        return PathCategory::Loopback;
    }
    let private = match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fe80::/10 link-local or fc00::/7 unique-local
            let seg = v6.segments()[0];
            (seg & 0xffc0) == 0xfe80 || (seg & 0xfe00) == 0xfc00
        }
    };
    if private {
        PathCategory::Lan
    } else {
        PathCategory::Wan
    }
}

/// One address with its dynamic score.
#[derive(Debug, Clone)]
pub struct Path {
    /// The address itself.
    pub addr: PathAddr,
    category: PathCategory,
    delta: i32,
    last_rx: Option<Instant>,
}

impl Path {
    fn new(addr: PathAddr) -> Self {
        let category = PathCategory::of(&addr);
        Path {
            addr,
            category,
            delta: 0,
            last_rx: None,
        }
    }

    /// Current priority: category base plus dynamic delta.
    pub fn priority(&self) -> i32 {
        self.category.base_priority() + self.delta
    }

    /// Category this path was classified into.
    pub fn category(&self) -> PathCategory {
        self.category
    }

    fn confirm(&mut self, now: Instant) {
        self.delta = 0;
        self.last_rx = Some(now);
    }

    fn demote(&mut self) {
        self.delta -= 1;
    }

    fn break_path(&mut self) {
        // One break pins the path at priority -3; repeated breaks do not
        // decay it further.
        let penalty = 3 + self.priority();
        if penalty > 0 {
            self.delta -= penalty;
        }
    }
}

/// The per-exchange set of scored paths.
#[derive(Debug, Default)]
pub struct PathSet {
    paths: Vec<Path>,
}

impl PathSet {
    /// Empty set.
    pub fn new() -> Self {
        PathSet::default()
    }

    /// Add an address if it is not already present.
    pub fn add(&mut self, addr: PathAddr) {
        if !self.paths.iter().any(|p| p.addr == addr) {
            self.paths.push(Path::new(addr));
        }
    }

    /// Record a successful receive from an address, adding it if new.
    pub fn confirm(&mut self, addr: &PathAddr, now: Instant) {
        if let Some(p) = self.paths.iter_mut().find(|p| p.addr == *addr) {
            p.confirm(now);
        } else {
            let mut p = Path::new(addr.clone());
            p.confirm(now);
            self.paths.push(p);
        }
    }

    /// Record a failed send on an address.
    pub fn demote(&mut self, addr: &PathAddr) {
        if let Some(p) = self.paths.iter_mut().find(|p| p.addr == *addr) {
            p.demote();
        }
    }

    /// Record a confirmed break of an address.
    pub fn break_path(&mut self, addr: &PathAddr) {
        if let Some(p) = self.paths.iter_mut().find(|p| p.addr == *addr) {
            p.break_path();
        }
    }

    /// Best non-negative path; ties go to the most recently confirmed.
    pub fn active(&self) -> Option<&PathAddr> {
        self.paths
            .iter()
            .filter(|p| p.priority() >= 0)
            .max_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then(a.last_rx.cmp(&b.last_rx))
            })
            .map(|p| &p.addr)
    }

    /// All addresses, usable or not.
    pub fn all(&self) -> Vec<PathAddr> {
        self.paths.iter().map(|p| p.addr.clone()).collect()
    }

    /// Addresses that need NAT keepalives.
    pub fn wan(&self) -> Vec<PathAddr> {
        self.paths
            .iter()
            .filter(|p| p.category == PathCategory::Wan && p.priority() >= 0)
            .map(|p| p.addr.clone())
            .collect()
    }

    /// Priority of a specific address, if present.
    pub fn priority_of(&self, addr: &PathAddr) -> Option<i32> {
        self.paths
            .iter()
            .find(|p| p.addr == *addr)
            .map(|p| p.priority())
    }

    /// Drop every path and start over with the given addresses.
    pub fn replace(&mut self, addrs: Vec<PathAddr>) {
        self.paths = addrs.into_iter().map(Path::new).collect();
    }

    /// True when no path is known at all.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp4(ip: &str, port: u16) -> PathAddr {
        PathAddr::Udp4 {
            ip: ip.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn test_category_scores() {
        assert_eq!(PathCategory::of(&udp4("127.0.0.1", 1)).base_priority(), 8);
        assert_eq!(PathCategory::of(&udp4("192.168.1.9", 1)).base_priority(), 6);
        assert_eq!(PathCategory::of(&udp4("8.8.8.8", 1)).base_priority(), 4);
        assert_eq!(
            PathCategory::of(&PathAddr::Relay {
                token: "00".into()
            })
            .base_priority(),
            1
        );
    }

    #[test]
    fn test_active_prefers_best_category() {
        let mut set = PathSet::new();
        set.add(udp4("8.8.8.8", 42));
        set.add(udp4("192.168.1.9", 42));
        assert_eq!(set.active(), Some(&udp4("192.168.1.9", 42)));
    }

    #[test]
    fn test_break_goes_negative_and_fails_over() {
        let mut set = PathSet::new();
        let lan = udp4("192.168.1.9", 42);
        let wan = udp4("8.8.8.8", 42);
        set.add(lan.clone());
        set.add(wan.clone());

        set.break_path(&lan);
        assert_eq!(set.priority_of(&lan), Some(-3));
        assert_eq!(set.priority_of(&wan), Some(4));
        assert_eq!(set.active(), Some(&wan));
    }

    #[test]
    fn test_break_penalty_capped() {
        let mut set = PathSet::new();
        let lan = udp4("192.168.1.9", 42);
        set.add(lan.clone());

        set.break_path(&lan);
        set.break_path(&lan);
        set.break_path(&lan);
        assert_eq!(set.priority_of(&lan), Some(-3));
    }

    #[test]
    fn test_confirm_resets_delta() {
        let mut set = PathSet::new();
        let lan = udp4("192.168.1.9", 42);
        set.add(lan.clone());

        set.demote(&lan);
        set.demote(&lan);
        assert_eq!(set.priority_of(&lan), Some(4));

        set.confirm(&lan, Instant::now());
        assert_eq!(set.priority_of(&lan), Some(6));
    }

    #[test]
    fn test_tie_break_most_recent() {
        let mut set = PathSet::new();
        let a = udp4("127.0.0.1", 1);
        let b = udp4("127.0.0.1", 2);
        let t0 = Instant::now();
        set.confirm(&a, t0);
        set.confirm(&b, t0 + std::time::Duration::from_secs(1));
        assert_eq!(set.active(), Some(&b));
    }
}
