//! Peer address manager
//!
//! Addresses live in storage with a score and the last handshake time.
//! The manager hands out the least-scored, fastest address that no live
//! connection is using. When storage runs dry, the network's DNS seeds are
//! resolved in the background and the results come back to the peer group
//! as `PeerEvent::SeedAddresses`.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::lookup_host;
use tokio::sync::mpsc;

use crate::network::message::{NetAddr, ServiceFlags};
use crate::network::peer::PeerEvent;
use crate::storage::{PeerAddress, Storage};

pub struct PeerAddressManager {
    storage: Arc<dyn Storage>,
    dns_seeds: Vec<String>,
    port: u16,
    /// Hosts handed out and not yet released
    used: HashSet<String>,
    lookup_running: Arc<AtomicBool>,
    events: Option<mpsc::Sender<PeerEvent>>,
}

impl PeerAddressManager {
    pub fn new(storage: Arc<dyn Storage>, dns_seeds: Vec<String>, port: u16) -> Self {
        Self {
            storage,
            dns_seeds,
            port,
            used: HashSet::new(),
            lookup_running: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    /// Where resolved seed addresses are delivered
    pub fn set_event_sender(&mut self, events: mpsc::Sender<PeerEvent>) {
        self.events = Some(events);
    }

    fn used_hosts(&self) -> Vec<String> {
        self.used.iter().cloned().collect()
    }

    /// The best unused address is one we never connected to
    pub fn has_fresh_ips(&self) -> bool {
        self.storage
            .least_score_fastest_peer_address(&self.used_hosts())
            .map(|address| address.connection_time.is_none())
            .unwrap_or(false)
    }

    /// Next address to dial; `None` starts a DNS seed lookup
    pub fn get_ip(&mut self) -> Option<String> {
        match self.storage.least_score_fastest_peer_address(&self.used_hosts()) {
            Some(address) => {
                self.used.insert(address.ip.clone());
                Some(address.ip)
            }
            None => {
                self.lookup_seeds();
                None
            }
        }
    }

    pub fn add_ips(&self, ips: Vec<String>) {
        if ips.is_empty() {
            return;
        }
        log::info!("Added new addresses: {}", ips.len());
        self.storage
            .set_peer_addresses(ips.into_iter().map(|ip| PeerAddress::new(ip, 0)).collect());
    }

    /// Addresses relayed by a peer: only bloom-serving IPv4 nodes are kept
    pub fn add_relayed(&self, addrs: &[NetAddr]) {
        let ips = addrs
            .iter()
            .filter(|a| a.services.contains(ServiceFlags::BLOOM))
            .filter(|a| matches!(a.ip, IpAddr::V4(_)))
            .map(|a| a.ip.to_string())
            .collect();
        self.add_ips(ips);
    }

    /// Release an address that may be dialed again later
    pub fn mark_success(&mut self, ip: &str) {
        self.used.remove(ip);
    }

    /// Forget an address that misbehaved or could not be reached
    pub fn mark_failed(&mut self, ip: &str) {
        self.used.remove(ip);
        self.storage.delete_peer_address(ip);
    }

    pub fn mark_connected(&self, ip: &str, connection_time_ms: i64) {
        self.storage.mark_connected(ip, connection_time_ms);
    }

    fn lookup_seeds(&self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        if self.dns_seeds.is_empty() || self.lookup_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let seeds = self.dns_seeds.clone();
        let port = self.port;
        let running = self.lookup_running.clone();

        tokio::spawn(async move {
            for seed in seeds {
                log::info!("Resolving DNS seed: {}", seed);
                match lookup_host((seed.as_str(), port)).await {
                    Ok(addrs) => {
                        let ips: Vec<String> = addrs
                            .filter(|a| a.is_ipv4())
                            .map(|a| a.ip().to_string())
                            .collect();
                        log::debug!("Seed {} resolved to {} addresses", seed, ips.len());
                        if !ips.is_empty() && events.send(PeerEvent::SeedAddresses(ips)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Failed to resolve DNS seed {}: {}", seed, e),
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }
}
