use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use codec::channel_data::ChannelData;

/// Binding progress of a peer's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unbound,
    /// ChannelBind sent, data still goes out as Send indications.
    BindRequested,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct RemotePeer {
    address: SocketAddr,
    channel: u16,
    state: ChannelState,
    rebind_at: Option<Instant>,
}

impl RemotePeer {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == ChannelState::Confirmed
    }

    pub fn set_bind_requested(&mut self) {
        if self.state == ChannelState::Unbound {
            self.state = ChannelState::BindRequested;
        }
    }

    /// Mark the channel usable and schedule its next ChannelBind refresh.
    pub fn confirm(&mut self, now: Instant, refresh: Duration) {
        self.state = ChannelState::Confirmed;
        self.rebind_at = Some(now + refresh);
    }

    pub fn rebind_at(&self) -> Option<Instant> {
        self.rebind_at
    }

    /// Back to unbound after a failed ChannelBind, so the next use of the
    /// peer binds again.
    pub fn unbind(&mut self) {
        self.state = ChannelState::Unbound;
        self.rebind_at = None;
    }

    pub fn is_unbound(&self) -> bool {
        self.state == ChannelState::Unbound
    }
}

/// Channel numbers leased to peers.
///
/// Numbers are handed out from 0x4000 upward and wrap back to 0x4000 after
/// 0x7FFF, skipping numbers still in use.
///
/// # Test
///
/// ```
/// use sipturn_client::channel::ChannelManager;
///
/// let mut channels = ChannelManager::default();
/// let peer = channels.create_channel_binding("10.0.0.1:5000".parse().unwrap()).unwrap();
///
/// assert_eq!(peer.channel(), 0x4000);
/// assert!(channels.find_by_address(&"10.0.0.1:5000".parse().unwrap()).is_some());
/// ```
pub struct ChannelManager {
    next_channel: u16,
    peers: AHashMap<u16, RemotePeer>,
    channels: AHashMap<SocketAddr, u16>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self {
            next_channel: ChannelData::MIN_NUMBER,
            peers: AHashMap::with_capacity(16),
            channels: AHashMap::with_capacity(16),
        }
    }
}

impl ChannelManager {
    /// Lease the next free channel to `address`. `None` when every channel
    /// number is in use.
    pub fn create_channel_binding(&mut self, address: SocketAddr) -> Option<&mut RemotePeer> {
        let range = (ChannelData::MAX_NUMBER - ChannelData::MIN_NUMBER) as usize + 1;
        if self.peers.len() >= range {
            return None;
        }

        let mut channel = self.next_channel;
        while self.peers.contains_key(&channel) {
            channel = next(channel);
        }

        self.next_channel = next(channel);
        self.channels.insert(address, channel);

        Some(self.peers.entry(channel).or_insert(RemotePeer {
            state: ChannelState::Unbound,
            rebind_at: None,
            address,
            channel,
        }))
    }

    pub fn find_by_channel(&mut self, channel: u16) -> Option<&mut RemotePeer> {
        self.peers.get_mut(&channel)
    }

    pub fn find_by_address(&mut self, address: &SocketAddr) -> Option<&mut RemotePeer> {
        let channel = self.channels.get(address)?;
        self.peers.get_mut(channel)
    }

    /// Earliest pending ChannelBind refresh.
    pub fn next_rebind(&self) -> Option<Instant> {
        self.peers.values().filter_map(|it| it.rebind_at).min()
    }

    /// Peers whose refresh is due, their timers are disarmed.
    pub fn take_due_rebinds(&mut self, now: Instant) -> Vec<SocketAddr> {
        self.peers
            .values_mut()
            .filter(|it| it.rebind_at.is_some_and(|at| at <= now))
            .map(|it| {
                it.rebind_at = None;
                it.address
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.channels.clear();
        self.next_channel = ChannelData::MIN_NUMBER;
    }
}

fn next(channel: u16) -> u16 {
    if channel >= ChannelData::MAX_NUMBER {
        ChannelData::MIN_NUMBER
    } else {
        channel + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn channels_are_leased_in_order() {
        let mut channels = ChannelManager::default();

        for (i, port) in (5000..5004).enumerate() {
            let peer = channels.create_channel_binding(addr(port)).unwrap();
            assert_eq!(peer.channel(), 0x4000 + i as u16);
            assert_eq!(peer.state(), ChannelState::Unbound);
        }

        assert_eq!(channels.find_by_channel(0x4002).map(|it| it.address()), Some(addr(5002)));
        assert!(channels.find_by_channel(0x4004).is_none());
    }

    #[test]
    fn channel_numbers_wrap_and_skip_used() {
        let mut channels = ChannelManager::default();
        channels.next_channel = 0x7FFF;

        assert_eq!(channels.create_channel_binding(addr(1)).unwrap().channel(), 0x7FFF);
        assert_eq!(channels.create_channel_binding(addr(2)).unwrap().channel(), 0x4000);

        channels.next_channel = 0x7FFF;
        assert_eq!(channels.create_channel_binding(addr(3)).unwrap().channel(), 0x4001);
    }

    #[test]
    fn confirm_schedules_rebind() {
        let mut channels = ChannelManager::default();
        let now = Instant::now();

        let peer = channels.create_channel_binding(addr(1)).unwrap();
        peer.set_bind_requested();
        assert_eq!(peer.state(), ChannelState::BindRequested);

        peer.confirm(now, Duration::from_secs(240));
        assert!(peer.is_confirmed());
        assert_eq!(channels.next_rebind(), Some(now + Duration::from_secs(240)));

        assert!(channels.take_due_rebinds(now).is_empty());
        assert_eq!(channels.take_due_rebinds(now + Duration::from_secs(241)), vec![addr(1)]);
        assert_eq!(channels.next_rebind(), None);
    }

    #[test]
    fn failed_bind_keeps_the_channel_number() {
        let mut channels = ChannelManager::default();
        let now = Instant::now();

        let peer = channels.create_channel_binding(addr(1)).unwrap();
        peer.confirm(now, Duration::from_secs(240));
        peer.unbind();
        assert!(peer.is_unbound());
        assert_eq!(channels.next_rebind(), None);

        let peer = channels.find_by_address(&addr(1)).unwrap();
        assert_eq!(peer.channel(), 0x4000);
        peer.set_bind_requested();
        assert_eq!(peer.state(), ChannelState::BindRequested);
    }
}
