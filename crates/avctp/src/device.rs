//! Peer device blocks and their registry

use bitflags::bitflags;
use log::debug;

use crate::arena::SlotTable;
use crate::channel::ChannelBlock;
use crate::constants::MAX_DEVICES;
use crate::error::{AvctError, AvctResult};
use crate::types::{BdAddr, ChannelId, ChannelKind};

/// Handle of a device block
pub type DeviceId = usize;

bitflags! {
    /// Channels that have been allocated on a device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkMask: u8 {
        const CONTROL = 0x01;
        const BROWSING = 0x02;
    }
}

impl From<ChannelKind> for LinkMask {
    fn from(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Control => LinkMask::CONTROL,
            ChannelKind::Browsing => LinkMask::BROWSING,
        }
    }
}

/// State kept per peer device
#[derive(Debug)]
pub struct DeviceBlock {
    peer: BdAddr,
    control: Option<ChannelBlock>,
    browsing: Option<ChannelBlock>,
    /// Connections bound to the control channel
    bound_count: usize,
    links: LinkMask,
}

impl DeviceBlock {
    pub fn new(peer: BdAddr) -> Self {
        Self {
            peer,
            control: None,
            browsing: None,
            bound_count: 0,
            links: LinkMask::empty(),
        }
    }

    pub fn peer(&self) -> BdAddr {
        self.peer
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelBlock> {
        match kind {
            ChannelKind::Control => self.control.as_ref(),
            ChannelKind::Browsing => self.browsing.as_ref(),
        }
    }

    pub fn channel_mut(&mut self, kind: ChannelKind) -> Option<&mut ChannelBlock> {
        match kind {
            ChannelKind::Control => self.control.as_mut(),
            ChannelKind::Browsing => self.browsing.as_mut(),
        }
    }

    /// Install a channel block, replacing any previous one
    pub fn set_channel(&mut self, channel: ChannelBlock) {
        let kind = channel.kind();
        self.links.insert(kind.into());
        match kind {
            ChannelKind::Control => self.control = Some(channel),
            ChannelKind::Browsing => self.browsing = Some(channel),
        }
    }

    pub fn take_channel(&mut self, kind: ChannelKind) -> Option<ChannelBlock> {
        match kind {
            ChannelKind::Control => self.control.take(),
            ChannelKind::Browsing => self.browsing.take(),
        }
    }

    pub fn links(&self) -> LinkMask {
        self.links
    }

    pub fn bound_count(&self) -> usize {
        self.bound_count
    }

    pub fn increment_bound(&mut self) {
        self.bound_count += 1;
    }

    pub fn decrement_bound(&mut self) {
        self.bound_count = self.bound_count.saturating_sub(1);
    }

    pub fn clear_bound(&mut self) {
        self.bound_count = 0;
    }

    /// No channels and no bound connections remain
    pub fn is_unused(&self) -> bool {
        self.control.is_none() && self.browsing.is_none() && self.bound_count == 0
    }

    /// Kind of the channel using `lcid`, if any
    pub fn kind_of(&self, lcid: ChannelId) -> Option<ChannelKind> {
        [ChannelKind::Control, ChannelKind::Browsing]
            .into_iter()
            .find(|kind| {
                self.channel(*kind)
                    .is_some_and(|channel| channel.has_lcid() && channel.lcid() == lcid)
            })
    }
}

/// Registry of device blocks
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: SlotTable<DeviceBlock>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_DEVICES)
    }
}

impl DeviceRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: SlotTable::with_capacity(capacity),
        }
    }

    pub fn find_by_address(&self, peer: &BdAddr) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, device)| device.peer == *peer)
            .map(|(id, _)| id)
    }

    pub fn allocate(&mut self, peer: BdAddr) -> AvctResult<DeviceId> {
        let id = self
            .devices
            .insert(DeviceBlock::new(peer))
            .map_err(|_| AvctError::NoResources("device block"))?;
        debug!("Allocated device block {} for {}", id, peer);
        Ok(id)
    }

    /// Look up the device for `peer`, allocating one if needed
    pub fn find_or_allocate(&mut self, peer: BdAddr) -> AvctResult<DeviceId> {
        match self.find_by_address(&peer) {
            Some(id) => Ok(id),
            None => self.allocate(peer),
        }
    }

    /// Free a device block along with both of its channels
    pub fn deallocate(&mut self, id: DeviceId) -> Option<DeviceBlock> {
        let mut device = self.devices.remove(id)?;
        device.take_channel(ChannelKind::Browsing);
        device.take_channel(ChannelKind::Control);
        debug!("Released device block {} for {}", id, device.peer);
        Some(device)
    }

    /// Find the device and channel kind owning an L2CAP channel id
    pub fn find_by_channel_id(&self, lcid: ChannelId) -> Option<(DeviceId, ChannelKind)> {
        self.devices
            .iter()
            .find_map(|(id, device)| device.kind_of(lcid).map(|kind| (id, kind)))
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceBlock> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceBlock> {
        self.devices.get_mut(id)
    }

    pub fn channel(&self, id: DeviceId, kind: ChannelKind) -> Option<&ChannelBlock> {
        self.get(id)?.channel(kind)
    }

    pub fn channel_mut(&mut self, id: DeviceId, kind: ChannelKind) -> Option<&mut ChannelBlock> {
        self.get_mut(id)?.channel_mut(kind)
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.indices()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn addr(last: u8) -> BdAddr {
        BdAddr::new([last, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    #[test]
    fn test_allocate_until_full() {
        let mut registry = DeviceRegistry::default();
        for i in 0..MAX_DEVICES {
            registry.allocate(addr(i as u8)).unwrap();
        }
        assert_eq!(
            registry.allocate(addr(0xF0)).unwrap_err(),
            AvctError::NoResources("device block")
        );
        assert_eq!(registry.find_by_address(&addr(3)), Some(3));
        assert_eq!(registry.find_or_allocate(addr(3)), Ok(3));
    }

    #[test]
    fn test_find_by_channel_id() {
        let mut registry = DeviceRegistry::default();
        let first = registry.allocate(addr(1)).unwrap();
        let second = registry.allocate(addr(2)).unwrap();

        let mut control = ChannelBlock::new(ChannelKind::Control, Role::Initiator);
        control.set_lcid(0x0040);
        registry.get_mut(first).unwrap().set_channel(control);

        let mut browsing = ChannelBlock::new(ChannelKind::Browsing, Role::Acceptor);
        browsing.set_lcid(0x0041);
        registry.get_mut(second).unwrap().set_channel(browsing);

        // Channels without an lcid never match
        registry
            .get_mut(second)
            .unwrap()
            .set_channel(ChannelBlock::new(ChannelKind::Control, Role::Initiator));

        assert_eq!(registry.find_by_channel_id(0x0040), Some((first, ChannelKind::Control)));
        assert_eq!(registry.find_by_channel_id(0x0041), Some((second, ChannelKind::Browsing)));
        assert_eq!(registry.find_by_channel_id(0), None);
        assert_eq!(registry.find_by_channel_id(0x0042), None);
        assert_eq!(
            registry.get(second).unwrap().links(),
            LinkMask::CONTROL | LinkMask::BROWSING
        );
    }

    #[test]
    fn test_deallocate_frees_slot() {
        let mut registry = DeviceRegistry::default();
        let id = registry.allocate(addr(1)).unwrap();
        registry
            .get_mut(id)
            .unwrap()
            .set_channel(ChannelBlock::new(ChannelKind::Control, Role::Initiator));

        let device = registry.deallocate(id).unwrap();
        assert!(device.is_unused());
        assert!(registry.find_by_address(&addr(1)).is_none());
        assert!(registry.is_empty());
    }
}
