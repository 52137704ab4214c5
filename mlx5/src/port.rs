//! Physical ports and their root classification tables.
//!
//! Every frame a port receives is matched against the port's root table
//! first, in slot priority order: the broadcast entry, then the
//! unicast/multicast entries keyed by destination MAC, then (when enabled)
//! the promiscuous catch-all. A matched MAC entry fans out to the VLAN
//! table of every ring group currently subscribed to that address; the
//! fan-out list is refcounted by group membership, and the hardware entry
//! is only deleted when the last subscriber leaves.
//!
//! The sorted MAC index gives O(log n) lookup when several groups share an
//! address. Mutations are transactional: a refused hardware command leaves
//! the index and the entry's state exactly as they were.

use std::collections::BTreeMap;
use std::sync::Mutex;

use mlx_cmd::{Command, CommandGateway, CommandOutput, FlowDest, FlowSpec};

use crate::error::{Error, Result};
use crate::flow_table::{FlowTable, GroupHandle};

const BROADCAST_MAC: [u8; 6] = [0xff; 6];

#[derive(Debug)]
struct MacEntry {
    slot: u32,
    /// Subscribed ring groups and their VLAN tables, in subscription order.
    groups: Vec<(usize, u32)>,
}

#[derive(Debug)]
struct PortState {
    root: FlowTable,
    bcast_group: GroupHandle,
    umcast_group: GroupHandle,
    promisc_group: GroupHandle,
    bcast_slot: u32,
    promisc_slot: Option<u32>,
    /// Registered ring groups: index to VLAN table id.
    groups: BTreeMap<usize, u32>,
    /// Where promiscuous traffic goes: the first registered group's hash
    /// table, skipping VLAN filtering entirely.
    promisc_dest: Option<u32>,
    macs: BTreeMap<[u8; 6], MacEntry>,
}

/// One physical port.
pub struct Port {
    num: u8,
    mac: [u8; 6],
    mtu: u32,
    state: Mutex<PortState>,
}

impl Port {
    /// Queries the port's vport state and builds its root table: one
    /// broadcast slot, `nents - 2` unicast/multicast slots, one promiscuous
    /// slot at the lowest priority.
    pub fn setup(gw: &CommandGateway, num: u8, nents: u32) -> Result<Port> {
        if nents < 3 {
            return Err(Error::CapsTooSmall("root flow table needs at least 3 slots"));
        }
        let vport = match gw.execute(&Command::QueryNicVportContext { vport: num })? {
            CommandOutput::Vport(v) => v,
            _ => return Err(Error::BadQueueState("vport query output")),
        };

        let mut root = FlowTable::create(gw, 0, nents)?;
        let (bcast_group, umcast_group, promisc_group, bcast_slot) =
            match Port::populate_root(gw, &mut root, nents) {
                Ok(layout) => layout,
                Err(e) => {
                    root.teardown(gw);
                    return Err(e);
                }
            };

        info!(
            "port {num}: MAC {}, MTU {}, root table {} ({nents} slots)",
            fmt_mac(&vport.mac_address),
            vport.mtu,
            root.id()
        );
        Ok(Port {
            num,
            mac: vport.mac_address,
            mtu: vport.mtu,
            state: Mutex::new(PortState {
                root,
                bcast_group,
                umcast_group,
                promisc_group,
                bcast_slot,
                promisc_slot: None,
                groups: BTreeMap::new(),
                promisc_dest: None,
                macs: BTreeMap::new(),
            }),
        })
    }

    fn populate_root(
        gw: &CommandGateway,
        root: &mut FlowTable,
        nents: u32,
    ) -> Result<(GroupHandle, GroupHandle, GroupHandle, u32)> {
        root.set_root(gw)?;
        let mac_mask = FlowSpec { dmac: Some([0xff; 6]), ..FlowSpec::default() };
        let bcast_group = root.add_group(gw, 1, mac_mask.clone())?;
        let umcast_group = root.add_group(gw, nents - 2, mac_mask)?;
        let promisc_group = root.add_group(gw, 1, FlowSpec::default())?;

        // Installed with an empty fan-out; groups attach as they register.
        let bcast_slot = root.add_entry(
            gw,
            bcast_group,
            FlowSpec { dmac: Some(BROADCAST_MAC), ..FlowSpec::default() },
        )?;
        Ok((bcast_group, umcast_group, promisc_group, bcast_slot))
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    /// The port's factory MAC address.
    pub fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Attaches a ring group to the port: broadcast traffic fans out to it
    /// from now on, and its tables become a valid MAC filter target.
    pub fn register_group(
        &self,
        gw: &CommandGateway,
        index: usize,
        vlan_table: u32,
        hash_table: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("port state poisoned");
        if state.groups.contains_key(&index) {
            return Ok(());
        }
        state.groups.insert(index, vlan_table);

        let dests: Vec<FlowDest> =
            state.groups.values().map(|&t| FlowDest::FlowTable(t)).collect();
        let (group, slot) = (state.bcast_group, state.bcast_slot);
        if let Err(e) = state.update_bcast_fanout(gw, group, slot, dests) {
            state.groups.remove(&index);
            return Err(e);
        }
        if state.promisc_dest.is_none() {
            state.promisc_dest = Some(hash_table);
        }
        Ok(())
    }

    /// Subscribes a ring group to a unicast/multicast address. Subscribing
    /// a group to an address it already receives is a no-op.
    pub fn add_mac(&self, gw: &CommandGateway, group_index: usize, mac: [u8; 6]) -> Result<()> {
        let mut state = self.state.lock().expect("port state poisoned");
        let vlan_table = *state
            .groups
            .get(&group_index)
            .ok_or(Error::BadQueueState("MAC filter for unregistered group"))?;

        if let Some(entry) = state.macs.get(&mac) {
            if entry.groups.iter().any(|&(g, _)| g == group_index) {
                return Ok(());
            }
            let slot = entry.slot;
            let group = state.umcast_group;
            let mut dests: Vec<FlowDest> =
                entry.groups.iter().map(|&(_, t)| FlowDest::FlowTable(t)).collect();
            dests.push(FlowDest::FlowTable(vlan_table));
            state.update_mac_fanout(gw, group, slot, mac, dests)?;
            state
                .macs
                .get_mut(&mac)
                .unwrap_or_else(|| panic!("MAC index entry vanished under the port lock"))
                .groups
                .push((group_index, vlan_table));
            return Ok(());
        }

        let group = state.umcast_group;
        let slot = state.root.add_entry(
            gw,
            group,
            FlowSpec {
                dmac: Some(mac),
                dests: vec![FlowDest::FlowTable(vlan_table)],
                ..FlowSpec::default()
            },
        )?;
        state.macs.insert(mac, MacEntry { slot, groups: vec![(group_index, vlan_table)] });
        Ok(())
    }

    /// Unsubscribes a ring group from an address. The hardware entry goes
    /// away only when its fan-out empties.
    pub fn remove_mac(
        &self,
        gw: &CommandGateway,
        group_index: usize,
        mac: [u8; 6],
    ) -> Result<()> {
        let mut state = self.state.lock().expect("port state poisoned");
        let entry = state.macs.get(&mac).ok_or(Error::NotFound)?;
        if !entry.groups.iter().any(|&(g, _)| g == group_index) {
            return Err(Error::NotFound);
        }
        let slot = entry.slot;

        if entry.groups.len() > 1 {
            let group = state.umcast_group;
            let dests: Vec<FlowDest> = entry
                .groups
                .iter()
                .filter(|&&(g, _)| g != group_index)
                .map(|&(_, t)| FlowDest::FlowTable(t))
                .collect();
            state.update_mac_fanout(gw, group, slot, mac, dests)?;
            let entry = state
                .macs
                .get_mut(&mac)
                .unwrap_or_else(|| panic!("MAC index entry vanished under the port lock"));
            entry.groups.retain(|&(g, _)| g != group_index);
        } else {
            state.root.remove_entry(gw, slot)?;
            state.macs.remove(&mac);
        }
        Ok(())
    }

    /// Installs or removes the catch-all entry. Idempotent in both
    /// directions.
    pub fn set_promiscuous(&self, gw: &CommandGateway, on: bool) -> Result<()> {
        let mut state = self.state.lock().expect("port state poisoned");
        if on == state.promisc_slot.is_some() {
            return Ok(());
        }
        if on {
            let dest = state
                .promisc_dest
                .ok_or(Error::BadQueueState("promiscuous mode with no ring groups"))?;
            let group = state.promisc_group;
            let slot = state.root.add_entry(
                gw,
                group,
                FlowSpec { dests: vec![FlowDest::FlowTable(dest)], ..FlowSpec::default() },
            )?;
            state.promisc_slot = Some(slot);
            gw.done(&Command::ModifyNicVportContext { vport: self.num, promisc: true })
                .map_err(|e| {
                    // Entry install succeeded; take it back out.
                    let slot = state.promisc_slot.take();
                    if let Some(slot) = slot {
                        state.root.remove_entry(gw, slot).unwrap_or_else(|e2| {
                            panic!("promiscuous entry rollback failed: {e2} (after {e})")
                        });
                    }
                    e
                })?;
        } else {
            let slot =
                state.promisc_slot.ok_or(Error::BadQueueState("promiscuous already off"))?;
            state.root.remove_entry(gw, slot)?;
            state.promisc_slot = None;
            if let Err(e) =
                gw.done(&Command::ModifyNicVportContext { vport: self.num, promisc: false })
            {
                warn!("port {}: vport left promiscuous: {e}", self.num);
            }
        }
        Ok(())
    }

    pub fn promiscuous(&self) -> bool {
        self.state.lock().expect("port state poisoned").promisc_slot.is_some()
    }

    /// Whether any group currently subscribes to this address.
    pub fn mac_subscribed(&self, mac: [u8; 6]) -> bool {
        self.state.lock().expect("port state poisoned").macs.contains_key(&mac)
    }

    /// How many groups share this address's entry.
    pub fn mac_fan_out(&self, mac: [u8; 6]) -> usize {
        self.state
            .lock()
            .expect("port state poisoned")
            .macs
            .get(&mac)
            .map_or(0, |e| e.groups.len())
    }

    /// Free unicast/multicast slots left in the root table.
    pub fn umcast_free_slots(&self) -> u32 {
        let state = self.state.lock().expect("port state poisoned");
        state.root.group_free_slots(state.umcast_group)
    }

    /// Destroys the root table and everything in it.
    pub fn teardown(self, gw: &CommandGateway) {
        let state = self.state.into_inner().expect("port state poisoned");
        state.root.teardown(gw);
    }
}

impl PortState {
    /// Rewrites the broadcast entry's fan-out.
    fn update_bcast_fanout(
        &mut self,
        gw: &CommandGateway,
        group: GroupHandle,
        slot: u32,
        dests: Vec<FlowDest>,
    ) -> Result<()> {
        self.root.update_entry(
            gw,
            group,
            slot,
            FlowSpec { dmac: Some(BROADCAST_MAC), dests, ..FlowSpec::default() },
        )
    }

    /// Rewrites a unicast/multicast entry's fan-out.
    fn update_mac_fanout(
        &mut self,
        gw: &CommandGateway,
        group: GroupHandle,
        slot: u32,
        mac: [u8; 6],
        dests: Vec<FlowDest>,
    ) -> Result<()> {
        self.root.update_entry(
            gw,
            group,
            slot,
            FlowSpec { dmac: Some(mac), dests, ..FlowSpec::default() },
        )
    }
}

fn fmt_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
