//! Ring groups: the glue between a set of rings and the classification
//! sub-tree that feeds them.
//!
//! An RX group owns a two-layer sub-tree. Traffic the port's root table
//! steers at the group first passes its VLAN table, then lands in its hash
//! table, where per-protocol entries pick the TIR that hashes the flow onto
//! one of the group's receive rings. The hash layer exists because a TIR can
//! only hash on one protocol header combination; one TIR per combination,
//! selected by an exact-match entry, gets every flow a stable ring.
//!
//! The VLAN table's default entry admits any frame while the group has no
//! specific filters, and admission must never lapse or double up across a
//! filter change. So ordering is fixed: a first specific filter is installed
//! before the default entry is removed, and the default is reinstated before
//! the last specific filter comes out. A failure mid-sequence rolls the
//! sequence back rather than leaving the window half-changed.

use std::sync::{Arc, Mutex};

use mlx_cmd::{Command, CommandGateway, FlowDest, FlowSpec, VlanMatch};

use crate::error::{Error, Result};
use crate::flow_table::{FlowTable, GroupHandle};
use crate::work_queue::Ring;

/// TIR hash selector values: which header fields feed the hash.
pub const HASH_NONE: u8 = 0x0;
pub const HASH_L3: u8 = 0x3;
pub const HASH_L3_L4: u8 = 0xf;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Protocol roles, one TIR each.
const TIR_ROLES: [(Option<u16>, Option<u8>, u8); 7] = [
    (Some(ETHERTYPE_IPV4), Some(IPPROTO_TCP), HASH_L3_L4),
    (Some(ETHERTYPE_IPV4), Some(IPPROTO_UDP), HASH_L3_L4),
    (Some(ETHERTYPE_IPV6), Some(IPPROTO_TCP), HASH_L3_L4),
    (Some(ETHERTYPE_IPV6), Some(IPPROTO_UDP), HASH_L3_L4),
    (Some(ETHERTYPE_IPV4), None, HASH_L3),
    (Some(ETHERTYPE_IPV6), None, HASH_L3),
    // Non-IP traffic cannot be hashed; steered whole to the first ring.
    (None, None, HASH_NONE),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VlanFilter {
    tagged: bool,
    vid: u16,
}

struct VlanState {
    table: FlowTable,
    specific_group: GroupHandle,
    default_group: GroupHandle,
    /// Slot of the accept-any entry; present exactly while the filter set
    /// is empty.
    default_slot: Option<u32>,
    filters: std::collections::BTreeMap<VlanFilter, u32>,
}

/// The layers of an RX group's sub-tree, in creation order. Destroyed in
/// reverse, from whatever point creation (or the group's life) reached.
#[derive(Default)]
struct GroupLayers {
    rqtn: Option<u32>,
    tirs: Vec<u32>,
    hash: Option<FlowTable>,
    vlan_table: Option<FlowTable>,
    /// Specific group, default group, default entry slot. Set last, once
    /// the VLAN table is fully populated.
    vlan: Option<(GroupHandle, GroupHandle, u32)>,
}

impl GroupLayers {
    fn destroy(self, gw: &CommandGateway) {
        if let Some(table) = self.vlan_table {
            table.teardown(gw);
        }
        if let Some(hash) = self.hash {
            hash.teardown(gw);
        }
        for tirn in self.tirs.iter().rev() {
            gw.done(&Command::DestroyTir { tirn: *tirn })
                .unwrap_or_else(|e| panic!("TIR {tirn} refused destruction: {e}"));
        }
        if let Some(rqtn) = self.rqtn {
            gw.done(&Command::DestroyRqt { rqtn })
                .unwrap_or_else(|e| panic!("RQT {rqtn} refused destruction: {e}"));
        }
    }
}

/// A receive ring group: rings, hashing targets, and the VLAN/hash tables
/// that classify into them.
pub struct RxGroup {
    index: usize,
    rqtn: u32,
    tirs: Vec<u32>,
    hash: FlowTable,
    vlan: Mutex<VlanState>,
    rings: Vec<Arc<Mutex<Ring>>>,
}

impl RxGroup {
    /// Builds the whole sub-tree bottom-up: RQT over the group's receive
    /// queues, TIRs, hash table, then the VLAN table pointing into it. A
    /// refused command destroys the layers already built before returning.
    pub fn setup(
        gw: &CommandGateway,
        index: usize,
        td: u32,
        rqns: &[u32],
        vlan_nents: u32,
        rings: Vec<Arc<Mutex<Ring>>>,
    ) -> Result<RxGroup> {
        assert!(!rqns.is_empty(), "RX group {index} created with no receive queues");
        let mut layers = GroupLayers::default();
        if let Err(e) = RxGroup::build_layers(gw, td, rqns, vlan_nents, &mut layers) {
            warn!("RX group {index} setup failed, unwinding: {e}");
            layers.destroy(gw);
            return Err(e);
        }

        let rqtn = layers.rqtn.take().unwrap_or_else(|| panic!("RQT layer missing"));
        let hash = layers.hash.take().unwrap_or_else(|| panic!("hash layer missing"));
        let table = layers.vlan_table.take().unwrap_or_else(|| panic!("VLAN layer missing"));
        let (specific_group, default_group, default_slot) =
            layers.vlan.take().unwrap_or_else(|| panic!("VLAN layer missing"));
        let vlan = VlanState {
            table,
            specific_group,
            default_group,
            default_slot: Some(default_slot),
            filters: std::collections::BTreeMap::new(),
        };
        info!("RX group {index}: RQT {rqtn}, {} rings", rings.len());
        Ok(RxGroup { index, rqtn, tirs: layers.tirs, hash, vlan: Mutex::new(vlan), rings })
    }

    fn build_layers(
        gw: &CommandGateway,
        td: u32,
        rqns: &[u32],
        vlan_nents: u32,
        layers: &mut GroupLayers,
    ) -> Result<()> {
        let rqtn = gw.number(&Command::CreateRqt { rqns: rqns.to_vec() })?;
        layers.rqtn = Some(rqtn);

        for &(_, _, selector) in &TIR_ROLES {
            let tirn = if selector == HASH_NONE {
                gw.number(&Command::CreateTir {
                    td,
                    rqt: None,
                    rqn: Some(rqns[0]),
                    hash_selector: selector,
                })?
            } else {
                gw.number(&Command::CreateTir {
                    td,
                    rqt: Some(rqtn),
                    rqn: None,
                    hash_selector: selector,
                })?
            };
            layers.tirs.push(tirn);
        }

        layers.hash = Some(FlowTable::create(gw, 2, 8)?);
        let hash = layers.hash.as_mut().unwrap_or_else(|| panic!("hash layer missing"));
        let l4_group = hash.add_group(
            gw,
            4,
            FlowSpec { ethertype: Some(0xffff), ip_proto: Some(0xff), ..FlowSpec::default() },
        )?;
        let l3_group =
            hash.add_group(gw, 2, FlowSpec { ethertype: Some(0xffff), ..FlowSpec::default() })?;
        let fallback_group = hash.add_group(gw, 1, FlowSpec::default())?;
        for (role, &(ethertype, ip_proto, _)) in TIR_ROLES.iter().enumerate() {
            let group = match (ethertype, ip_proto) {
                (Some(_), Some(_)) => l4_group,
                (Some(_), None) => l3_group,
                _ => fallback_group,
            };
            hash.add_entry(
                gw,
                group,
                FlowSpec {
                    ethertype,
                    ip_proto,
                    dests: vec![FlowDest::Tir(layers.tirs[role])],
                    ..FlowSpec::default()
                },
            )?;
        }
        let hash_id = hash.id();

        layers.vlan_table = Some(FlowTable::create(gw, 1, vlan_nents)?);
        let table = layers.vlan_table.as_mut().unwrap_or_else(|| panic!("VLAN layer missing"));
        let specific_group = table.add_group(
            gw,
            vlan_nents - 1,
            FlowSpec {
                vlan: Some(VlanMatch { tagged: true, vid: 0xfff }),
                ..FlowSpec::default()
            },
        )?;
        let default_group = table.add_group(gw, 1, FlowSpec::default())?;
        let default_slot = table.add_entry(
            gw,
            default_group,
            FlowSpec { dests: vec![FlowDest::FlowTable(hash_id)], ..FlowSpec::default() },
        )?;
        layers.vlan = Some((specific_group, default_group, default_slot));
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The table the port's root entries should steer this group's traffic
    /// to.
    pub fn vlan_table_id(&self) -> u32 {
        self.vlan.lock().expect("vlan state poisoned").table.id()
    }

    pub fn hash_table_id(&self) -> u32 {
        self.hash.id()
    }

    pub fn rings(&self) -> &[Arc<Mutex<Ring>>] {
        &self.rings
    }

    /// Admits only the given VLAN (or untagged traffic, with
    /// `tagged == false`). Adding a filter that is already present is a
    /// no-op.
    pub fn add_vlan(&self, gw: &CommandGateway, tagged: bool, vid: u16) -> Result<()> {
        let mut state = self.vlan.lock().expect("vlan state poisoned");
        let key = VlanFilter { tagged, vid };
        if state.filters.contains_key(&key) {
            return Ok(());
        }

        let hash_id = self.hash.id();
        let group = state.specific_group;
        let slot = state.table.add_entry(
            gw,
            group,
            FlowSpec {
                vlan: Some(VlanMatch { tagged, vid }),
                dests: vec![FlowDest::FlowTable(hash_id)],
                ..FlowSpec::default()
            },
        )?;

        // The first specific filter displaces the accept-any entry; the
        // specific one is already live, so no admission gap opens here.
        if let Some(default_slot) = state.default_slot {
            if let Err(e) = state.table.remove_entry(gw, default_slot) {
                state.table.remove_entry(gw, slot).unwrap_or_else(|e2| {
                    panic!(
                        "VLAN filter rollback failed on group {}: {e2} (after {e})",
                        self.index
                    )
                });
                return Err(e);
            }
            state.default_slot = None;
        }

        state.filters.insert(key, slot);
        Ok(())
    }

    /// Removes a VLAN filter. Removing the last one first reinstates the
    /// accept-any entry; if that reinstatement fails the filter is kept, so
    /// admission never lapses.
    pub fn remove_vlan(&self, gw: &CommandGateway, tagged: bool, vid: u16) -> Result<()> {
        let mut state = self.vlan.lock().expect("vlan state poisoned");
        let key = VlanFilter { tagged, vid };
        let slot = *state.filters.get(&key).ok_or(Error::NotFound)?;

        let mut reinstated = None;
        if state.filters.len() == 1 {
            let hash_id = self.hash.id();
            let group = state.default_group;
            let default_slot = state.table.add_entry(
                gw,
                group,
                FlowSpec { dests: vec![FlowDest::FlowTable(hash_id)], ..FlowSpec::default() },
            )?;
            reinstated = Some(default_slot);
        }

        if let Err(e) = state.table.remove_entry(gw, slot) {
            if let Some(default_slot) = reinstated {
                state.table.remove_entry(gw, default_slot).unwrap_or_else(|e2| {
                    panic!(
                        "default VLAN entry rollback failed on group {}: {e2} (after {e})",
                        self.index
                    )
                });
            }
            return Err(e);
        }

        state.filters.remove(&key);
        if let Some(default_slot) = reinstated {
            state.default_slot = Some(default_slot);
        }
        Ok(())
    }

    /// Whether the accept-any entry is currently installed.
    pub fn default_vlan_installed(&self) -> bool {
        self.vlan.lock().expect("vlan state poisoned").default_slot.is_some()
    }

    pub fn vlan_filter_count(&self) -> usize {
        self.vlan.lock().expect("vlan state poisoned").filters.len()
    }

    /// Starts every ring: descriptors go ready and the receive rings are
    /// filled from their shards.
    pub fn start(&self, gw: &CommandGateway) -> Result<()> {
        for ring in &self.rings {
            let mut ring = ring.lock().expect("ring poisoned");
            ring.wq.start(gw)?;
            ring.wq.refill()?;
        }
        Ok(())
    }

    /// Stops every ring and returns its posted buffers to their shards.
    pub fn stop(&self, gw: &CommandGateway) -> Result<()> {
        for ring in &self.rings {
            let mut ring = ring.lock().expect("ring poisoned");
            ring.wq.stop(gw)?;
            ring.wq.flush()?;
        }
        Ok(())
    }

    /// Unwinds the sub-tree in reverse of [`RxGroup::setup`].
    pub fn teardown(self, gw: &CommandGateway) {
        let state = self.vlan.into_inner().expect("vlan state poisoned");
        state.table.teardown(gw);
        self.hash.teardown(gw);
        for tirn in self.tirs.iter().rev() {
            gw.done(&Command::DestroyTir { tirn: *tirn })
                .unwrap_or_else(|e| panic!("TIR {tirn} refused destruction: {e}"));
        }
        gw.done(&Command::DestroyRqt { rqtn: self.rqtn })
            .unwrap_or_else(|e| panic!("RQT {} refused destruction: {e}", self.rqtn));
    }
}

/// A send ring group: the send rings sharing one transport interface
/// object. The TIS itself is created and destroyed by the driver's staged
/// bring-up, since the send queues referencing it outlive the group
/// abstraction during teardown.
pub struct TxGroup {
    index: usize,
    tisn: u32,
    rings: Vec<Arc<Mutex<Ring>>>,
}

impl TxGroup {
    pub fn new(index: usize, tisn: u32, rings: Vec<Arc<Mutex<Ring>>>) -> TxGroup {
        info!("TX group {index}: TIS {tisn}, {} rings", rings.len());
        TxGroup { index, tisn, rings }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn tisn(&self) -> u32 {
        self.tisn
    }

    pub fn rings(&self) -> &[Arc<Mutex<Ring>>] {
        &self.rings
    }

    /// Posts a packet on one of the group's rings.
    pub fn post(
        &self,
        ring: usize,
        segments: &[&[u8]],
        on_release: Option<nic_buffers::PacketCallback>,
    ) -> Result<u32> {
        let ring = self.rings.get(ring).ok_or(Error::NotFound)?;
        let mut ring = ring.lock().expect("ring poisoned");
        ring.wq.post(segments, on_release)
    }

    pub fn start(&self, gw: &CommandGateway) -> Result<()> {
        for ring in &self.rings {
            ring.lock().expect("ring poisoned").wq.start(gw)?;
        }
        Ok(())
    }

    pub fn stop(&self, gw: &CommandGateway) -> Result<()> {
        for ring in &self.rings {
            let mut ring = ring.lock().expect("ring poisoned");
            ring.wq.stop(gw)?;
            ring.wq.flush()?;
        }
        Ok(())
    }
}
