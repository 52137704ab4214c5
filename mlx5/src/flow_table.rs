//! Flow tables, flow groups, and flow entries.
//!
//! A flow table is an ordered array of match/action slots. Contiguous ranges
//! of slots are reserved as flow groups; every entry in a group shares the
//! group's match-field mask and differs only in the values matched. Slot
//! order is priority order: the first matching entry in the table wins.
//!
//! In-memory entry state is kept in lock step with hardware through a
//! reserved/dirty/created protocol:
//!
//!  - `reserved` is set before any hardware command touches the slot and
//!    cleared only once the slot is genuinely empty again, so first-fit
//!    allocation never hands out a slot with a command in flight;
//!  - `dirty` marks an entry whose in-memory spec has not yet been accepted
//!    by hardware; a failed command rolls the spec back and clears it, so a
//!    clean entry always describes what the hardware actually holds.
//!
//! Every mutating operation here is transactional: on command failure the
//! in-memory state is restored before the error is returned.

use mlx_cmd::{Command, CommandGateway, FlowSpec};

use crate::error::{Error, Result};

/// One slot in a flow table.
#[derive(Debug, Default)]
pub struct FlowEntry {
    spec: FlowSpec,
    /// Slot is claimed; set before hardware is told about the entry.
    reserved: bool,
    /// In-memory spec differs from what hardware holds.
    dirty: bool,
    /// Hardware has accepted the entry.
    created: bool,
}

impl FlowEntry {
    pub fn spec(&self) -> &FlowSpec {
        &self.spec
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

/// A contiguous slot range sharing one match mask.
#[derive(Debug)]
pub struct FlowGroup {
    id: u32,
    start: u32,
    end: u32,
    mask: FlowSpec,
}

impl FlowGroup {
    pub fn capacity(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn mask(&self) -> &FlowSpec {
        &self.mask
    }
}

/// Identifies a group within its owning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHandle(usize);

/// A hardware flow table plus its in-memory shadow.
///
/// The owner wraps the table in a `Mutex` and holds that lock across each
/// hardware command and the matching state update, so the shadow never
/// disagrees with hardware for longer than one serialized command.
#[derive(Debug)]
pub struct FlowTable {
    id: u32,
    level: u32,
    entries: Vec<FlowEntry>,
    groups: Vec<FlowGroup>,
    /// First slot not yet claimed by any group.
    next_range_start: u32,
}

impl FlowTable {
    /// Creates the hardware table and its empty shadow.
    pub fn create(gw: &CommandGateway, level: u32, nents: u32) -> Result<FlowTable> {
        let id = gw.number(&Command::CreateFlowTable { level, nents })?;
        let mut entries = Vec::with_capacity(nents as usize);
        entries.resize_with(nents as usize, FlowEntry::default);
        trace!("created flow table {id} (level {level}, {nents} entries)");
        Ok(FlowTable { id, level, entries, groups: Vec::new(), next_range_start: 0 })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn nents(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Makes this table the root of its port's RX classification.
    pub fn set_root(&self, gw: &CommandGateway) -> Result<()> {
        gw.done(&Command::SetFlowTableRoot { table: self.id })?;
        Ok(())
    }

    /// Claims the next `capacity` contiguous slots as a group matching on
    /// the fields set in `mask`.
    pub fn add_group(
        &mut self,
        gw: &CommandGateway,
        capacity: u32,
        mask: FlowSpec,
    ) -> Result<GroupHandle> {
        let start = self.next_range_start;
        let end = start
            .checked_add(capacity)
            .and_then(|e| e.checked_sub(1))
            .ok_or(Error::TableExhausted)?;
        if capacity == 0 || end >= self.nents() {
            return Err(Error::TableExhausted);
        }
        let id = gw.number(&Command::CreateFlowGroup {
            table: self.id,
            start,
            end,
            mask: mask.clone(),
        })?;
        self.next_range_start = end + 1;
        self.groups.push(FlowGroup { id, start, end, mask });
        Ok(GroupHandle(self.groups.len() - 1))
    }

    fn group(&self, handle: GroupHandle) -> &FlowGroup {
        &self.groups[handle.0]
    }

    /// Installs an entry in the first free slot of the group.
    ///
    /// Returns the slot index; [`Error::TableExhausted`] if the group is
    /// full. On command failure the slot is released again and the error
    /// surfaced, leaving the table exactly as it was.
    pub fn add_entry(
        &mut self,
        gw: &CommandGateway,
        handle: GroupHandle,
        spec: FlowSpec,
    ) -> Result<u32> {
        let group = self.group(handle);
        let (start, end, group_id) = (group.start, group.end, group.id);

        // First fit; slots freed by removal are reused in range order.
        let mut slot = None;
        for index in start..=end {
            if !self.entries[index as usize].reserved {
                slot = Some(index);
                break;
            }
        }
        let index = slot.ok_or(Error::TableExhausted)?;

        {
            let entry = &mut self.entries[index as usize];
            entry.reserved = true;
            entry.dirty = true;
            entry.spec = spec.clone();
        }
        let res = gw.done(&Command::SetFlowTableEntry {
            table: self.id,
            index,
            group: group_id,
            spec,
        });
        let entry = &mut self.entries[index as usize];
        match res {
            Ok(()) => {
                entry.created = true;
                entry.dirty = false;
                Ok(index)
            }
            Err(e) => {
                entry.reserved = false;
                entry.dirty = false;
                entry.spec = FlowSpec::default();
                Err(e.into())
            }
        }
    }

    /// Rewrites an existing entry's spec in place (typically to change its
    /// destination fan-out). Rolls the spec back on command failure.
    pub fn update_entry(
        &mut self,
        gw: &CommandGateway,
        handle: GroupHandle,
        index: u32,
        spec: FlowSpec,
    ) -> Result<()> {
        let group_id = self.group(handle).id;
        let entry = &mut self.entries[index as usize];
        assert!(
            entry.created,
            "flow entry {index} in table {} updated before it was created",
            self.id
        );
        let previous = core::mem::replace(&mut entry.spec, spec.clone());
        entry.dirty = true;
        let res = gw.done(&Command::SetFlowTableEntry {
            table: self.id,
            index,
            group: group_id,
            spec,
        });
        let entry = &mut self.entries[index as usize];
        match res {
            Ok(()) => {
                entry.dirty = false;
                Ok(())
            }
            Err(e) => {
                entry.spec = previous;
                entry.dirty = false;
                Err(e.into())
            }
        }
    }

    /// Removes an entry from hardware and frees its slot. On command
    /// failure the entry stays installed and reserved.
    pub fn remove_entry(&mut self, gw: &CommandGateway, index: u32) -> Result<()> {
        let entry = &mut self.entries[index as usize];
        if !entry.created {
            return Err(Error::NotFound);
        }
        gw.done(&Command::DeleteFlowTableEntry { table: self.id, index })?;
        *entry = FlowEntry::default();
        Ok(())
    }

    pub fn entry(&self, index: u32) -> &FlowEntry {
        &self.entries[index as usize]
    }

    /// Free (unreserved) slots within one group.
    pub fn group_free_slots(&self, handle: GroupHandle) -> u32 {
        let group = self.group(handle);
        (group.start..=group.end)
            .filter(|&i| !self.entries[i as usize].reserved)
            .count() as u32
    }

    /// Free slots across the whole table, counting slots not yet claimed by
    /// any group.
    pub fn free_slots(&self) -> u32 {
        self.entries.iter().filter(|e| !e.reserved).count() as u32
    }

    /// Tears the table down: entries in reverse slot order, then groups in
    /// reverse creation order, then the table itself.
    ///
    /// Hardware refusing to destroy an object it told us it created is not
    /// recoverable; classification state would be unaccountable afterwards.
    pub fn teardown(mut self, gw: &CommandGateway) {
        for index in (0..self.nents()).rev() {
            let entry = &mut self.entries[index as usize];
            if !entry.created {
                continue;
            }
            gw.done(&Command::DeleteFlowTableEntry { table: self.id, index })
                .unwrap_or_else(|e| {
                    panic!("flow entry {index} in table {} refused deletion: {e}", self.id)
                });
            *entry = FlowEntry::default();
        }
        for group in self.groups.drain(..).rev() {
            gw.done(&Command::DestroyFlowGroup { table: self.id, group: group.id })
                .unwrap_or_else(|e| {
                    panic!("flow group {} in table {} refused destruction: {e}", group.id, self.id)
                });
        }
        gw.done(&Command::DestroyFlowTable { table: self.id })
            .unwrap_or_else(|e| panic!("flow table {} refused destruction: {e}", self.id));
        trace!("destroyed flow table {}", self.id);
    }
}
