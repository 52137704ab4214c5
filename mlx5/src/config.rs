//! Driver tunables, loaded once at attach and immutable afterwards.

use std::time::Duration;

use mlx_cmd::HcaCaps;

/// How many TIRs every RX group needs: one per protocol the hardware can
/// hash on, plus the non-IP catch-all.
pub const TIRS_PER_GROUP: u32 = 7;

/// Every knob the driver core reads. Values are fixed at construction; the
/// queue-size fields are log2 shifts of the entry counts.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub eq_size_shift: u8,
    pub cq_size_shift: u8,
    pub rq_size_shift: u8,
    pub sq_size_shift: u8,

    /// Large groups get many rings for the primary MAC's traffic; small
    /// groups serve VNICs and the like with fewer rings each.
    pub rx_ngroups_large: usize,
    pub rx_ngroups_small: usize,
    pub rx_nrings_per_large_group: usize,
    pub rx_nrings_per_small_group: usize,
    pub tx_ngroups: usize,
    pub tx_nrings_per_group: usize,

    /// Completion event queues (one per interrupt vector, besides the
    /// control queue).
    pub completion_eq_count: usize,

    /// log2 size of a port's root (MAC) flow table.
    pub ftbl_root_size_shift: u8,
    /// log2 size of a group's VLAN filter table.
    pub ftbl_vlan_size_shift: u8,

    /// Packets at or under this size are copied into driver-owned TX
    /// buffers; larger ones are DMA-bound in place.
    pub tx_bind_threshold: usize,

    pub rx_buffer_size: usize,
    pub tx_buffer_size: usize,

    /// Completion interrupt moderation.
    pub cqemod_period_usec: u32,
    pub intrmod_period_usec: u32,

    /// How often the control event queue's hardware state is re-queried.
    pub eq_check_period: Duration,

    /// Page-reclaim retry policy: how many refusals to tolerate, and how
    /// long to wait between attempts.
    pub reclaim_tries: u32,
    pub reclaim_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            eq_size_shift: 9,
            cq_size_shift: 10,
            rq_size_shift: 8,
            sq_size_shift: 11,
            rx_ngroups_large: 2,
            rx_ngroups_small: 256,
            rx_nrings_per_large_group: 16,
            rx_nrings_per_small_group: 4,
            tx_ngroups: 1,
            tx_nrings_per_group: 64,
            completion_eq_count: 8,
            ftbl_root_size_shift: 12,
            ftbl_vlan_size_shift: 4,
            tx_bind_threshold: 2048,
            rx_buffer_size: 2048,
            tx_buffer_size: 2048,
            cqemod_period_usec: 50,
            intrmod_period_usec: 10,
            eq_check_period: Duration::from_secs(30),
            reclaim_tries: 5,
            reclaim_delay: Duration::from_millis(50),
        }
    }
}

impl DriverConfig {
    pub fn eq_nents(&self) -> u32 {
        1 << self.eq_size_shift
    }

    pub fn cq_nents(&self) -> u32 {
        1 << self.cq_size_shift
    }

    pub fn rq_nents(&self) -> u32 {
        1 << self.rq_size_shift
    }

    pub fn sq_nents(&self) -> u32 {
        1 << self.sq_size_shift
    }

    pub fn rx_ngroups(&self) -> usize {
        self.rx_ngroups_large + self.rx_ngroups_small
    }

    pub fn rx_nrings(&self) -> usize {
        self.rx_ngroups_large * self.rx_nrings_per_large_group
            + self.rx_ngroups_small * self.rx_nrings_per_small_group
    }

    /// Shrinks the configured RX group counts to what the queried
    /// capabilities can actually support. Small groups are given up first;
    /// the large groups (and at minimum one group) always survive.
    pub fn clamp_rx_groups(&mut self, caps: &HcaCaps) {
        // Each group consumes a fixed set of TIRs.
        let tir_limit = (caps.max_tir / TIRS_PER_GROUP) as usize;
        if self.rx_ngroups() > tir_limit {
            warn!(
                "hardware exposes {} TIRs; shrinking RX groups {} -> {}",
                caps.max_tir,
                self.rx_ngroups(),
                tir_limit
            );
            self.shrink_rx_groups(tir_limit);
        }

        // The broadcast entry fans out to every group, so the group count is
        // also bounded by the longest fan-out list an entry may carry.
        let fe_limit = caps.max_fe_dest as usize;
        if self.rx_ngroups() > fe_limit {
            warn!(
                "flow entries carry at most {} destinations; shrinking RX groups {} -> {}",
                caps.max_fe_dest,
                self.rx_ngroups(),
                fe_limit
            );
            self.shrink_rx_groups(fe_limit);
        }

        let rqt_limit = caps.max_rqt_size as usize;
        if self.rx_nrings_per_large_group > rqt_limit {
            self.rx_nrings_per_large_group = rqt_limit;
        }
        if self.rx_nrings_per_small_group > rqt_limit {
            self.rx_nrings_per_small_group = rqt_limit;
        }

        if self.ftbl_root_size_shift > caps.max_rx_ft_shift {
            warn!(
                "root flow table shift {} exceeds hardware max {}; clamping",
                self.ftbl_root_size_shift, caps.max_rx_ft_shift
            );
            self.ftbl_root_size_shift = caps.max_rx_ft_shift;
        }
        if self.ftbl_vlan_size_shift > caps.max_rx_ft_shift {
            self.ftbl_vlan_size_shift = caps.max_rx_ft_shift;
        }

        // Root entries + per-group VLAN and hash entries must fit the
        // hardware's overall flow budget.
        loop {
            let per_group = (1u32 << self.ftbl_vlan_size_shift) + TIRS_PER_GROUP;
            let flows = (1u32 << self.ftbl_root_size_shift)
                + self.rx_ngroups() as u32 * per_group;
            if flows <= caps.max_rx_flows || self.rx_ngroups() <= 1 {
                break;
            }
            self.shrink_rx_groups(self.rx_ngroups() - 1);
        }
    }

    fn shrink_rx_groups(&mut self, target: usize) {
        let target = target.max(1);
        while self.rx_ngroups() > target && self.rx_ngroups_small > 0 {
            self.rx_ngroups_small -= 1;
        }
        while self.rx_ngroups() > target && self.rx_ngroups_large > 1 {
            self.rx_ngroups_large -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn caps(max_tir: u32, max_rx_ft_shift: u8, max_rx_flows: u32) -> HcaCaps {
        HcaCaps {
            num_ports: 1,
            log_pg_sz: 12,
            cqe_version: 1,
            max_tir,
            max_rqt_size: 64,
            max_rx_ft_shift,
            max_rx_flows,
            max_fe_dest: 1024,
        }
    }

    #[test]
    fn ample_caps_leave_config_alone() {
        let mut cfg = DriverConfig::default();
        let before = cfg.rx_ngroups();
        cfg.clamp_rx_groups(&caps(1 << 16, 15, 1 << 24));
        assert_eq!(cfg.rx_ngroups(), before);
        assert_eq!(cfg.ftbl_root_size_shift, 12);
    }

    #[test]
    fn tir_budget_shrinks_small_groups_first() {
        let mut cfg = DriverConfig::default();
        cfg.clamp_rx_groups(&caps(10 * TIRS_PER_GROUP, 15, 1 << 24));
        assert_eq!(cfg.rx_ngroups(), 10);
        assert_eq!(cfg.rx_ngroups_large, 2);
        assert_eq!(cfg.rx_ngroups_small, 8);
    }

    #[test]
    fn flow_budget_never_shrinks_below_one_group() {
        let mut cfg = DriverConfig::default();
        cfg.clamp_rx_groups(&caps(1 << 16, 4, 64));
        assert_eq!(cfg.ftbl_root_size_shift, 4);
        assert!(cfg.rx_ngroups() >= 1);
    }
}
