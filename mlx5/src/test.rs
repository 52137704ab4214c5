//! Driver-level tests against the scripted command transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlx_cmd::{Command, CommandGateway, CommandOpcode, FlowSpec};
use nic_dma::HeapDma;

use crate::completion_queue::{Completion, CompletionKind};
use crate::config::DriverConfig;
use crate::error::Error;
use crate::event_queue::{EventClass, EventQueue};
use crate::flow_table::FlowTable;
use crate::pages::PageBank;
use crate::port::Port;
use crate::ring_group::RxGroup;
use crate::sim::{SimState, SimTransport};
use crate::{AttachStage, ConnectX};

fn gateway() -> (CommandGateway, Arc<Mutex<SimState>>) {
    let (transport, state) = SimTransport::new();
    (CommandGateway::new(Box::new(transport), Duration::from_secs(1)), state)
}

fn small_config() -> DriverConfig {
    DriverConfig {
        eq_size_shift: 4,
        cq_size_shift: 4,
        rq_size_shift: 3,
        sq_size_shift: 3,
        rx_ngroups_large: 1,
        rx_ngroups_small: 1,
        rx_nrings_per_large_group: 2,
        rx_nrings_per_small_group: 1,
        tx_ngroups: 1,
        tx_nrings_per_group: 2,
        completion_eq_count: 2,
        ftbl_root_size_shift: 3,
        ftbl_vlan_size_shift: 3,
        tx_bind_threshold: 256,
        rx_buffer_size: 512,
        tx_buffer_size: 512,
        eq_check_period: Duration::from_secs(3600),
        reclaim_tries: 3,
        reclaim_delay: Duration::from_millis(1),
        ..DriverConfig::default()
    }
}

fn attach_small() -> (ConnectX, Arc<Mutex<SimState>>) {
    attach_with(small_config())
}

fn attach_with(config: DriverConfig) -> (ConnectX, Arc<Mutex<SimState>>) {
    let (transport, state) = SimTransport::new();
    let dev = ConnectX::attach(
        config,
        Box::new(transport),
        Duration::from_secs(1),
        Arc::new(HeapDma::new()),
        Arc::new(|_loan| {}),
    )
    .unwrap();
    (dev, state)
}

fn mac(n: u8) -> [u8; 6] {
    [0x02, 0, 0, 0, 0, n]
}

fn first_index(ops: &[CommandOpcode], op: CommandOpcode) -> usize {
    ops.iter().position(|&o| o == op).unwrap_or_else(|| panic!("{op:?} never issued"))
}

fn last_index(ops: &[CommandOpcode], op: CommandOpcode) -> usize {
    ops.iter().rposition(|&o| o == op).unwrap_or_else(|| panic!("{op:?} never issued"))
}

#[test]
fn attach_records_every_stage_in_order() {
    let (dev, _state) = attach_small();
    assert_eq!(
        dev.stages(),
        &[
            AttachStage::Enabled,
            AttachStage::BootPages,
            AttachStage::InitPages,
            AttachStage::InitHca,
            AttachStage::Uar,
            AttachStage::Pd,
            AttachStage::TransportDomain,
            AttachStage::ControlEq,
            AttachStage::Port,
            AttachStage::CompletionEqs,
            AttachStage::TxTis,
            AttachStage::Rings,
            AttachStage::RingGroups,
        ][..]
    );
    assert_eq!(dev.rx_group_count(), 2);
    assert_eq!(dev.completion_eqs().len(), 2);
    assert!(dev.control_eq().unwrap().health_check_running());
    dev.teardown();
}

#[test]
fn teardown_unwinds_in_reverse_dependency_order() {
    let (dev, state) = attach_small();
    dev.teardown();
    let ops = state.lock().unwrap().opcodes();

    // Work queues go before completion queues, which go before event
    // queues; firmware teardown and page reclaim close it out.
    let last_wq = last_index(&ops, CommandOpcode::DestroySq)
        .max(last_index(&ops, CommandOpcode::DestroyRq));
    assert!(last_wq < first_index(&ops, CommandOpcode::DestroyCq));
    assert!(last_index(&ops, CommandOpcode::DestroyCq) < first_index(&ops, CommandOpcode::DestroyEq));
    assert!(last_index(&ops, CommandOpcode::DestroyRqt) < first_index(&ops, CommandOpcode::DestroySq));
    assert!(last_index(&ops, CommandOpcode::DestroyEq) < first_index(&ops, CommandOpcode::TeardownHca));
    assert!(
        first_index(&ops, CommandOpcode::TeardownHca)
            < last_index(&ops, CommandOpcode::ManagePages)
    );
    assert_eq!(*ops.last().unwrap(), CommandOpcode::DisableHca);

    // Every created object class was destroyed as many times as created.
    let state = state.lock().unwrap();
    for (create, destroy) in [
        (CommandOpcode::CreateEq, CommandOpcode::DestroyEq),
        (CommandOpcode::CreateCq, CommandOpcode::DestroyCq),
        (CommandOpcode::CreateSq, CommandOpcode::DestroySq),
        (CommandOpcode::CreateRq, CommandOpcode::DestroyRq),
        (CommandOpcode::CreateTir, CommandOpcode::DestroyTir),
        (CommandOpcode::CreateRqt, CommandOpcode::DestroyRqt),
        (CommandOpcode::CreateTis, CommandOpcode::DestroyTis),
        (CommandOpcode::CreateFlowTable, CommandOpcode::DestroyFlowTable),
        (CommandOpcode::CreateFlowGroup, CommandOpcode::DestroyFlowGroup),
    ] {
        assert_eq!(state.count(create), state.count(destroy), "{create:?} leaked");
    }
    assert!(state.lent_pages.is_empty(), "pages left with the hardware");
}

#[test]
fn attach_failure_unwinds_only_what_was_built() {
    let (transport, state) = SimTransport::new();
    state.lock().unwrap().fail_next(CommandOpcode::CreateCq);
    let res = ConnectX::attach(
        small_config(),
        Box::new(transport),
        Duration::from_secs(1),
        Arc::new(HeapDma::new()),
        Arc::new(|_loan| {}),
    );
    assert!(res.is_err());

    let state = state.lock().unwrap();
    // Control EQ plus both completion EQs went up before the first CQ
    // failed, so exactly three come down; nothing ring-level ever existed.
    assert_eq!(state.count(CommandOpcode::DestroyEq), 3);
    assert_eq!(state.count(CommandOpcode::DestroyTis), 1);
    assert_eq!(state.count(CommandOpcode::DestroyCq), 0);
    assert_eq!(state.count(CommandOpcode::DestroySq), 0);
    assert_eq!(state.count(CommandOpcode::DestroyRq), 0);
    assert_eq!(state.count(CommandOpcode::DestroyRqt), 0);
    // The port root table was built and therefore comes down.
    assert_eq!(state.count(CommandOpcode::DestroyFlowTable), 1);
    let ops = state.opcodes();
    assert_eq!(*ops.last().unwrap(), CommandOpcode::DisableHca);
    assert!(state.lent_pages.is_empty());
}

#[test]
fn completion_queues_round_robin_over_event_queues() {
    let (dev, state) = attach_small();
    let eqns: Vec<u32> = state
        .lock()
        .unwrap()
        .log
        .iter()
        .filter_map(|c| match c {
            Command::CreateCq { eqn, .. } => Some(*eqn),
            _ => None,
        })
        .collect();
    assert_eq!(eqns.len(), 5);
    // Strict alternation across the two completion EQs.
    for pair in eqns.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    let on_first = eqns.iter().filter(|&&e| e == eqns[0]).count();
    assert_eq!(on_first, 3);
    dev.teardown();
}

#[test]
fn health_check_queries_and_stops_with_teardown() {
    let mut config = small_config();
    config.eq_check_period = Duration::from_millis(10);
    let (dev, state) = attach_with(config);
    std::thread::sleep(Duration::from_millis(60));
    assert!(state.lock().unwrap().count(CommandOpcode::QueryEq) >= 1);

    dev.teardown();
    let len = state.lock().unwrap().log.len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(state.lock().unwrap().log.len(), len, "health check outlived teardown");
}

#[test]
#[should_panic(expected = "health check still running")]
fn eq_release_with_running_health_check_panics() {
    let (gw, _state) = gateway();
    let gw = Arc::new(gw);
    let dma = HeapDma::new();
    let mut eq = EventQueue::new(0, 0, 16, &dma).unwrap();
    eq.create(&gw, EventClass::control(), 1).unwrap();
    eq.start_health_check(gw.clone(), Duration::from_secs(3600));
    eq.release();
}

#[test]
fn page_reclaim_retries_then_succeeds() {
    let (gw, state) = gateway();
    let dma = HeapDma::new();
    let mut bank = PageBank::new(12);
    state.lock().unwrap().pages_wanted = 4;
    assert_eq!(bank.satisfy(&gw, &dma, mlx_cmd::PageRequestType::BootPages).unwrap(), 4);
    assert_eq!(bank.lent(), 4);

    state.lock().unwrap().refuse_reclaims = 2;
    bank.reclaim_all(&gw, 3, Duration::from_millis(1)).unwrap();
    assert_eq!(bank.lent(), 0);
    assert!(state.lock().unwrap().lent_pages.is_empty());
}

#[test]
fn page_reclaim_surrenders_after_retry_budget() {
    let (gw, state) = gateway();
    let dma = HeapDma::new();
    let mut bank = PageBank::new(12);
    state.lock().unwrap().pages_wanted = 4;
    bank.satisfy(&gw, &dma, mlx_cmd::PageRequestType::BootPages).unwrap();

    state.lock().unwrap().refuse_reclaims = 100;
    match bank.reclaim_all(&gw, 3, Duration::from_millis(1)) {
        Err(Error::PagesSurrendered(4)) => {}
        other => panic!("expected surrender of 4 pages, got {other:?}"),
    }
    assert_eq!(bank.lent(), 0);
}

#[test]
fn root_table_capacity_is_slots_minus_broadcast_and_promisc() {
    let (gw, state) = gateway();
    let port = Port::setup(&gw, 0, 8).unwrap();
    port.register_group(&gw, 0, 100, 200).unwrap();

    for n in 0..6 {
        port.add_mac(&gw, 0, mac(n)).unwrap();
    }
    assert_eq!(port.umcast_free_slots(), 0);

    let sets_before = state.lock().unwrap().count(CommandOpcode::SetFlowTableEntry);
    assert_eq!(port.add_mac(&gw, 0, mac(6)).unwrap_err(), Error::TableExhausted);
    assert_eq!(port.umcast_free_slots(), 0);
    // Exhaustion is decided before hardware is touched.
    assert_eq!(state.lock().unwrap().count(CommandOpcode::SetFlowTableEntry), sets_before);

    // The promiscuous slot is its own; a full unicast group doesn't block it.
    port.set_promiscuous(&gw, true).unwrap();
    assert!(port.promiscuous());
    let len = state.lock().unwrap().log.len();
    port.set_promiscuous(&gw, true).unwrap();
    assert_eq!(state.lock().unwrap().log.len(), len);
}

#[test]
fn mac_fan_out_refcounts_group_membership() {
    let (gw, state) = gateway();
    let port = Port::setup(&gw, 0, 8).unwrap();
    port.register_group(&gw, 0, 100, 200).unwrap();
    port.register_group(&gw, 1, 101, 201).unwrap();
    let free_before = port.umcast_free_slots();

    port.add_mac(&gw, 0, mac(1)).unwrap();
    assert_eq!(port.mac_fan_out(mac(1)), 1);
    assert_eq!(port.umcast_free_slots(), free_before - 1);

    // Second subscriber shares the entry.
    port.add_mac(&gw, 1, mac(1)).unwrap();
    assert_eq!(port.mac_fan_out(mac(1)), 2);
    assert_eq!(port.umcast_free_slots(), free_before - 1);

    // Duplicate subscribe is a no-op.
    let len = state.lock().unwrap().log.len();
    port.add_mac(&gw, 1, mac(1)).unwrap();
    assert_eq!(state.lock().unwrap().log.len(), len);

    // The entry survives until its last subscriber leaves.
    port.remove_mac(&gw, 0, mac(1)).unwrap();
    assert!(port.mac_subscribed(mac(1)));
    assert_eq!(state.lock().unwrap().count(CommandOpcode::DeleteFlowTableEntry), 0);
    assert_eq!(port.remove_mac(&gw, 0, mac(1)).unwrap_err(), Error::NotFound);

    port.remove_mac(&gw, 1, mac(1)).unwrap();
    assert!(!port.mac_subscribed(mac(1)));
    assert_eq!(state.lock().unwrap().count(CommandOpcode::DeleteFlowTableEntry), 1);
    assert_eq!(port.umcast_free_slots(), free_before);
}

#[test]
fn mac_add_rolls_back_on_command_failure() {
    let (gw, state) = gateway();
    let port = Port::setup(&gw, 0, 8).unwrap();
    port.register_group(&gw, 0, 100, 200).unwrap();
    let free_before = port.umcast_free_slots();

    state.lock().unwrap().fail_next(CommandOpcode::SetFlowTableEntry);
    assert!(port.add_mac(&gw, 0, mac(1)).is_err());
    assert!(!port.mac_subscribed(mac(1)));
    assert_eq!(port.umcast_free_slots(), free_before);

    // The slot is clean and reusable.
    port.add_mac(&gw, 0, mac(1)).unwrap();
    assert_eq!(port.mac_fan_out(mac(1)), 1);
}

#[test]
fn vlan_default_entry_swaps_without_admission_gap() {
    let (gw, state) = gateway();
    let group = RxGroup::setup(&gw, 0, 1, &[10, 11], 8, Vec::new()).unwrap();
    assert!(group.default_vlan_installed());

    group.add_vlan(&gw, true, 10).unwrap();
    assert!(!group.default_vlan_installed());
    assert_eq!(group.vlan_filter_count(), 1);
    {
        // The specific entry went in before the default came out.
        let ops = state.lock().unwrap().opcodes();
        let set = last_index(&ops, CommandOpcode::SetFlowTableEntry);
        let del = last_index(&ops, CommandOpcode::DeleteFlowTableEntry);
        assert!(set < del);
    }

    // Second filter: the default is already gone, no delete issued.
    let dels = state.lock().unwrap().count(CommandOpcode::DeleteFlowTableEntry);
    group.add_vlan(&gw, true, 20).unwrap();
    assert_eq!(state.lock().unwrap().count(CommandOpcode::DeleteFlowTableEntry), dels);

    group.remove_vlan(&gw, true, 20).unwrap();
    assert!(!group.default_vlan_installed());

    group.remove_vlan(&gw, true, 10).unwrap();
    assert!(group.default_vlan_installed());
    assert_eq!(group.vlan_filter_count(), 0);
    {
        // The default was reinstated before the last specific came out.
        let ops = state.lock().unwrap().opcodes();
        let set = last_index(&ops, CommandOpcode::SetFlowTableEntry);
        let del = last_index(&ops, CommandOpcode::DeleteFlowTableEntry);
        assert!(set < del);
    }
}

#[test]
fn vlan_add_is_idempotent_and_remove_reports_missing() {
    let (gw, state) = gateway();
    let group = RxGroup::setup(&gw, 0, 1, &[10], 8, Vec::new()).unwrap();

    group.add_vlan(&gw, true, 7).unwrap();
    let len = state.lock().unwrap().log.len();
    group.add_vlan(&gw, true, 7).unwrap();
    assert_eq!(state.lock().unwrap().log.len(), len, "duplicate add touched hardware");
    assert_eq!(group.vlan_filter_count(), 1);

    assert_eq!(group.remove_vlan(&gw, true, 8).unwrap_err(), Error::NotFound);
    assert_eq!(group.vlan_filter_count(), 1);
    assert!(!group.default_vlan_installed());
}

#[test]
fn vlan_removal_aborts_if_default_cannot_be_reinstated() {
    let (gw, state) = gateway();
    let group = RxGroup::setup(&gw, 0, 1, &[10], 8, Vec::new()).unwrap();
    group.add_vlan(&gw, true, 10).unwrap();

    state.lock().unwrap().fail_next(CommandOpcode::SetFlowTableEntry);
    assert!(group.remove_vlan(&gw, true, 10).is_err());
    // The filter stays; traffic admission never lapsed.
    assert_eq!(group.vlan_filter_count(), 1);
    assert!(!group.default_vlan_installed());

    group.remove_vlan(&gw, true, 10).unwrap();
    assert!(group.default_vlan_installed());
}

#[test]
fn vlan_add_rolls_back_specific_if_default_removal_fails() {
    let (gw, state) = gateway();
    let group = RxGroup::setup(&gw, 0, 1, &[10], 8, Vec::new()).unwrap();

    state.lock().unwrap().fail_next(CommandOpcode::DeleteFlowTableEntry);
    assert!(group.add_vlan(&gw, true, 10).is_err());
    assert_eq!(group.vlan_filter_count(), 0);
    assert!(group.default_vlan_installed());
}

#[test]
fn flow_group_first_fit_and_exhaustion() {
    let (gw, _state) = gateway();
    let mut table = FlowTable::create(&gw, 0, 4).unwrap();
    let group = table.add_group(&gw, 2, FlowSpec::default()).unwrap();

    let a = table.add_entry(&gw, group, FlowSpec::default()).unwrap();
    let b = table.add_entry(&gw, group, FlowSpec::default()).unwrap();
    assert_eq!((a, b), (0, 1));
    assert_eq!(table.group_free_slots(group), 0);

    assert_eq!(
        table.add_entry(&gw, group, FlowSpec::default()).unwrap_err(),
        Error::TableExhausted
    );
    assert_eq!(table.group_free_slots(group), 0);

    // Freed slots are reused first-fit.
    table.remove_entry(&gw, a).unwrap();
    assert_eq!(table.add_entry(&gw, group, FlowSpec::default()).unwrap(), 0);

    assert_eq!(table.remove_entry(&gw, 3).unwrap_err(), Error::NotFound);
}

#[test]
fn flow_entry_update_rolls_back_on_failure() {
    let (gw, state) = gateway();
    let mut table = FlowTable::create(&gw, 0, 4).unwrap();
    let group = table.add_group(&gw, 2, FlowSpec::default()).unwrap();
    let spec = FlowSpec { ethertype: Some(0x0800), ..FlowSpec::default() };
    let slot = table.add_entry(&gw, group, spec.clone()).unwrap();

    state.lock().unwrap().fail_next(CommandOpcode::SetFlowTableEntry);
    let updated = FlowSpec { ethertype: Some(0x86dd), ..FlowSpec::default() };
    assert!(table.update_entry(&gw, group, slot, updated).is_err());
    assert_eq!(table.entry(slot).spec(), &spec);
    assert!(!table.entry(slot).is_dirty());
    assert!(table.entry(slot).is_created());
}

#[test]
fn rx_completion_loans_buffer_and_refills_ring() {
    let (mut dev, _state) = attach_small();
    dev.start().unwrap();

    let ring = dev.rx_group(0).unwrap().rings()[0].clone();
    let mut loans = Vec::new();
    {
        let mut ring = ring.lock().unwrap();
        assert_eq!(ring.wq.posted(), 8);
        assert_eq!(ring.wq.shard().busy_count(), 8);

        ring.cq.push(Completion { wqe_index: 0, kind: CompletionKind::Rx { len: 64 } });
        ring.process_completions(&mut |loan| loans.push(loan)).unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0].len(), 64);

        // The vacated descriptor was refilled from the shard surplus.
        assert_eq!(ring.wq.posted(), 8);
        assert_eq!(ring.wq.shard().busy_count(), 9);
    }

    drop(loans);
    assert_eq!(ring.lock().unwrap().wq.shard().busy_count(), 8);

    dev.stop().unwrap();
    {
        let ring = ring.lock().unwrap();
        assert_eq!(ring.wq.posted(), 0);
        assert_eq!(ring.wq.shard().busy_count(), 0);
    }
    dev.teardown();
}

#[test]
fn rx_discard_recycles_without_delivery() {
    let (mut dev, _state) = attach_small();
    dev.start().unwrap();

    let ring = dev.rx_group(0).unwrap().rings()[0].clone();
    {
        let mut ring = ring.lock().unwrap();
        ring.cq.push(Completion { wqe_index: 3, kind: CompletionKind::RxDiscard });
        let mut delivered = 0;
        ring.process_completions(&mut |_loan| delivered += 1).unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(ring.wq.posted(), 8);
        assert_eq!(ring.wq.shard().busy_count(), 8);
    }
    dev.teardown();
}

#[test]
fn tx_copies_small_packets_and_binds_large_ones() {
    let (mut dev, _state) = attach_small();
    dev.start().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    let small = [0x11u8; 64];
    let header = [0x22u8; 64];
    let payload = vec![0x33u8; 600];

    let tx = dev.tx_group().unwrap();
    let ring = tx.rings()[0].clone();

    let small_idx = tx.post(0, &[&small], None).unwrap();
    {
        let ring = ring.lock().unwrap();
        assert_eq!(ring.wq.shard().busy_count(), 1);
        assert_eq!(ring.wq.foreign_shard().unwrap().busy_count(), 0);
    }

    // Over the bind threshold: header copied, payload bound in place.
    let fired2 = fired.clone();
    let big_idx = tx
        .post(
            0,
            &[&header, &payload],
            Some(Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    {
        let ring = ring.lock().unwrap();
        assert_eq!(ring.wq.shard().busy_count(), 2);
        assert_eq!(ring.wq.foreign_shard().unwrap().busy_count(), 1);
    }

    {
        let mut ring = ring.lock().unwrap();
        ring.cq.push(Completion { wqe_index: small_idx, kind: CompletionKind::TxDone });
        ring.cq.push(Completion { wqe_index: big_idx, kind: CompletionKind::TxDone });
        ring.process_completions(&mut |_loan| {}).unwrap();
        assert_eq!(ring.wq.shard().busy_count(), 0);
        assert_eq!(ring.wq.foreign_shard().unwrap().busy_count(), 0);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    dev.teardown();
}

#[test]
fn tx_ring_reports_full() {
    let (mut dev, _state) = attach_small();
    dev.start().unwrap();
    let tx = dev.tx_group().unwrap();

    let pkt = [0u8; 32];
    for _ in 0..8 {
        tx.post(0, &[&pkt], None).unwrap();
    }
    assert_eq!(tx.post(0, &[&pkt], None).unwrap_err(), Error::RingFull);
    dev.teardown();
}

#[test]
fn completion_vector_drains_ring_through_notification() {
    let (mut dev, _state) = attach_small();
    dev.start().unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    // Re-attach would be heavier; push through the public notify path
    // instead and let the vector run against the shared ring map.
    let ring = dev.rx_group(0).unwrap().rings()[0].clone();
    let cqn = ring.lock().unwrap().cq.cqn().unwrap();
    ring.lock()
        .unwrap()
        .cq
        .push(Completion { wqe_index: 1, kind: CompletionKind::RxDiscard });
    dev.notify_completion(1, cqn);

    // The worker owns the drain; wait for it to happen.
    for _ in 0..100 {
        if ring.lock().unwrap().cq.pending_len() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(ring.lock().unwrap().cq.pending_len(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    dev.teardown();
}
