//! Tests for buffer state transitions, pool exhaustion, chains, and
//! shard drain behaviour.

use super::*;
use nic_dma::HeapDma;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn shard_with(kind: ShardKind, count: usize) -> BufferShard {
    let shard = BufferShard::new(kind);
    shard.provision(count, 2048, &HeapDma::new()).unwrap();
    shard
}

#[test]
fn take_and_release_round_trip() {
    let shard = shard_with(ShardKind::Rx, 4);
    assert_eq!(shard.free_count(), 4);

    let mut buf = shard.take().unwrap();
    assert_eq!(buf.state(), BufferState::OnWq);
    assert_eq!(shard.free_count(), 3);
    assert_eq!(shard.busy_count(), 1);

    buf.set_wqe_index(7);
    shard.release(buf).unwrap();
    assert_eq!(shard.free_count(), 4);
    assert_eq!(shard.busy_count(), 0);

    // Scrubbed on the way back in.
    let buf = shard.take().unwrap();
    assert_eq!(buf.wqe_index(), None);
    assert_eq!(buf.len(), 0);
}

#[test]
fn exhaustion_is_an_error_then_recovers() {
    let shard = shard_with(ShardKind::Rx, 2);
    let a = shard.take().unwrap();
    let b = shard.take().unwrap();
    assert_eq!(shard.take().unwrap_err(), BufferError::Exhausted);

    shard.release(a).unwrap();
    let c = shard.take().unwrap();
    shard.release(b).unwrap();
    shard.release(c).unwrap();
    assert_eq!(shard.free_count(), 2);
}

#[test]
fn release_rejects_wrong_state() {
    let shard = shard_with(ShardKind::Rx, 1);
    let mut buf = shard.take().unwrap();
    buf.state = BufferState::Free;
    match shard.release(buf) {
        Err(BufferError::BadState(BufferState::Free)) => {}
        other => panic!("expected BadState, got {other:?}"),
    }
    // The misused buffer is gone for good, not pooled.
    assert_eq!(shard.free_count(), 0);
}

#[test]
fn write_packet_respects_capacity() {
    let shard = shard_with(ShardKind::TxOwned, 1);
    let mut buf = shard.take().unwrap();
    buf.write_packet(&[0xab; 100]).unwrap();
    assert_eq!(buf.len(), 100);
    assert_eq!(buf.data(), &[0xab; 100][..]);

    let too_big = vec![0u8; 4096];
    match buf.write_packet(&too_big) {
        Err(BufferError::TooLong { len: 4096, .. }) => {}
        other => panic!("expected TooLong, got {other:?}"),
    }
    shard.release(buf).unwrap();
}

#[test]
fn foreign_binding_carries_no_memory() {
    let shard = BufferShard::new(ShardKind::TxForeign);
    shard.provision(2, 0, &HeapDma::new()).unwrap();

    let mut buf = shard.take().unwrap();
    buf.bind_foreign(0xdead_b000, 1514).unwrap();
    assert_eq!(buf.device_addr(), 0xdead_b000);
    assert_eq!(buf.len(), 1514);
    assert!(buf.data().is_empty());
    shard.release(buf).unwrap();

    // Binding comes off on release.
    let buf = shard.take().unwrap();
    assert_eq!(buf.device_addr(), 0);
    shard.release(buf).unwrap();
}

#[test]
fn owned_buffers_reject_foreign_binding() {
    let shard = shard_with(ShardKind::TxOwned, 1);
    let mut buf = shard.take().unwrap();
    assert!(buf.bind_foreign(0x1000, 64).is_err());
    shard.release(buf).unwrap();
}

#[test]
fn chain_returns_every_segment_and_fires_callback_once() {
    let owned = shard_with(ShardKind::TxOwned, 2);
    let foreign = BufferShard::new(ShardKind::TxForeign);
    foreign.provision(2, 0, &HeapDma::new()).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));

    let mut head = owned.take().unwrap();
    head.write_packet(&[1; 64]).unwrap();
    let mut seg1 = foreign.take().unwrap();
    seg1.bind_foreign(0x2000, 700).unwrap();
    let seg2 = owned.take().unwrap();
    head.chain_segment(seg1);
    head.chain_segment(seg2);

    let gather = head.gather_list();
    assert_eq!(gather.len(), 3);
    assert_eq!(gather[1], (0x2000, 700));

    let fired2 = fired.clone();
    head.set_release_callback(Box::new(move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(owned.busy_count(), 2);
    assert_eq!(foreign.busy_count(), 1);

    owned.release(head).unwrap();
    assert_eq!(owned.busy_count(), 0);
    assert_eq!(foreign.busy_count(), 0);
    assert_eq!(owned.free_count(), 2);
    assert_eq!(foreign.free_count(), 2);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn loan_returns_buffer_on_drop() {
    let shard = shard_with(ShardKind::Rx, 1);
    let mut buf = shard.take().unwrap();
    buf.write_packet(&[9; 60]).unwrap();
    let loan = buf.into_loan().unwrap();
    assert_eq!(loan.len(), 60);
    assert_eq!(&loan[..4], &[9, 9, 9, 9]);
    assert_eq!(shard.busy_count(), 1);

    drop(loan);
    assert_eq!(shard.busy_count(), 0);
    assert_eq!(shard.free_count(), 1);
}

#[test]
fn loan_requires_on_queue_state() {
    let shard = shard_with(ShardKind::Rx, 1);
    let mut buf = shard.take().unwrap();
    buf.state = BufferState::Loaned;
    assert!(buf.into_loan().is_err());
}

#[test]
fn shutdown_blocks_until_drained() {
    let shard = shard_with(ShardKind::Rx, 2);
    let buf = shard.take().unwrap();

    let releaser = {
        let shard = shard.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            shard.release(buf).unwrap();
        })
    };

    // Blocks until the other thread releases, then drains the free list.
    shard.shutdown();
    assert_eq!(shard.busy_count(), 0);
    assert_eq!(shard.free_count(), 0);
    releaser.join().unwrap();

    assert_eq!(shard.take().unwrap_err(), BufferError::ShuttingDown);
}

#[test]
fn shutdown_refuses_new_provisioning() {
    let shard = shard_with(ShardKind::Rx, 1);
    shard.shutdown();
    assert_eq!(
        shard.provision(1, 2048, &HeapDma::new()).unwrap_err(),
        BufferError::ShuttingDown
    );
}
