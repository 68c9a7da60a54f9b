// AutoFollow — link worker loops.
//
// Two cooperating tasks per node. The comms loop owns the send side and
// paces itself; the process loop sleeps on a task notification raised by
// the receive callback and consumes at most one packet per wake. Both
// exit once the node pauses (a WAVE was exchanged), letting the
// supervisor join them and tear the session down.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{ACK_TIMEOUT_MS, LINK_CYCLE_DELAY_MS, PROCESS_WAKE_POLL_MS};
use crate::drivers::notify::{TaskWake, WakeSlot};
use crate::events::Role;
use crate::link::{LinkNode, Transport};
use crate::ranging::WakeListener;

pub fn comms_loop<T: Transport>(node: Arc<LinkNode<T>>) {
    let ack_timeout = Duration::from_millis(ACK_TIMEOUT_MS);
    loop {
        if node.is_paused() {
            break;
        }
        if node.ready_to_transmit() {
            node.transmit_cycle();
        } else {
            match node.role() {
                Role::Transmitter => {
                    log::info!("waiting for acknowledgement from receiver (bot)")
                }
                Role::Receiver => {
                    log::info!("waiting for acknowledgement from transmitter (belt)")
                }
            }
        }
        if node.release_stale_gate(ack_timeout) {
            log::warn!("no response within {ack_timeout:?}, reopening flow gate");
        }
        thread::sleep(Duration::from_millis(LINK_CYCLE_DELAY_MS));
    }
    log::info!("comms task exiting");
}

pub fn process_loop<T: Transport>(node: Arc<LinkNode<T>>, rx_slot: Arc<WakeSlot>) {
    let wake = TaskWake::new();
    wake.register(&rx_slot);
    loop {
        if node.is_paused() {
            break;
        }
        // Short timeout keeps the pause flag honest even if the peer
        // goes quiet for good.
        if wake
            .wait(Duration::from_millis(PROCESS_WAKE_POLL_MS))
            .is_some()
        {
            node.process_incoming();
        }
    }
    log::info!("process task exiting");
}
