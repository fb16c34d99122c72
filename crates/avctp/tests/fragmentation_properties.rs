//! Property-based tests for AVCTP fragmentation and reassembly
//!
//! These tests verify that any message survives being split across the
//! peer MTU and reassembled on the other side, and that every packet
//! respects the MTU it was built for.

use avctp::packet::{fragment, MessageHeader, PacketType, Reassembler};
use avctp::types::CommandResponse;
use proptest::prelude::*;

/// Generate an MTU usable for fragmentation
fn arb_mtu() -> impl Strategy<Value = u16> {
    5u16..=1024u16
}

fn arb_cr() -> impl Strategy<Value = CommandResponse> {
    prop_oneof![Just(CommandResponse::Command), Just(CommandResponse::Response)]
}

/// Number of packets a payload needs, single packets included
fn packets_needed(size: usize, mtu: u16) -> usize {
    let mtu = mtu as usize;
    if size + 3 <= mtu {
        1
    } else {
        (size - (mtu - 4)).div_ceil(mtu - 1) + 1
    }
}

proptest! {
    /// Property: reassembling the fragments yields the original message
    #[test]
    fn fragments_reassemble_to_original(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        mtu in arb_mtu(),
        label in 0u8..=15,
        cr in arb_cr(),
        pid in any::<u16>(),
    ) {
        let needed = packets_needed(payload.len(), mtu);
        let result = fragment(&payload, mtu, label, cr, pid);

        if needed > 255 {
            prop_assert!(result.is_err());
            return Ok(());
        }

        let packets = result.expect("fragmentation within 255 packets succeeds");
        prop_assert_eq!(packets.len(), needed);
        for packet in &packets {
            prop_assert!(packet.len() <= mtu as usize);
        }

        let mut reassembler = Reassembler::new();
        let mut complete = None;
        for (index, packet) in packets.iter().enumerate() {
            let out = reassembler.push(packet);
            if index + 1 < packets.len() {
                prop_assert!(out.is_none());
            } else {
                complete = out;
            }
        }

        let message = complete.expect("last packet completes the message");
        prop_assert!(!reassembler.in_progress());

        let header = MessageHeader::parse(&message).expect("reassembled header parses");
        prop_assert_eq!(header.packet_type, PacketType::Single);
        prop_assert_eq!(header.label, label);
        prop_assert_eq!(header.cr, cr);
        prop_assert_eq!(header.pid, pid);
        prop_assert!(!header.ipid);
        prop_assert_eq!(&message[3..], &payload[..]);
    }

    /// Property: a start packet discards any message still being reassembled
    #[test]
    fn start_packet_replaces_stale_buffer(
        first in prop::collection::vec(any::<u8>(), 100..300),
        second in prop::collection::vec(any::<u8>(), 100..300),
        mtu in 40u16..=90u16,
    ) {
        let stale = fragment(&first, mtu, 1, CommandResponse::Command, 0x110E).unwrap();
        let fresh = fragment(&second, mtu, 2, CommandResponse::Command, 0x110E).unwrap();

        let mut reassembler = Reassembler::new();
        // Feed everything but the end packet of the first message
        for packet in &stale[..stale.len() - 1] {
            prop_assert!(reassembler.push(packet).is_none());
        }
        prop_assert!(reassembler.in_progress());

        let mut complete = None;
        for packet in &fresh {
            complete = reassembler.push(packet);
        }
        let message = complete.expect("fresh message completes");
        prop_assert_eq!(&message[3..], &second[..]);
        prop_assert_eq!(MessageHeader::parse(&message).unwrap().label, 2);
    }
}
