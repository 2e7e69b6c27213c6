//! Property-based tests for the line codec.
//!
//! Uses proptest to verify:
//! 1. Any frame survives encode → decode with every field intact.
//! 2. An encoded frame is exactly one line, whatever its content holds.
//! 3. Arbitrary text never causes a panic in `decode_line`.
//! 4. Identity-list content survives the nested JSON encoding.

use proptest::prelude::*;
use ringchat_proto::codec::{self, Frame};
use ringchat_proto::identity::{NodeInfo, TopologyInfo};
use ringchat_proto::message::{Message, MessageType, Timestamp};
use ringchat_proto::presence::{ConnectionState, UserStateChange};

// --- Strategies for protocol types ---

fn arb_node_info() -> impl Strategy<Value = NodeInfo> {
    ("[a-z0-9.]{1,20}", any::<u16>(), "[a-zA-Z0-9_ ]{1,16}")
        .prop_map(|(address, port, name)| NodeInfo::new(address, port, name))
}

fn arb_topology_info() -> impl Strategy<Value = TopologyInfo> {
    (".{0,16}", ".{0,16}", ".{0,16}")
        .prop_map(|(node, left, right)| TopologyInfo::new(node, left, right))
}

fn arb_message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::KingIsDead),
        Just(MessageType::LongLiveTheKing),
        Just(MessageType::Greetings),
        Just(MessageType::TopologyChanged),
        Just(MessageType::Confirm),
        Just(MessageType::Reject),
        Just(MessageType::Chat),
        Just(MessageType::MapTopology),
        Just(MessageType::OnlineUsers),
        Just(MessageType::Name),
    ]
}

/// Content includes newlines and control characters on purpose.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        any::<u64>(),
        "(?s).{0,256}",
        arb_message_type(),
        arb_node_info(),
        proptest::option::of(arb_node_info()),
    )
        .prop_map(|(millis, content, kind, sender, recipient)| Message {
            timestamp: Timestamp::from_millis(millis),
            content,
            kind,
            sender,
            recipient,
        })
}

fn arb_user_change() -> impl Strategy<Value = UserStateChange> {
    (
        proptest::option::of(".{0,16}"),
        proptest::option::of(prop_oneof![
            Just(ConnectionState::Online),
            Just(ConnectionState::Offline)
        ]),
        proptest::option::of(prop::collection::vec(arb_topology_info(), 0..6)),
    )
        .prop_map(|(user_name, connection_state, topology)| UserStateChange {
            user_name,
            connection_state,
            topology,
        })
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        arb_message().prop_map(Frame::Message),
        arb_node_info().prop_map(Frame::Identity),
        arb_topology_info().prop_map(Frame::Topology),
        arb_user_change().prop_map(Frame::UserChange),
    ]
}

/// `NodeInfo` equality only looks at names, so compare every field.
fn same_identity(a: &NodeInfo, b: &NodeInfo) -> bool {
    a.name == b.name && a.address == b.address && a.port == b.port
}

// --- Property tests ---

proptest! {
    /// Any frame survives an encode → decode round-trip.
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let line = codec::encode_line(&frame).expect("encode should succeed");
        let decoded = codec::decode_line(&line).expect("decode should succeed");
        prop_assert_eq!(&frame, &decoded);

        match (&frame, &decoded) {
            (Frame::Identity(a), Frame::Identity(b)) => prop_assert!(same_identity(a, b)),
            (Frame::Message(a), Frame::Message(b)) => {
                prop_assert!(same_identity(&a.sender, &b.sender));
                prop_assert_eq!(a.timestamp, b.timestamp);
            }
            _ => {}
        }
    }

    /// The only newline in an encoded frame is the terminator.
    #[test]
    fn encoded_frame_is_one_line(frame in arb_frame()) {
        let line = codec::encode_line(&frame).expect("encode should succeed");
        prop_assert!(line.ends_with('\n'));
        prop_assert_eq!(line.matches('\n').count(), 1);
    }

    /// Arbitrary text never panics the decoder.
    #[test]
    fn random_text_decode_no_panic(text in "(?s).{0,512}") {
        let _ = codec::decode_line(&text);
    }

    /// Identity lists carried inside message content survive both layers.
    #[test]
    fn identity_list_content_round_trip(
        ids in prop::collection::vec(arb_node_info(), 0..8),
        sender in arb_node_info(),
    ) {
        let msg = Message::with_identities(MessageType::LongLiveTheKing, &ids, &sender, None)
            .expect("identity list should encode");
        let line = codec::encode_line(&Frame::Message(msg)).expect("encode should succeed");
        let Frame::Message(decoded) = codec::decode_line(&line).expect("decode should succeed")
        else {
            panic!("expected a message frame");
        };
        let parsed = decoded.identities().expect("identity list should parse");
        prop_assert_eq!(parsed.len(), ids.len());
        for (a, b) in ids.iter().zip(&parsed) {
            prop_assert!(same_identity(a, b));
        }
    }

    /// Candidate ids survive their decimal encoding.
    #[test]
    fn election_candidate_round_trip(candidate in any::<u64>(), a in arb_node_info(), b in arb_node_info()) {
        let msg = Message::election(candidate, &a, &b);
        prop_assert_eq!(msg.candidate().expect("candidate should parse"), candidate);
    }
}
