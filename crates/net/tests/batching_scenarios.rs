//! End-to-end scenarios: sender batcher, recording transport, receiver dispatcher.

use glam::{Quat, Vec3};
use mmobatch_net::{
    BatchDispatcher, BatchedMessage, BatchingConfig, BatchingLayer, CharacterStateMirror,
    ConnectionId, DeliveryMethod, ManualClock, MemoryTransport, MessageBatcher, MessageType,
    Priority,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatLine {
    from: String,
    text: String,
}

const CHAT: MessageType = MessageType(20);
const DAMAGE: MessageType = MessageType(5);

fn setup() -> (MessageBatcher, MemoryTransport, ManualClock) {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new();
    let batcher = MessageBatcher::new(
        BatchingConfig::default(),
        Arc::new(transport.clone()),
        Arc::new(clock.clone()),
    );
    (batcher, transport, clock)
}

#[test]
fn two_critical_messages_share_one_envelope() {
    let (mut batcher, transport, clock) = setup();
    let dest = ConnectionId(1);

    batcher
        .queue_message(dest, DeliveryMethod::ReliableOrdered, DAMAGE, &10u32, Priority::Critical)
        .unwrap();
    clock.set(Duration::from_millis(10));
    batcher
        .queue_message(dest, DeliveryMethod::ReliableOrdered, DAMAGE, &20u32, Priority::Critical)
        .unwrap();
    clock.set(Duration::from_millis(20));
    batcher.tick();

    let sent = transport.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, dest);
    let envelope = BatchedMessage::decode(&sent[0].payload).unwrap();
    assert_eq!(envelope.len(), 2);
    let values: Vec<u32> = envelope
        .entries
        .iter()
        .map(|e| {
            assert_eq!(e.message_type, DAMAGE);
            postcard::from_bytes(&e.payload).unwrap()
        })
        .collect();
    assert_eq!(values, vec![10, 20]);
}

#[test]
fn dispatcher_receives_typed_messages_in_order() {
    let (mut batcher, transport, _clock) = setup();
    let dest = ConnectionId(9);
    for i in 0..5 {
        let line = ChatLine {
            from: "ana".into(),
            text: format!("hello {i}"),
        };
        batcher
            .queue_message(dest, DeliveryMethod::ReliableOrdered, CHAT, &line, Priority::Low)
            .unwrap();
    }
    batcher.flush_all();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let mut dispatcher = BatchDispatcher::new();
    dispatcher.register(CHAT, move |source, payload| {
        assert_eq!(source, ConnectionId(0));
        let line: ChatLine = postcard::from_bytes(payload)?;
        sink.lock().unwrap().push(line.text);
        Ok(())
    });
    for sent in transport.drain() {
        dispatcher.handle_inbound(&sent.into_inbound(ConnectionId(0)));
    }

    let texts = received.lock().unwrap().clone();
    assert_eq!(
        texts,
        (0..5).map(|i| format!("hello {i}")).collect::<Vec<_>>()
    );
    assert_eq!(dispatcher.stats().batches_received, 1);
}

#[test]
fn fallback_sends_reach_handlers_unbatched() {
    let (mut batcher, transport, _clock) = setup();
    transport.fail_message_type(MessageType::BATCHED_MESSAGE);
    for i in 0..3u8 {
        batcher
            .queue_raw_message(ConnectionId(1), DeliveryMethod::Unreliable, DAMAGE, vec![i], Priority::High)
            .unwrap();
    }
    batcher.flush_all();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut dispatcher = BatchDispatcher::new();
    dispatcher.register(DAMAGE, move |_, payload| {
        sink.lock().unwrap().push(payload[0]);
        Ok(())
    });
    for sent in transport.drain() {
        dispatcher.handle_inbound(&sent.into_inbound(ConnectionId(1)));
    }
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(dispatcher.stats().batches_received, 0);
    assert_eq!(dispatcher.stats().messages_processed, 3);
}

#[test]
fn layer_streams_character_state_to_a_mirror() {
    let transport = MemoryTransport::new();
    let clock = ManualClock::new();
    let mut layer = BatchingLayer::configure(
        BatchingConfig::default(),
        Arc::new(transport.clone()),
        Arc::new(clock.clone()),
    );
    layer.start().unwrap();

    let mirror = Arc::new(Mutex::new(CharacterStateMirror::new()));
    let target = Arc::clone(&mirror);
    let mut receiver = BatchDispatcher::new();
    receiver.register(MessageType::CHARACTER_STATE_BATCH, move |_, payload| {
        target.lock().unwrap().apply_bytes(payload)?;
        Ok(())
    });

    let mut position = Vec3::new(5.0, 0.0, 5.0);
    for frame in 0..120 {
        position += Vec3::new(0.05, 0.0, 0.02);
        let rotation = Quat::from_rotation_y((frame as f32).to_radians());
        layer.queue_character_state_update("hero", position, rotation, ConnectionId(3));
        clock.advance(Duration::from_millis(16));
        layer.tick();
        for sent in transport.drain() {
            receiver.handle_inbound(&sent.into_inbound(ConnectionId(0)));
        }
    }
    layer.flush_all();
    for sent in transport.drain() {
        receiver.handle_inbound(&sent.into_inbound(ConnectionId(0)));
    }

    let (mirrored, _) = mirror.lock().unwrap().get("hero").unwrap();
    let sent = layer.character_states().snapshot("hero").unwrap().position;
    assert!(mirrored.abs_diff_eq(sent, 1e-3), "{mirrored} vs {sent}");
    assert!(layer.messages().stats().batches_sent > 0);
    assert_eq!(receiver.stats().unknown_messages, 0);
}
