//! Deterministic workload driving a [`BatchingLayer`] over a [`MemoryTransport`].
//!
//! The server side owns the layer; every observer is a receiving connection
//! with its own dispatcher and character state mirror. Traffic is routed from
//! the transport's send log to the observer it was addressed to.

use crate::config::SimulationConfig;
use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use mmobatch_net::{
    BatchDispatcher, BatchProcessingStats, BatchingConfig, BatchingLayer, CharacterStateMirror,
    ConnectionId, DeliveryMethod, ManualClock, MemoryTransport, MessageType, Priority,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

pub const CHAT: MessageType = MessageType(100);
pub const ABILITY_CAST: MessageType = MessageType(101);
pub const COMBAT_RESULT: MessageType = MessageType(102);
pub const DESPAWN: MessageType = MessageType(103);

const SERVER: ConnectionId = ConnectionId(0);
const WORLD_HALF_EXTENT: f32 = 200.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbilityCast {
    pub caster: String,
    pub ability_id: u16,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatResult {
    pub attacker: String,
    pub target: String,
    pub damage: u32,
    pub critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Despawn {
    pub entity: String,
}

struct SimCharacter {
    index: usize,
    generation: u32,
    id: String,
    position: Vec3,
    heading: f32,
    observer: usize,
}

impl SimCharacter {
    fn rotation(&self) -> Quat {
        Quat::from_rotation_y(self.heading)
    }
}

/// Received-message counters of one observer.
#[derive(Default)]
struct Inbox {
    chat: AtomicU64,
    abilities: AtomicU64,
    combat: AtomicU64,
    despawns: AtomicU64,
}

struct Observer {
    connection: ConnectionId,
    dispatcher: BatchDispatcher,
    mirror: Arc<Mutex<CharacterStateMirror>>,
    inbox: Arc<Inbox>,
}

impl Observer {
    fn new(connection: ConnectionId) -> Self {
        let mirror = Arc::new(Mutex::new(CharacterStateMirror::new()));
        let inbox = Arc::new(Inbox::default());
        let mut dispatcher = BatchDispatcher::new();

        let target = Arc::clone(&mirror);
        dispatcher.register(MessageType::CHARACTER_STATE_BATCH, move |_, payload| {
            let mut mirror = target
                .lock()
                .map_err(|_| anyhow::anyhow!("mirror lock poisoned"))?;
            mirror.apply_bytes(payload)?;
            Ok(())
        });

        let counters = Arc::clone(&inbox);
        dispatcher.register(CHAT, move |_, payload| {
            let message: ChatMessage = postcard::from_bytes(payload)?;
            debug!("[chat] {}: {}", message.from, message.text);
            counters.chat.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let counters = Arc::clone(&inbox);
        dispatcher.register(ABILITY_CAST, move |_, payload| {
            let cast: AbilityCast = postcard::from_bytes(payload)?;
            debug!(
                "[ability] {} cast {} on {:?}",
                cast.caster, cast.ability_id, cast.target
            );
            counters.abilities.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let counters = Arc::clone(&inbox);
        dispatcher.register(COMBAT_RESULT, move |_, payload| {
            let result: CombatResult = postcard::from_bytes(payload)?;
            debug!(
                "[combat] {} hit {} for {}{}",
                result.attacker,
                result.target,
                result.damage,
                if result.critical { " (critical)" } else { "" }
            );
            counters.combat.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let counters = Arc::clone(&inbox);
        let target = Arc::clone(&mirror);
        dispatcher.register(DESPAWN, move |_, payload| {
            let despawn: Despawn = postcard::from_bytes(payload)?;
            if let Ok(mut mirror) = target.lock() {
                mirror.remove(&despawn.entity);
            }
            counters.despawns.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        Self {
            connection,
            dispatcher,
            mirror,
            inbox,
        }
    }
}

/// Position agreement between the server snapshots and observer mirrors.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriftReport {
    pub entities: usize,
    pub max_drift: f32,
    pub avg_drift: f32,
}

/// Messages each observer received, summed over observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceivedCounts {
    pub chat: u64,
    pub abilities: u64,
    pub combat: u64,
    pub despawns: u64,
}

/// Messages the server queued, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentCounts {
    pub chat: u64,
    pub abilities: u64,
    pub combat: u64,
    pub despawns: u64,
}

pub struct Simulation {
    config: SimulationConfig,
    layer: BatchingLayer,
    transport: MemoryTransport,
    clock: ManualClock,
    rng: StdRng,
    characters: Vec<SimCharacter>,
    observers: Vec<Observer>,
    frame: u64,
    sent: SentCounts,
}

impl Simulation {
    pub fn new(batching: BatchingConfig, config: SimulationConfig) -> Result<Self> {
        let config = config.sanitized();
        let transport = MemoryTransport::new();
        let clock = ManualClock::new();
        let mut layer = BatchingLayer::configure(
            batching,
            Arc::new(transport.clone()),
            Arc::new(clock.clone()),
        );
        layer.start().context("Failed to start batching layer")?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let observers = (1..=config.observers as u64)
            .map(|id| Observer::new(ConnectionId(id)))
            .collect();
        let characters = (0..config.characters)
            .map(|i| SimCharacter {
                index: i,
                generation: 0,
                id: format!("char-{i}-0"),
                position: random_position(&mut rng),
                heading: rng.gen_range(0.0..std::f32::consts::TAU),
                observer: i % config.observers,
            })
            .collect();

        info!(
            "Simulating {} characters for {} observers at {} fps",
            config.characters, config.observers, config.fps
        );

        Ok(Self {
            config,
            layer,
            transport,
            clock,
            rng,
            characters,
            observers,
            frame: 0,
            sent: SentCounts::default(),
        })
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn fps(&self) -> u32 {
        self.config.fps
    }

    pub fn total_frames(&self) -> u64 {
        self.config.seconds * self.config.fps as u64
    }

    pub fn layer(&self) -> &BatchingLayer {
        &self.layer
    }

    pub fn sent_counts(&self) -> SentCounts {
        self.sent
    }

    /// Advance one frame: move characters, emit traffic, tick, deliver.
    ///
    /// Returns the characters that respawned this frame.
    pub fn step(&mut self) -> Result<Vec<String>> {
        let dt = 1.0 / self.config.fps as f32;
        self.clock.advance(Duration::from_secs_f32(dt));
        self.frame += 1;

        let mut respawned = Vec::new();
        for index in 0..self.characters.len() {
            if self.roll(self.config.respawn_per_second) {
                self.respawn(index)?;
                respawned.push(self.characters[index].id.clone());
            }
            self.walk(index, dt);
            let character = &self.characters[index];
            let destination = self.observers[character.observer].connection;
            self.layer.queue_character_state_update(
                &character.id,
                character.position,
                character.rotation(),
                destination,
            );
            self.emit_events(index)?;
        }

        self.layer.tick();
        self.deliver();
        Ok(respawned)
    }

    /// Flush everything still pending and deliver it.
    pub fn finish(&mut self) {
        self.layer.flush_all();
        self.deliver();
    }

    fn walk(&mut self, index: usize, dt: f32) {
        let turn = self.rng.gen_range(-1.5f32..1.5) * dt;
        let speed = self.config.walk_speed;
        let character = &mut self.characters[index];
        character.heading = (character.heading + turn).rem_euclid(std::f32::consts::TAU);
        let forward = character.rotation() * Vec3::NEG_Z;
        character.position += forward * speed * dt;
        if character.position.x.abs() > WORLD_HALF_EXTENT
            || character.position.z.abs() > WORLD_HALF_EXTENT
        {
            character.heading = (character.heading + std::f32::consts::PI)
                .rem_euclid(std::f32::consts::TAU);
            character.position = character
                .position
                .clamp(Vec3::splat(-WORLD_HALF_EXTENT), Vec3::splat(WORLD_HALF_EXTENT));
        }
    }

    /// Despawn a character and bring it back elsewhere under a new id.
    ///
    /// The despawn travels at Critical priority and may overtake state
    /// batches still queued for the old id, so ids are never reused.
    fn respawn(&mut self, index: usize) -> Result<()> {
        let position = random_position(&mut self.rng);
        let character = &mut self.characters[index];
        character.position = position;
        character.generation += 1;
        let id = std::mem::replace(
            &mut character.id,
            format!("char-{}-{}", character.index, character.generation),
        );
        let destination = self.observers[character.observer].connection;

        self.layer.clear_character_state(&id);
        self.layer.queue_message(
            destination,
            DeliveryMethod::ReliableOrdered,
            DESPAWN,
            &Despawn { entity: id },
            Priority::Critical,
        )?;
        self.sent.despawns += 1;
        Ok(())
    }

    fn emit_events(&mut self, index: usize) -> Result<()> {
        let character_id = self.characters[index].id.clone();
        let destination = self.observers[self.characters[index].observer].connection;

        if self.roll(self.config.combat_per_second) {
            let damage = self.rng.gen_range(1..250);
            let result = CombatResult {
                attacker: character_id.clone(),
                target: self.random_character(),
                damage,
                critical: damage > 200,
            };
            self.layer.queue_message(
                destination,
                DeliveryMethod::ReliableOrdered,
                COMBAT_RESULT,
                &result,
                Priority::Critical,
            )?;
            self.sent.combat += 1;
        }

        if self.roll(self.config.abilities_per_second) {
            let cast = AbilityCast {
                caster: character_id.clone(),
                ability_id: self.rng.gen_range(1..64),
                target: self
                    .rng
                    .gen_bool(0.5)
                    .then(|| self.characters[0].id.clone()),
            };
            self.layer.queue_message(
                destination,
                DeliveryMethod::ReliableOrdered,
                ABILITY_CAST,
                &cast,
                Priority::High,
            )?;
            self.sent.abilities += 1;
        }

        if self.roll(self.config.chat_per_second) {
            let chat = ChatMessage {
                from: character_id,
                text: format!("hello from frame {}", self.frame),
            };
            // Chat is broadcast to every observer.
            for observer in &self.observers {
                self.layer.queue_message(
                    observer.connection,
                    DeliveryMethod::ReliableUnordered,
                    CHAT,
                    &chat,
                    Priority::Low,
                )?;
                self.sent.chat += 1;
            }
        }
        Ok(())
    }

    fn deliver(&mut self) {
        for sent in self.transport.drain() {
            let Some(observer) = self
                .observers
                .iter_mut()
                .find(|o| o.connection == sent.destination)
            else {
                continue;
            };
            observer
                .dispatcher
                .handle_inbound(&sent.into_inbound(SERVER));
        }
    }

    fn roll(&mut self, per_second: f64) -> bool {
        let chance = (per_second / self.config.fps as f64).clamp(0.0, 1.0);
        self.rng.gen_bool(chance)
    }

    fn random_character(&mut self) -> String {
        let index = self.rng.gen_range(0..self.characters.len());
        self.characters[index].id.clone()
    }

    /// Dispatcher statistics of every observer.
    pub fn processing_stats(&self) -> Vec<BatchProcessingStats> {
        self.observers
            .iter()
            .map(|o| o.dispatcher.stats().clone())
            .collect()
    }

    /// Messages processed by all observers so far.
    pub fn messages_processed(&self) -> u64 {
        self.observers
            .iter()
            .map(|o| o.dispatcher.stats().messages_processed)
            .sum()
    }

    pub fn received_counts(&self) -> ReceivedCounts {
        self.observers
            .iter()
            .fold(ReceivedCounts::default(), |mut acc, o| {
                acc.chat += o.inbox.chat.load(Ordering::Relaxed);
                acc.abilities += o.inbox.abilities.load(Ordering::Relaxed);
                acc.combat += o.inbox.combat.load(Ordering::Relaxed);
                acc.despawns += o.inbox.despawns.load(Ordering::Relaxed);
                acc
            })
    }

    /// Compare each character's last sent snapshot with its observer's mirror.
    pub fn drift(&self) -> DriftReport {
        let states = self.layer.character_states();
        let mut report = DriftReport::default();
        let mut total = 0.0;
        for character in &self.characters {
            let Some(snapshot) = states.snapshot(&character.id) else {
                continue;
            };
            let observer = &self.observers[character.observer];
            let Ok(mirror) = observer.mirror.lock() else {
                continue;
            };
            let Some((mirrored, _)) = mirror.get(&character.id) else {
                continue;
            };
            let drift = mirrored.distance(snapshot.position);
            report.entities += 1;
            report.max_drift = report.max_drift.max(drift);
            total += drift;
        }
        if report.entities > 0 {
            report.avg_drift = total / report.entities as f32;
        }
        report
    }
}

fn random_position(rng: &mut StdRng) -> Vec3 {
    let extent = WORLD_HALF_EXTENT * 0.5;
    Vec3::new(
        rng.gen_range(-extent..extent),
        0.0,
        rng.gen_range(-extent..extent),
    )
}
