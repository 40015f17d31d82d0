//! Binary codec for Skirmish messages.
//!
//! A message is first written into an uncompressed *frame*:
//!
//! ```text
//! [kind:1][player_id:2][object_id:4][frame_time:8][payload:N]
//! ```
//!
//! All multi-byte integers are big-endian.  Bounded floating-point fields in
//! the payload are quantised (see [`super::quantize`]); everything else is
//! sent exactly.  The whole frame is then compressed with zstd, with the zstd
//! frame checksum enabled, so a corrupted datagram fails to decode instead of
//! producing a plausible but wrong message.
//!
//! A [`Payload::Batch`] payload is a `u16` count followed by complete nested
//! frames (uncompressed, without their own compression envelope).  Batches
//! never nest and never exceed [`MAX_BATCH_SIZE`] items.

use thiserror::Error;

use crate::domain::entity::{wrap_angle, Color, EntityKind, Kinematics, Pilot, Vec2};
use crate::domain::game_id::GameId;
use crate::protocol::messages::{
    Chat, GameState, Impact, Launch, MessageKind, MissileLaunch, MissileUpdate, NetMessage,
    NewPlane, Payload, PlaneUpdate, Score, SyncResponse, HEADER_SIZE, MAX_BATCH_SIZE,
    MAX_FRAME_SIZE,
};
use crate::protocol::quantize::{Quantizer, POSITION, ROTATION, TIME_OF_DAY, UNIT, VELOCITY};

/// zstd level used for every frame.  Frames are small; higher levels buy nothing.
const COMPRESSION_LEVEL: i32 = 3;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame ended before a field could be read.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The kind byte is not a recognised value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// A field could not be parsed (enum value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A batch holds more items than [`MAX_BATCH_SIZE`].
    #[error("batch of {count} messages exceeds the maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    /// A batch contains another batch.
    #[error("batches must not nest")]
    NestedBatch,

    /// Bytes remain after the message was fully decoded.
    #[error("{extra} trailing bytes after message")]
    TrailingBytes { extra: usize },

    /// The compressor failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// The datagram is not a valid zstd frame, its checksum does not match, or
    /// it expands beyond [`MAX_FRAME_SIZE`].
    #[error("decompression failed: {0}")]
    Decompression(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Reusable encoder/decoder holding zstd contexts.
///
/// Owned by whichever thread performs I/O; creating zstd contexts is not free,
/// so the peer host keeps one for its lifetime.
pub struct WireCodec {
    compressor: zstd::bulk::Compressor<'static>,
    decompressor: zstd::bulk::Decompressor<'static>,
}

impl WireCodec {
    /// # Errors
    ///
    /// Returns [`ProtocolError::Compression`] if zstd cannot allocate its contexts.
    pub fn new() -> Result<Self, ProtocolError> {
        let mut compressor = zstd::bulk::Compressor::new(COMPRESSION_LEVEL)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        compressor
            .include_checksum(true)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;
        let decompressor = zstd::bulk::Decompressor::new()
            .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
        Ok(Self {
            compressor,
            decompressor,
        })
    }

    /// Encodes `msg` into a compressed datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if a batch is invalid or compression fails.
    pub fn encode(&mut self, msg: &NetMessage) -> Result<Vec<u8>, ProtocolError> {
        let frame = encode_frame(msg)?;
        self.compressor
            .compress(&frame)
            .map_err(|e| ProtocolError::Compression(e.to_string()))
    }

    /// Decodes one compressed datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the datagram is corrupt or malformed.  The
    /// caller should drop the datagram; the connection stays up.
    pub fn decode(&mut self, datagram: &[u8]) -> Result<NetMessage, ProtocolError> {
        let frame = self
            .decompressor
            .decompress(datagram, MAX_FRAME_SIZE)
            .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
        decode_frame(&frame)
    }
}

/// One-shot compressed encode.  Prefer a long-lived [`WireCodec`] on hot paths.
///
/// # Errors
///
/// See [`WireCodec::encode`].
///
/// # Examples
///
/// ```rust
/// use skirmish_core::protocol::{decode_message, encode_message};
/// use skirmish_core::protocol::messages::{NetMessage, Payload};
/// use skirmish_core::GameId;
///
/// let msg = NetMessage::new(GameId::player(2), 12.5, Payload::SyncRequest { t0: 12.5 });
/// let bytes = encode_message(&msg).unwrap();
/// assert_eq!(decode_message(&bytes).unwrap(), msg);
/// ```
pub fn encode_message(msg: &NetMessage) -> Result<Vec<u8>, ProtocolError> {
    WireCodec::new()?.encode(msg)
}

/// One-shot compressed decode.
///
/// # Errors
///
/// See [`WireCodec::decode`].
pub fn decode_message(datagram: &[u8]) -> Result<NetMessage, ProtocolError> {
    WireCodec::new()?.decode(datagram)
}

/// Encodes `msg` into an uncompressed frame.
///
/// # Errors
///
/// Returns [`ProtocolError::BatchTooLarge`] or [`ProtocolError::NestedBatch`]
/// for invalid batches.
pub fn encode_frame(msg: &NetMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + 32);
    write_message(&mut buf, msg, false)?;
    Ok(buf)
}

/// Decodes an uncompressed frame, rejecting trailing bytes.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the frame is malformed.
pub fn decode_frame(frame: &[u8]) -> Result<NetMessage, ProtocolError> {
    let mut reader = Reader::new(frame);
    let msg = read_message(&mut reader, false)?;
    match reader.remaining() {
        0 => Ok(msg),
        extra => Err(ProtocolError::TrailingBytes { extra }),
    }
}

// ── Frame encoding ────────────────────────────────────────────────────────────

fn write_message(buf: &mut Vec<u8>, msg: &NetMessage, nested: bool) -> Result<(), ProtocolError> {
    buf.push(msg.kind() as u8);
    write_game_id(buf, &msg.id);
    buf.extend_from_slice(&msg.frame_time.to_be_bytes());

    match &msg.payload {
        Payload::AssignId { player_id } => buf.extend_from_slice(&player_id.to_be_bytes()),
        Payload::SyncRequest { t0 } => buf.extend_from_slice(&t0.to_be_bytes()),
        Payload::SyncResponse(m) => encode_sync_response(buf, m),
        Payload::ResyncRequest
        | Payload::PlayerDisconnect
        | Payload::PlayerReset
        | Payload::EntityRetired => {} // empty payload
        Payload::GameState(m) => encode_game_state(buf, m),
        Payload::Kick { reason } => write_length_prefixed_string(buf, reason),
        Payload::Chat(m) => encode_chat(buf, m),
        Payload::Score(m) => encode_score(buf, m),
        Payload::NewPlane(m) => encode_new_plane(buf, m),
        Payload::NewBullet(m) | Payload::NewDecoy(m) => encode_launch(buf, m),
        Payload::NewMissile(m) => encode_missile_launch(buf, m),
        Payload::PlaneUpdate(m) => encode_plane_update(buf, m),
        Payload::MissileUpdate(m) => encode_missile_update(buf, m),
        Payload::Impact(m) => encode_impact(buf, m),
        Payload::Batch(items) => {
            if nested {
                return Err(ProtocolError::NestedBatch);
            }
            if items.len() > MAX_BATCH_SIZE {
                return Err(ProtocolError::BatchTooLarge {
                    count: items.len(),
                    max: MAX_BATCH_SIZE,
                });
            }
            buf.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for item in items {
                write_message(buf, item, true)?;
            }
        }
    }
    Ok(())
}

fn encode_sync_response(buf: &mut Vec<u8>, m: &SyncResponse) {
    buf.extend_from_slice(&m.t0.to_be_bytes());
    buf.extend_from_slice(&m.t1.to_be_bytes());
    buf.extend_from_slice(&m.t2.to_be_bytes());
}

fn encode_game_state(buf: &mut Vec<u8>, m: &GameState) {
    TIME_OF_DAY.write(buf, m.time_of_day);
    buf.push(u8::from(m.paused));
    buf.extend_from_slice(&m.speed.to_be_bytes());
}

fn encode_chat(buf: &mut Vec<u8>, m: &Chat) {
    write_length_prefixed_string(buf, &m.sender);
    write_length_prefixed_string(buf, &m.text);
}

fn encode_score(buf: &mut Vec<u8>, m: &Score) {
    buf.extend_from_slice(&m.kills.to_be_bytes());
    buf.extend_from_slice(&m.deaths.to_be_bytes());
    buf.extend_from_slice(&m.points.to_be_bytes());
}

fn encode_new_plane(buf: &mut Vec<u8>, m: &NewPlane) {
    write_length_prefixed_string(buf, &m.pilot.name);
    buf.push(m.pilot.team);
    buf.push(u8::from(m.pilot.is_ai));
    UNIT.write(buf, m.pilot.color.r);
    UNIT.write(buf, m.pilot.color.g);
    UNIT.write(buf, m.pilot.color.b);
    write_kinematics(buf, &m.kinematics);
    buf.extend_from_slice(&m.health.to_be_bytes());
}

fn encode_launch(buf: &mut Vec<u8>, m: &Launch) {
    write_game_id(buf, &m.owner);
    write_kinematics(buf, &m.kinematics);
}

fn encode_missile_launch(buf: &mut Vec<u8>, m: &MissileLaunch) {
    write_game_id(buf, &m.owner);
    write_optional_game_id(buf, m.target.as_ref());
    write_kinematics(buf, &m.kinematics);
}

fn encode_plane_update(buf: &mut Vec<u8>, m: &PlaneUpdate) {
    write_kinematics(buf, &m.kinematics);
    UNIT.write(buf, m.throttle);
    buf.extend_from_slice(&m.health.to_be_bytes());
}

fn encode_missile_update(buf: &mut Vec<u8>, m: &MissileUpdate) {
    write_kinematics(buf, &m.kinematics);
    write_optional_game_id(buf, m.target.as_ref());
}

fn encode_impact(buf: &mut Vec<u8>, m: &Impact) {
    write_game_id(buf, &m.target);
    buf.push(m.weapon as u8);
    buf.extend_from_slice(&m.damage.to_be_bytes());
    write_kinematics(buf, &m.hit);
    buf.extend_from_slice(&m.sequence.to_be_bytes());
    buf.extend_from_slice(&m.reporter.to_be_bytes());
}

// ── Frame decoding ────────────────────────────────────────────────────────────

fn read_message(r: &mut Reader<'_>, nested: bool) -> Result<NetMessage, ProtocolError> {
    let kind_byte = r.u8()?;
    let kind =
        MessageKind::try_from(kind_byte).map_err(|_| ProtocolError::UnknownMessageType(kind_byte))?;
    let id = r.game_id()?;
    let frame_time = r.f64()?;

    let payload = match kind {
        MessageKind::AssignId => Payload::AssignId { player_id: r.i16()? },
        MessageKind::SyncRequest => Payload::SyncRequest { t0: r.f64()? },
        MessageKind::SyncResponse => Payload::SyncResponse(SyncResponse {
            t0: r.f64()?,
            t1: r.f64()?,
            t2: r.f64()?,
        }),
        MessageKind::ResyncRequest => Payload::ResyncRequest,
        MessageKind::GameState => Payload::GameState(GameState {
            time_of_day: r.quantized(&TIME_OF_DAY)?,
            paused: r.bool("GameState.paused")?,
            speed: r.f32()?,
        }),
        MessageKind::PlayerDisconnect => Payload::PlayerDisconnect,
        MessageKind::PlayerReset => Payload::PlayerReset,
        MessageKind::Kick => Payload::Kick { reason: r.string()? },
        MessageKind::Chat => Payload::Chat(Chat {
            sender: r.string()?,
            text: r.string()?,
        }),
        MessageKind::Score => Payload::Score(Score {
            kills: r.u16()?,
            deaths: r.u16()?,
            points: r.i32()?,
        }),
        MessageKind::EntityRetired => Payload::EntityRetired,
        MessageKind::NewPlane => Payload::NewPlane(decode_new_plane(r)?),
        MessageKind::NewBullet => Payload::NewBullet(decode_launch(r)?),
        MessageKind::NewMissile => Payload::NewMissile(MissileLaunch {
            owner: r.game_id()?,
            target: r.optional_game_id()?,
            kinematics: r.kinematics()?,
        }),
        MessageKind::NewDecoy => Payload::NewDecoy(decode_launch(r)?),
        MessageKind::PlaneUpdate => Payload::PlaneUpdate(PlaneUpdate {
            kinematics: r.kinematics()?,
            throttle: r.quantized(&UNIT)?,
            health: r.f32()?,
        }),
        MessageKind::MissileUpdate => Payload::MissileUpdate(MissileUpdate {
            kinematics: r.kinematics()?,
            target: r.optional_game_id()?,
        }),
        MessageKind::Impact => Payload::Impact(decode_impact(r)?),
        MessageKind::Batch => {
            if nested {
                return Err(ProtocolError::NestedBatch);
            }
            let count = r.u16()? as usize;
            if count > MAX_BATCH_SIZE {
                return Err(ProtocolError::BatchTooLarge {
                    count,
                    max: MAX_BATCH_SIZE,
                });
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_message(r, true)?);
            }
            Payload::Batch(items)
        }
    };

    Ok(NetMessage {
        id,
        frame_time,
        payload,
    })
}

fn decode_new_plane(r: &mut Reader<'_>) -> Result<NewPlane, ProtocolError> {
    let name = r.string()?;
    let team = r.u8()?;
    let is_ai = r.bool("NewPlane.is_ai")?;
    let color = Color::new(r.quantized(&UNIT)?, r.quantized(&UNIT)?, r.quantized(&UNIT)?);
    Ok(NewPlane {
        pilot: Pilot {
            name,
            team,
            is_ai,
            color,
        },
        kinematics: r.kinematics()?,
        health: r.f32()?,
    })
}

fn decode_launch(r: &mut Reader<'_>) -> Result<Launch, ProtocolError> {
    Ok(Launch {
        owner: r.game_id()?,
        kinematics: r.kinematics()?,
    })
}

fn decode_impact(r: &mut Reader<'_>) -> Result<Impact, ProtocolError> {
    let target = r.game_id()?;
    let weapon_byte = r.u8()?;
    let weapon = EntityKind::try_from(weapon_byte).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown weapon kind: {weapon_byte}"))
    })?;
    Ok(Impact {
        target,
        weapon,
        damage: r.f32()?,
        hit: r.kinematics()?,
        sequence: r.u32()?,
        reporter: r.i16()?,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn write_game_id(buf: &mut Vec<u8>, id: &GameId) {
    buf.extend_from_slice(&id.player_id.to_be_bytes());
    buf.extend_from_slice(&id.object_id.to_be_bytes());
}

fn write_optional_game_id(buf: &mut Vec<u8>, id: Option<&GameId>) {
    match id {
        Some(id) => {
            buf.push(0x01);
            write_game_id(buf, id);
        }
        None => buf.push(0x00),
    }
}

fn write_kinematics(buf: &mut Vec<u8>, k: &Kinematics) {
    POSITION.write(buf, k.position.x);
    POSITION.write(buf, k.position.y);
    VELOCITY.write(buf, k.velocity.x);
    VELOCITY.write(buf, k.velocity.y);
    ROTATION.write(buf, wrap_angle(k.rotation));
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes, cut at a
/// character boundary if longer than `u16::MAX` bytes.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

/// Forward-only cursor over a frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if self.buf.len() < end {
            return Err(ProtocolError::InsufficientData {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self, context: &str) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(ProtocolError::MalformedPayload(format!(
                "{context}: invalid boolean byte {other}"
            ))),
        }
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    fn quantized(&mut self, q: &Quantizer) -> Result<f32, ProtocolError> {
        let (value, used) = q.read(self.buf, self.pos)?;
        self.pos += used;
        Ok(value)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }

    fn game_id(&mut self) -> Result<GameId, ProtocolError> {
        Ok(GameId::new(self.i16()?, self.u32()?))
    }

    fn optional_game_id(&mut self) -> Result<Option<GameId>, ProtocolError> {
        if self.bool("optional id flag")? {
            Ok(Some(self.game_id()?))
        } else {
            Ok(None)
        }
    }

    fn kinematics(&mut self) -> Result<Kinematics, ProtocolError> {
        Ok(Kinematics {
            position: Vec2::new(self.quantized(&POSITION)?, self.quantized(&POSITION)?),
            velocity: Vec2::new(self.quantized(&VELOCITY)?, self.quantized(&VELOCITY)?),
            rotation: self.quantized(&ROTATION)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
