//! Fixed-point quantisation of bounded floating-point fields.
//!
//! # Why quantise? (for beginners)
//!
//! A position stored as two `f32`s costs 8 bytes, but the world is only a
//! couple of hundred thousand units wide and nobody can see a difference of a
//! hundredth of a unit.  Mapping each coordinate onto a 24-bit integer grid
//! spanning the world saves a quarter of the bytes and loses at most half a
//! grid step of precision.
//!
//! A [`Quantizer`] describes one such grid: a closed range `[min, max]`
//! divided into `2^bits - 1` steps.  Values outside the range are clamped
//! before encoding.  The round-trip error of an in-range value is bounded by
//! [`Quantizer::max_error`].
//!
//! Only fields that tolerate precision loss are quantised: positions,
//! velocities, angles, unit values (throttle, colour channels) and the time of
//! day.  Identifiers, counts, damage, health and timestamps are sent exactly.

use std::f32::consts::PI;

use super::codec::ProtocolError;

/// A linear mapping between `[min, max]` and the integers `0..=2^bits - 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    min: f32,
    max: f32,
    bits: u8,
}

/// Half-width of the square world, in world units.
pub const WORLD_EXTENT: f32 = 65_536.0;

/// Largest speed the wire can carry on either axis.
pub const MAX_SPEED: f32 = 1_024.0;

pub const POSITION: Quantizer = Quantizer::new(-WORLD_EXTENT, WORLD_EXTENT, 24);
pub const VELOCITY: Quantizer = Quantizer::new(-MAX_SPEED, MAX_SPEED, 16);
pub const ROTATION: Quantizer = Quantizer::new(-PI, PI, 16);
pub const UNIT: Quantizer = Quantizer::new(0.0, 1.0, 8);
pub const TIME_OF_DAY: Quantizer = Quantizer::new(0.0, 24.0, 16);

impl Quantizer {
    /// `bits` must be 8, 16 or 24.
    pub const fn new(min: f32, max: f32, bits: u8) -> Self {
        Self { min, max, bits }
    }

    /// Number of bytes one quantised value occupies on the wire.
    pub const fn width(&self) -> usize {
        (self.bits / 8) as usize
    }

    fn steps(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    fn span(&self) -> f64 {
        f64::from(self.max) - f64::from(self.min)
    }

    /// Worst-case absolute error of a round trip for an in-range value.
    pub fn max_error(&self) -> f32 {
        (self.max - self.min) / self.steps() as f32 / 2.0
    }

    pub fn quantize(&self, value: f32) -> u32 {
        let clamped = if value.is_nan() {
            self.min
        } else {
            value.clamp(self.min, self.max)
        };
        // f64 keeps the 24-bit grid exact; f32 has only 24 mantissa bits.
        let normalized = (f64::from(clamped) - f64::from(self.min)) / self.span();
        ((normalized * f64::from(self.steps())).round() as u32).min(self.steps())
    }

    pub fn dequantize(&self, quantized: u32) -> f32 {
        let normalized = f64::from(quantized.min(self.steps())) / f64::from(self.steps());
        (f64::from(self.min) + normalized * self.span()) as f32
    }

    /// Appends the quantised value big-endian in [`width`](Self::width) bytes.
    pub fn write(&self, buf: &mut Vec<u8>, value: f32) {
        let q = self.quantize(value).to_be_bytes();
        buf.extend_from_slice(&q[4 - self.width()..]);
    }

    /// Reads one value at `offset`, returning it and the bytes consumed.
    pub fn read(&self, buf: &[u8], offset: usize) -> Result<(f32, usize), ProtocolError> {
        let width = self.width();
        let end = offset + width;
        if buf.len() < end {
            return Err(ProtocolError::InsufficientData {
                needed: end,
                available: buf.len(),
            });
        }
        let mut be = [0u8; 4];
        be[4 - width..].copy_from_slice(&buf[offset..end]);
        Ok((self.dequantize(u32::from_be_bytes(be)), width))
    }
}
