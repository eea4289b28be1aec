use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two-component float vector, 8 bytes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub(crate) fn bits(&self) -> [u32; 2] {
        [self.x.to_bits(), self.y.to_bits()]
    }
}

/// Three-component float vector, 12 bytes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub(crate) fn bits(&self) -> [u32; 3] {
        [self.x.to_bits(), self.y.to_bits(), self.z.to_bits()]
    }
}

/// 128-bit decimal: a 96-bit unsigned mantissa, a sign and a power-of-ten
/// scale in `0..=28`. The value is `(-1)^negative * mantissa / 10^scale`.
///
/// Equality is structural: `1.0` and `1.00` are different values because
/// they encode differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    mantissa: u128,
    scale: u8,
    negative: bool,
}

impl Decimal {
    pub const MAX_SCALE: u8 = 28;
    pub const MAX_MANTISSA: u128 = (1u128 << 96) - 1;

    pub const ZERO: Decimal = Decimal {
        mantissa: 0,
        scale: 0,
        negative: false,
    };

    pub fn try_new(mantissa: u128, scale: u8, negative: bool) -> Result<Self> {
        if mantissa > Self::MAX_MANTISSA {
            return Err(NetError::InvalidValue(format!(
                "decimal mantissa {} exceeds 96 bits",
                mantissa
            )));
        }
        if scale > Self::MAX_SCALE {
            return Err(NetError::InvalidValue(format!(
                "decimal scale {} exceeds {}",
                scale,
                Self::MAX_SCALE
            )));
        }
        Ok(Self {
            mantissa,
            scale,
            negative,
        })
    }

    /// Builds a decimal from a signed integer mantissa, e.g. `from_i64(1250, 2)` is `12.50`.
    pub fn from_i64(mantissa: i64, scale: u8) -> Result<Self> {
        Self::try_new(mantissa.unsigned_abs() as u128, scale, mantissa < 0)
    }

    pub fn mantissa(&self) -> u128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn to_f64(&self) -> f64 {
        let magnitude = self.mantissa as f64 / 10f64.powi(self.scale as i32);
        if self.negative {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Splits into the four little-endian words of the wire layout:
    /// `lo`, `mid`, `hi` mantissa words then the flags word
    /// (scale in bits 16..24, sign in bit 31).
    pub(crate) fn to_words(self) -> [u32; 4] {
        let flags = ((self.scale as u32) << 16) | if self.negative { 1 << 31 } else { 0 };
        [
            self.mantissa as u32,
            (self.mantissa >> 32) as u32,
            (self.mantissa >> 64) as u32,
            flags,
        ]
    }

    pub(crate) fn from_words(words: [u32; 4]) -> Result<Self> {
        let [lo, mid, hi, flags] = words;
        if flags & 0x7F00_FFFF != 0 {
            return Err(NetError::InvalidMessage(format!(
                "decimal flags {:#010x} have reserved bits set",
                flags
            )));
        }
        let scale = ((flags >> 16) & 0xFF) as u8;
        let mantissa = (lo as u128) | ((mid as u128) << 32) | ((hi as u128) << 64);
        Self::try_new(mantissa, scale, flags & (1 << 31) != 0)
            .map_err(|e| NetError::InvalidMessage(e.to_string()))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.to_string();
        let scale = self.scale as usize;
        let sign = if self.negative { "-" } else { "" };

        if scale == 0 {
            return write!(f, "{}{}", sign, digits);
        }

        let padded = format!("{:0>width$}", digits, width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}
