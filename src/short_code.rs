use rand::Rng;
use rearch::CapsuleHandle;
use thiserror::Error;

use crate::config::settings_capsule;

pub const DEFAULT_SHORT_CODE_LENGTH: usize = 6;

/// Longest code whose whole space (`62^len`) still fits in a `u64`.
pub const MAX_SHORT_CODE_LENGTH: usize = 10;

/// # Panics
/// Panics when `SHORT_CODE_LENGTH` is outside `1..=MAX_SHORT_CODE_LENGTH`.
#[must_use]
pub fn short_code_generator_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> ShortCodeGenerator {
    let length = get.as_ref(settings_capsule).short_code_length;
    ShortCodeGenerator::new(length).unwrap_or_else(|err| panic!("{err}"))
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("short code length must be within 1..={MAX_SHORT_CODE_LENGTH}, got {0}")]
pub struct InvalidShortCodeLength(pub usize);

/// Produces random, fixed-length alphanumeric codes.
///
/// Each call is independent and draws uniformly from the 62-symbol alphabet.
/// Collision avoidance is the caller's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShortCodeGenerator {
    length: usize,
    space: u64,
}

impl ShortCodeGenerator {
    /// # Errors
    /// Will return [`Err`] if `length` is zero or too long to be drawn from a `u64`.
    pub fn new(length: usize) -> Result<Self, InvalidShortCodeLength> {
        if !(1..=MAX_SHORT_CODE_LENGTH).contains(&length) {
            return Err(InvalidShortCodeLength(length));
        }
        let exponent = u32::try_from(length).map_err(|_| InvalidShortCodeLength(length))?;
        Ok(Self {
            length,
            space: 62_u64.pow(exponent),
        })
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn generate(&self) -> String {
        // NOTE: rejection sampling keeps every value in [0, space) equally likely,
        // so every base62 digit of the zero-padded rendering is uniform too
        let zone = u64::MAX - (u64::MAX % self.space);
        let mut buf = [0; 8];
        let value = loop {
            rand::rng().fill_bytes(&mut buf);
            let candidate = u64::from_le_bytes(buf);
            if candidate < zone {
                break candidate % self.space;
            }
        };

        let encoded = base62::encode(value);
        format!("{encoded:0>width$}", width = self.length)
    }
}

impl Default for ShortCodeGenerator {
    fn default() -> Self {
        Self {
            length: DEFAULT_SHORT_CODE_LENGTH,
            space: 62_u64.pow(6),
        }
    }
}
