//! CiA-402 factor group
//!
//! Drives scale positions, velocities and accelerations between user units and their internal
//! increments with numerator/divisor pairs (0x608F to 0x6097). The polarity object (0x607E)
//! inverts position and velocity values.

use canmaster_common::{constants::object_ids, sdo::AbortCode};
use snafu::ResultExt;

use super::{Cia402Error, Result, SdoSnafu};
use crate::sdo_client::{RawAbortCode, SdoClient, SdoClientError};

/// A scaling factor: internal = user * numerator / divisor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalingFactor {
    /// Sub 1 of the factor object
    pub numerator: u32,
    /// Sub 2 of the factor object
    pub divisor: u32,
}

impl Default for ScalingFactor {
    fn default() -> Self {
        Self::UNITY
    }
}

impl ScalingFactor {
    /// The factor 1/1
    pub const UNITY: Self = Self {
        numerator: 1,
        divisor: 1,
    };

    /// Create a factor
    pub const fn new(numerator: u32, divisor: u32) -> Self {
        Self { numerator, divisor }
    }

    /// Convert a user value to internal units
    pub fn to_internal(&self, user: f64) -> f64 {
        user * self.numerator as f64 / self.divisor as f64
    }

    /// Convert an internal value to user units
    pub fn to_user(&self, internal: f64) -> f64 {
        internal * self.divisor as f64 / self.numerator as f64
    }
}

/// Polarity flags of object 0x607E
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Polarity {
    /// Bit 7
    pub position_inverted: bool,
    /// Bit 6
    pub velocity_inverted: bool,
}

impl Polarity {
    const POSITION_BIT: u8 = 1 << 7;
    const VELOCITY_BIT: u8 = 1 << 6;

    /// Decode the object value; other bits are ignored
    pub fn from_bits(bits: u8) -> Self {
        Self {
            position_inverted: bits & Self::POSITION_BIT != 0,
            velocity_inverted: bits & Self::VELOCITY_BIT != 0,
        }
    }

    /// Encode as the object value
    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.position_inverted {
            bits |= Self::POSITION_BIT;
        }
        if self.velocity_inverted {
            bits |= Self::VELOCITY_BIT;
        }
        bits
    }
}

fn sign(inverted: bool) -> f64 {
    if inverted {
        -1.0
    } else {
        1.0
    }
}

/// The factor group of a drive
///
/// Objects the drive does not implement are taken as unity.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Factors {
    /// 0x608F
    pub position_encoder_resolution: ScalingFactor,
    /// 0x6090
    pub velocity_encoder_resolution: ScalingFactor,
    /// 0x6091
    pub gear_ratio: ScalingFactor,
    /// 0x6092
    pub feed: ScalingFactor,
    /// 0x6093, scales position values such as 0x6064 and 0x607A
    pub position: ScalingFactor,
    /// 0x6094, scales velocity values such as 0x606C and 0x60FF
    pub velocity_encoder: ScalingFactor,
    /// 0x6095
    pub velocity1: ScalingFactor,
    /// 0x6096
    pub velocity2: ScalingFactor,
    /// 0x6097, scales acceleration values such as 0x6083 and 0x6084
    pub acceleration: ScalingFactor,
    /// 0x607E
    pub polarity: Polarity,
}

/// Factor objects, in the order of [`Factors::scaling`]
const FACTOR_OBJECTS: [u16; 9] = [
    object_ids::POSITION_ENCODER_RESOLUTION,
    object_ids::VELOCITY_ENCODER_RESOLUTION,
    object_ids::GEAR_RATIO,
    object_ids::FEED_CONSTANT,
    object_ids::POSITION_FACTOR,
    object_ids::VELOCITY_ENCODER_FACTOR,
    object_ids::VELOCITY_FACTOR_1,
    object_ids::VELOCITY_FACTOR_2,
    object_ids::ACCELERATION_FACTOR,
];

impl Factors {
    fn scaling(&self) -> [ScalingFactor; 9] {
        [
            self.position_encoder_resolution,
            self.velocity_encoder_resolution,
            self.gear_ratio,
            self.feed,
            self.position,
            self.velocity_encoder,
            self.velocity1,
            self.velocity2,
            self.acceleration,
        ]
    }

    fn scaling_mut(&mut self) -> [&mut ScalingFactor; 9] {
        [
            &mut self.position_encoder_resolution,
            &mut self.velocity_encoder_resolution,
            &mut self.gear_ratio,
            &mut self.feed,
            &mut self.position,
            &mut self.velocity_encoder,
            &mut self.velocity1,
            &mut self.velocity2,
            &mut self.acceleration,
        ]
    }

    /// Read the factor group from the drive
    ///
    /// Fails with [`Cia402Error::InvalidFactor`] if the drive reports a zero numerator or
    /// divisor.
    pub async fn read(sdo: &SdoClient) -> Result<Self> {
        let mut factors = Self::default();
        for (index, slot) in FACTOR_OBJECTS.into_iter().zip(factors.scaling_mut()) {
            if let Some(factor) = read_factor(sdo, index).await? {
                *slot = factor;
            }
        }
        factors.polarity = match sdo.read_u8(object_ids::POLARITY, 0).await {
            Ok(bits) => Polarity::from_bits(bits),
            Err(e) if is_missing(&e) => Polarity::default(),
            Err(e) => return Err(e).context(SdoSnafu),
        };
        Ok(factors)
    }

    /// Write the factor group to the drive
    ///
    /// Unity factors and a default polarity are skipped when the drive lacks the object.
    pub async fn write(&self, sdo: &SdoClient) -> Result<()> {
        for (index, factor) in FACTOR_OBJECTS.into_iter().zip(self.scaling()) {
            if factor.numerator == 0 || factor.divisor == 0 {
                return Err(Cia402Error::InvalidFactor { index });
            }
            match sdo.write_u32(index, 1, factor.numerator).await {
                Ok(()) => {}
                Err(e) if is_missing(&e) && factor == ScalingFactor::UNITY => continue,
                Err(e) => return Err(e).context(SdoSnafu),
            }
            sdo.write_u32(index, 2, factor.divisor)
                .await
                .context(SdoSnafu)?;
        }
        let polarity = self.polarity.bits();
        match sdo.write_u8(object_ids::POLARITY, 0, polarity).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) && polarity == 0 => Ok(()),
            Err(e) => Err(e).context(SdoSnafu),
        }
    }

    /// Convert a position in user units to internal increments
    pub fn position_to_internal(&self, user: f64) -> i32 {
        round_i32(sign(self.polarity.position_inverted) * self.position.to_internal(user))
    }

    /// Convert a position in internal increments to user units
    pub fn position_to_user(&self, internal: i32) -> f64 {
        sign(self.polarity.position_inverted) * self.position.to_user(internal as f64)
    }

    /// Convert a velocity in user units to internal units
    pub fn velocity_to_internal(&self, user: f64) -> i32 {
        round_i32(sign(self.polarity.velocity_inverted) * self.velocity_encoder.to_internal(user))
    }

    /// Convert a velocity in internal units to user units
    pub fn velocity_to_user(&self, internal: i32) -> f64 {
        sign(self.polarity.velocity_inverted) * self.velocity_encoder.to_user(internal as f64)
    }

    /// Convert an acceleration in user units to internal units
    pub fn acceleration_to_internal(&self, user: f64) -> u32 {
        // Float to int casts saturate
        self.acceleration.to_internal(user).round() as u32
    }

    /// Convert an acceleration in internal units to user units
    pub fn acceleration_to_user(&self, internal: u32) -> f64 {
        self.acceleration.to_user(internal as f64)
    }
}

fn round_i32(value: f64) -> i32 {
    value.round() as i32
}

/// True when the drive does not implement the object
fn is_missing(e: &SdoClientError) -> bool {
    matches!(
        e,
        SdoClientError::ServerAbort {
            abort_code: RawAbortCode::Valid(AbortCode::NoSuchObject | AbortCode::NoSuchSubIndex),
            ..
        }
    )
}

async fn read_factor(sdo: &SdoClient, index: u16) -> Result<Option<ScalingFactor>> {
    let numerator = match sdo.read_u32(index, 1).await {
        Ok(n) => n,
        Err(e) if is_missing(&e) => return Ok(None),
        Err(e) => return Err(e).context(SdoSnafu),
    };
    let divisor = sdo.read_u32(index, 2).await.context(SdoSnafu)?;
    if numerator == 0 || divisor == 0 {
        return Err(Cia402Error::InvalidFactor { index });
    }
    Ok(Some(ScalingFactor::new(numerator, divisor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_factor_converts_both_ways() {
        let f = ScalingFactor::new(4096, 360);
        assert_eq!(4096.0, f.to_internal(360.0));
        assert_eq!(90.0, f.to_user(1024.0));
        assert_eq!(12.5, ScalingFactor::UNITY.to_user(12.5));
    }

    #[test]
    fn polarity_bits() {
        let p = Polarity::from_bits(0xC1);
        assert!(p.position_inverted);
        assert!(p.velocity_inverted);
        assert_eq!(0xC0, p.bits());
        assert_eq!(
            Polarity {
                position_inverted: false,
                velocity_inverted: true
            },
            Polarity::from_bits(0x40)
        );
        assert_eq!(0, Polarity::default().bits());
    }

    #[test]
    fn position_and_velocity_follow_polarity() {
        let factors = Factors {
            position: ScalingFactor::new(1000, 1),
            velocity_encoder: ScalingFactor::new(10, 1),
            polarity: Polarity::from_bits(0x80),
            ..Default::default()
        };
        assert_eq!(-1500, factors.position_to_internal(1.5));
        assert_eq!(-1.5, factors.position_to_user(1500));
        // Velocity is not inverted by bit 7
        assert_eq!(25, factors.velocity_to_internal(2.5));
        assert_eq!(2.5, factors.velocity_to_user(25));
    }

    #[test]
    fn conversions_round_and_saturate() {
        let factors = Factors {
            position: ScalingFactor::new(1, 3),
            acceleration: ScalingFactor::new(u32::MAX, 1),
            ..Default::default()
        };
        assert_eq!(3, factors.position_to_internal(10.0));
        assert_eq!(i32::MAX, factors.position_to_internal(1e12));
        assert_eq!(i32::MIN, factors.position_to_internal(-1e12));
        assert_eq!(u32::MAX, factors.acceleration_to_internal(2.0));
        assert_eq!(0, factors.acceleration_to_internal(-2.0));
    }
}
