//! Lossless conversion between `rust_decimal::Decimal` and BSON Decimal128.
//!
//! Decimal128 uses the IEEE 754-2008 BID layout: sign bit, 14-bit biased
//! exponent (bias 6176), 113-bit coefficient.

use crate::error::{Error, Result};
use bson::Decimal128;
use rust_decimal::Decimal;

const EXPONENT_BIAS: i32 = 6176;
const COEFFICIENT_MASK: u128 = (1 << 113) - 1;
const MAX_SCALE: u32 = 28;

pub fn to_decimal128(value: &Decimal) -> Decimal128 {
    let mantissa = value.mantissa();
    let sign = u128::from(mantissa < 0);
    let coefficient = mantissa.unsigned_abs();
    let exponent = (EXPONENT_BIAS - value.scale() as i32) as u128;
    let bits = (sign << 127) | (exponent << 113) | coefficient;
    Decimal128::from_bytes(bits.to_le_bytes())
}

pub fn from_decimal128(value: &Decimal128) -> Result<Decimal> {
    let bits = u128::from_le_bytes(value.bytes());
    if (bits >> 125) & 0b11 == 0b11 {
        return Err(Error::decode("decimal", "non-finite or out-of-range Decimal128"));
    }
    let negative = bits >> 127 == 1;
    let exponent = ((bits >> 113) & 0x3FFF) as i32 - EXPONENT_BIAS;
    let mut coefficient = bits & COEFFICIENT_MASK;

    let scale = if exponent > 0 {
        for _ in 0..exponent {
            coefficient = coefficient
                .checked_mul(10)
                .ok_or_else(|| Error::decode("decimal", "Decimal128 exceeds decimal range"))?;
        }
        0
    } else {
        let mut scale = exponent.unsigned_abs();
        while scale > MAX_SCALE && coefficient % 10 == 0 {
            coefficient /= 10;
            scale -= 1;
        }
        if scale > MAX_SCALE {
            return Err(Error::decode("decimal", "Decimal128 scale exceeds 28 digits"));
        }
        scale
    };

    let magnitude = i128::try_from(coefficient)
        .map_err(|_| Error::decode("decimal", "Decimal128 exceeds decimal range"))?;
    let mantissa = if negative { -magnitude } else { magnitude };
    Decimal::try_from_i128_with_scale(mantissa, scale)
        .map_err(|e| Error::decode("decimal", e.to_string()))
}
