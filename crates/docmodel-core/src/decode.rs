//! Typed extraction from driver-native documents.

use crate::decimal;
use crate::error::{Error, Result};
use crate::value::{Pattern, SecretString};
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Bson, Document};
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use std::net::IpAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Short description of a BSON value for error messages.
pub fn describe(value: &Bson) -> String {
    format!("{:?}", value.element_type())
}

/// Conversion from a stored BSON value.
pub trait FromBson: Sized {
    fn from_bson(value: &Bson) -> Result<Self>;

    /// Value used when the key is absent. Only optional types have one.
    fn missing() -> Option<Self> {
        None
    }
}

impl FromBson for Bson {
    fn from_bson(value: &Bson) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromBson for Document {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Document(d) => Ok(d.clone()),
            other => Err(Error::decode("document", describe(other))),
        }
    }
}

impl FromBson for bool {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Boolean(b) => Ok(*b),
            other => Err(Error::decode("bool", describe(other))),
        }
    }
}

impl FromBson for i32 {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Int32(v) => Ok(*v),
            Bson::Int64(v) => i32::try_from(*v).map_err(|_| Error::decode("i32", v.to_string())),
            other => Err(Error::decode("i32", describe(other))),
        }
    }
}

impl FromBson for i64 {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Int32(v) => Ok(i64::from(*v)),
            Bson::Int64(v) => Ok(*v),
            other => Err(Error::decode("i64", describe(other))),
        }
    }
}

impl FromBson for f64 {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Double(v) => Ok(*v),
            Bson::Int32(v) => Ok(f64::from(*v)),
            Bson::Int64(v) => Ok(*v as f64),
            other => Err(Error::decode("f64", describe(other))),
        }
    }
}

impl FromBson for String {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::String(s) => Ok(s.clone()),
            other => Err(Error::decode("string", describe(other))),
        }
    }
}

impl FromBson for ObjectId {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::ObjectId(oid) => Ok(*oid),
            other => Err(Error::decode("object id", describe(other))),
        }
    }
}

impl FromBson for Decimal {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Decimal128(d) => decimal::from_decimal128(d),
            other => Err(Error::decode("decimal", describe(other))),
        }
    }
}

impl FromBson for Uuid {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Binary(bin) if bin.subtype == BinarySubtype::Uuid => {
                Uuid::from_slice(&bin.bytes).map_err(|e| Error::decode("uuid", e.to_string()))
            }
            other => Err(Error::decode("uuid", describe(other))),
        }
    }
}

impl FromBson for Vec<u8> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Binary(bin) => Ok(bin.bytes.clone()),
            other => Err(Error::decode("bytes", describe(other))),
        }
    }
}

impl FromBson for DateTime<Utc> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis())
                .ok_or_else(|| Error::decode("datetime", "timestamp out of range")),
            other => Err(Error::decode("datetime", describe(other))),
        }
    }
}

impl FromBson for TimeDelta {
    fn from_bson(value: &Bson) -> Result<Self> {
        let secs = f64::from_bson(value).map_err(|_| Error::decode("duration", describe(value)))?;
        Ok(TimeDelta::microseconds((secs * 1_000_000.0).round() as i64))
    }
}

impl FromBson for IpAddr {
    fn from_bson(value: &Bson) -> Result<Self> {
        let text = String::from_bson(value).map_err(|_| Error::decode("ip address", describe(value)))?;
        text.parse()
            .map_err(|_| Error::decode("ip address", text))
    }
}

impl FromBson for PathBuf {
    fn from_bson(value: &Bson) -> Result<Self> {
        String::from_bson(value).map(PathBuf::from)
    }
}

impl FromBson for SecretString {
    fn from_bson(value: &Bson) -> Result<Self> {
        String::from_bson(value).map(SecretString::new)
    }
}

impl FromBson for Pattern {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::RegularExpression(re) => Pattern::new(&re.pattern, &re.options),
            other => Err(Error::decode("pattern", describe(other))),
        }
    }
}

impl<T: FromBson> FromBson for Option<T> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Null => Ok(None),
            other => T::from_bson(other).map(Some),
        }
    }

    fn missing() -> Option<Self> {
        Some(None)
    }
}

impl<T: FromBson> FromBson for Vec<T> {
    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| T::from_bson(item).map_err(|e| e.in_field(&i.to_string())))
                .collect(),
            other => Err(Error::decode("array", describe(other))),
        }
    }
}

/// Field accessors on stored documents.
pub trait DocumentExt {
    /// Decode a field. Missing keys are an error unless `T` is optional.
    fn get_field<T: FromBson>(&self, key: &str) -> Result<T>;

    /// Decode a field that may be missing or null.
    fn get_optional<T: FromBson>(&self, key: &str) -> Result<Option<T>>;

    /// Decode a field, treating missing and null the same.
    fn get_or_default<T: FromBson + Default>(&self, key: &str) -> Result<T>;
}

impl DocumentExt for Document {
    fn get_field<T: FromBson>(&self, key: &str) -> Result<T> {
        match self.get(key) {
            Some(value) => T::from_bson(value).map_err(|e| e.in_field(key)),
            None => T::missing().ok_or_else(|| Error::decode("field", "missing").in_field(key)),
        }
    }

    fn get_optional<T: FromBson>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None | Some(Bson::Null) => Ok(None),
            Some(value) => T::from_bson(value).map(Some).map_err(|e| e.in_field(key)),
        }
    }

    fn get_or_default<T: FromBson + Default>(&self, key: &str) -> Result<T> {
        match self.get(key) {
            None | Some(Bson::Null) => Ok(T::default()),
            Some(value) => T::from_bson(value).map_err(|e| e.in_field(key)),
        }
    }
}
