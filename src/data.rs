//! Typed key/value payloads for jobs.
//!
//! `Data` is the only thing a job may persist: an immutable bag of typed
//! values built once via [`DataBuilder`] and serialized through a pluggable
//! [`DataSerializer`]. Keys are unique per type-map, so `put_string("x", ..)`
//! and `put_int("x", ..)` can coexist.
//!
//! Accessing a key that is absent is a programming error and panics; use the
//! `has_*` probes when a key is optional.

use crate::error::{JobqError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable typed key/value bag used as both job input and output payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    strings: HashMap<String, String>,
    string_arrays: HashMap<String, Vec<String>>,
    integers: HashMap<String, i32>,
    integer_arrays: HashMap<String, Vec<i32>>,
    longs: HashMap<String, i64>,
    long_arrays: HashMap<String, Vec<i64>>,
    floats: HashMap<String, f32>,
    float_arrays: HashMap<String, Vec<f32>>,
    doubles: HashMap<String, f64>,
    double_arrays: HashMap<String, Vec<f64>>,
    booleans: HashMap<String, bool>,
    boolean_arrays: HashMap<String, Vec<bool>>,
}

macro_rules! accessors {
    ($field:ident, $has:ident, $get:ident, $ty:ty) => {
        pub fn $has(&self, key: &str) -> bool {
            self.$field.contains_key(key)
        }

        /// Panics if the key is absent.
        pub fn $get(&self, key: &str) -> $ty {
            match self.$field.get(key) {
                Some(value) => value.clone(),
                None => panic!("Data has no `{}` entry for key '{}'", stringify!($field), key),
            }
        }
    };
}

impl Data {
    /// An empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a new payload.
    pub fn builder() -> DataBuilder {
        DataBuilder::default()
    }

    accessors!(strings, has_string, get_string, String);
    accessors!(string_arrays, has_string_array, get_string_array, Vec<String>);
    accessors!(integers, has_int, get_int, i32);
    accessors!(integer_arrays, has_int_array, get_int_array, Vec<i32>);
    accessors!(longs, has_long, get_long, i64);
    accessors!(long_arrays, has_long_array, get_long_array, Vec<i64>);
    accessors!(floats, has_float, get_float, f32);
    accessors!(float_arrays, has_float_array, get_float_array, Vec<f32>);
    accessors!(doubles, has_double, get_double, f64);
    accessors!(double_arrays, has_double_array, get_double_array, Vec<f64>);
    accessors!(booleans, has_boolean, get_boolean, bool);
    accessors!(boolean_arrays, has_boolean_array, get_boolean_array, Vec<bool>);
}

/// Append-only builder for [`Data`]. A later `put_*` for the same key and
/// type wins; the built value never changes afterwards.
#[derive(Debug, Default)]
pub struct DataBuilder {
    data: Data,
}

macro_rules! setters {
    ($field:ident, $put:ident, $ty:ty) => {
        pub fn $put(mut self, key: impl Into<String>, value: $ty) -> Self {
            self.data.$field.insert(key.into(), value);
            self
        }
    };
}

impl DataBuilder {
    setters!(strings, put_string, String);
    setters!(string_arrays, put_string_array, Vec<String>);
    setters!(integers, put_int, i32);
    setters!(integer_arrays, put_int_array, Vec<i32>);
    setters!(longs, put_long, i64);
    setters!(long_arrays, put_long_array, Vec<i64>);
    setters!(floats, put_float, f32);
    setters!(float_arrays, put_float_array, Vec<f32>);
    setters!(doubles, put_double, f64);
    setters!(double_arrays, put_double_array, Vec<f64>);
    setters!(booleans, put_boolean, bool);
    setters!(boolean_arrays, put_boolean_array, Vec<bool>);

    pub fn build(self) -> Data {
        self.data
    }
}

/// Pluggable wire format for [`Data`]. The scheduler core is agnostic to the
/// byte layout; only the serializer configured at manager construction ever
/// interprets a job's persisted payload.
pub trait DataSerializer: Send + Sync {
    fn serialize(&self, data: &Data) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Data>;
}

/// Default serializer: JSON via serde_json.
#[derive(Debug, Default)]
pub struct JsonDataSerializer;

impl DataSerializer for JsonDataSerializer {
    fn serialize(&self, data: &Data) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Data> {
        serde_json::from_slice(bytes).map_err(|e| JobqError::Data(e.to_string()))
    }
}
