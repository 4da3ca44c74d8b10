// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Payload validation.
//!
//! A [`Schema`] turns a raw JSON value into a typed payload or rejects it.
//! The courier calls one on every path a payload crosses: before publishing,
//! after pulling from a stream, before sending a request, on both sides of a
//! reply.
//!
//! - [`Json<T>`] accepts whatever `serde` can deserialize into `T`.
//! - [`from_fn`] wraps a closure.
//! - [`SchemaExt::refine`] adds a predicate on top of any schema.
//!
//! ```rust
//! use serde::Deserialize;
//! use stream_courier::schema::{Json, Schema, SchemaExt};
//!
//! #[derive(Deserialize)]
//! struct Hello { name: String }
//!
//! let schema = Json::<Hello>::new().refine(|h: &Hello| !h.name.is_empty(), "name must not be empty");
//! assert!(schema.parse(serde_json::json!({"name": "Joe"})).is_ok());
//! assert!(schema.parse(serde_json::json!({"name": ""})).is_err());
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Why a payload was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SchemaError(pub String);

impl SchemaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Validates and converts a JSON value into `T`.
pub trait Schema<T>: Send + Sync + 'static {
    fn parse(&self, value: Value) -> Result<T, SchemaError>;
}

/// Schema backed by `serde` deserialization.
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Json<{}>", std::any::type_name::<T>())
    }
}

impl<T: DeserializeOwned + 'static> Schema<T> for Json<T> {
    fn parse(&self, value: Value) -> Result<T, SchemaError> {
        serde_json::from_value(value).map_err(|e| SchemaError(e.to_string()))
    }
}

/// Schema backed by a closure.
pub struct FnSchema<F> {
    f: F,
}

/// Build a schema from a closure.
pub fn from_fn<T, F>(f: F) -> FnSchema<F>
where
    F: Fn(Value) -> Result<T, SchemaError> + Send + Sync + 'static,
{
    FnSchema { f }
}

impl<T, F> Schema<T> for FnSchema<F>
where
    F: Fn(Value) -> Result<T, SchemaError> + Send + Sync + 'static,
{
    fn parse(&self, value: Value) -> Result<T, SchemaError> {
        (self.f)(value)
    }
}

/// A schema with an extra predicate.
pub struct Refine<S, P> {
    inner: S,
    predicate: P,
    message: String,
}

impl<T, S, P> Schema<T> for Refine<S, P>
where
    S: Schema<T>,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn parse(&self, value: Value) -> Result<T, SchemaError> {
        let parsed = self.inner.parse(value)?;
        if (self.predicate)(&parsed) {
            Ok(parsed)
        } else {
            Err(SchemaError(self.message.clone()))
        }
    }
}

/// Combinators for schemas.
pub trait SchemaExt<T>: Schema<T> + Sized {
    /// Reject values for which `predicate` returns false.
    fn refine<P>(self, predicate: P, message: impl Into<String>) -> Refine<Self, P>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Refine {
            inner: self,
            predicate,
            message: message.into(),
        }
    }
}

impl<T, S: Schema<T>> SchemaExt<T> for S {}
