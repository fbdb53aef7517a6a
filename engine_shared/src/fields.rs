//! Field protocol.
//!
//! A node serializes a named subset of its fields as a self-describing blob:
//!
//! ```text
//! [u8 field count] { [u8 blob length] ["name:" ascii] [binary value] }*
//! ```
//!
//! Every node type owns a [`FieldRegistry`]: an ordered list of
//! `(name -> encode, decode)` entries. Derived types build theirs by lifting
//! the base registry through a projection (`Entity -> WorldNode`) and
//! appending their own entries, so unknown names fall back to the base type's
//! handlers and the default field set grows from base to derived.

use std::{fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::codec::{self, CodecError};

/// Separates the field name from its value inside a blob.
pub const FIELD_DELIMITER: u8 = b':';

/// Most fields a single blob may carry.
pub const MAX_FIELDS: usize = u8::MAX as usize;

type EncodeFn<T> = Arc<dyn Fn(&T, &mut BytesMut) -> Result<(), CodecError> + Send + Sync>;
type DecodeFn<T> = Arc<dyn Fn(&mut T, &[u8]) -> Result<(), FieldError> + Send + Sync>;

/// Field protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldError {
    /// Blob ended before the declared fields were read.
    Truncated,
    /// No `:` inside a field blob.
    MissingDelimiter,
    /// Field name was not ASCII.
    InvalidName,
    /// No registered handler for this name.
    UnknownField(String),
    /// Value byte count did not match what the field needs.
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
    /// Value had the right size but an unusable encoding.
    InvalidValue(String),
    /// Bytes left over after the last declared field.
    TrailingBytes(usize),
    Codec(CodecError),
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::Truncated => write!(f, "field blob truncated"),
            FieldError::MissingDelimiter => write!(f, "field name delimiter not found"),
            FieldError::InvalidName => write!(f, "field name is not ascii"),
            FieldError::UnknownField(name) => write!(f, "unknown field '{name}'"),
            FieldError::LengthMismatch {
                field,
                expected,
                actual,
            } => write!(
                f,
                "field '{field}' expected {expected} bytes of data, got {actual}"
            ),
            FieldError::InvalidValue(field) => write!(f, "field '{field}' has an invalid value"),
            FieldError::TrailingBytes(n) => write!(f, "{n} trailing bytes after last field"),
            FieldError::Codec(e) => write!(f, "field value: {e}"),
        }
    }
}

impl std::error::Error for FieldError {}

impl From<CodecError> for FieldError {
    fn from(e: CodecError) -> Self {
        FieldError::Codec(e)
    }
}

/// Checks a field value has exactly `expected` bytes.
pub fn expect_len(field: &str, data: &[u8], expected: usize) -> Result<(), FieldError> {
    if data.len() != expected {
        return Err(FieldError::LengthMismatch {
            field: field.to_string(),
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// One named field of `T`.
pub struct FieldSpec<T> {
    name: &'static str,
    encode: EncodeFn<T>,
    decode: DecodeFn<T>,
}

impl<T> Clone for FieldSpec<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> FieldSpec<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Ordered per-type field table.
pub struct FieldRegistry<T> {
    fields: Vec<FieldSpec<T>>,
}

impl<T> Default for FieldRegistry<T> {
    fn default() -> Self {
        Self { fields: Vec::new() }
    }
}

impl<T: 'static> FieldRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field. A name that already exists is replaced in place, which
    /// lets a derived type override a base handler without reordering the
    /// default field set.
    pub fn field<E, D>(mut self, name: &'static str, encode: E, decode: D) -> Self
    where
        E: Fn(&T, &mut BytesMut) -> Result<(), CodecError> + Send + Sync + 'static,
        D: Fn(&mut T, &[u8]) -> Result<(), FieldError> + Send + Sync + 'static,
    {
        let spec = FieldSpec {
            name,
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        };
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = spec,
            None => self.fields.push(spec),
        }
        self
    }

    /// Re-targets every entry at a type `U` that embeds a `T`.
    pub fn lift<U: 'static>(
        &self,
        project: fn(&U) -> &T,
        project_mut: fn(&mut U) -> &mut T,
    ) -> FieldRegistry<U> {
        let fields = self
            .fields
            .iter()
            .map(|spec| {
                let encode = Arc::clone(&spec.encode);
                let decode = Arc::clone(&spec.decode);
                FieldSpec {
                    name: spec.name,
                    encode: Arc::new(move |u: &U, buf: &mut BytesMut| encode(project(u), buf))
                        as EncodeFn<U>,
                    decode: Arc::new(move |u: &mut U, data: &[u8]| decode(project_mut(u), data))
                        as DecodeFn<U>,
                }
            })
            .collect();
        FieldRegistry { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec<T>> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Default field set, base fields first.
    pub fn default_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes the named fields, or the default set when `names` is empty.
    ///
    /// Unknown names and fields whose blob would not fit the one-byte length
    /// are logged and skipped; the field count reflects what was written.
    pub fn serialize(&self, obj: &T, names: &[&str]) -> Bytes {
        let defaults;
        let names: &[&str] = if names.is_empty() {
            defaults = self.default_names();
            &defaults
        } else {
            names
        };

        let mut body = BytesMut::new();
        let mut count = 0usize;
        let mut value = BytesMut::new();
        for name in names {
            if count == MAX_FIELDS {
                error!(field = %name, "Field count limit reached, dropping field");
                continue;
            }
            let Some(spec) = self.get(name) else {
                error!(field = %name, "Serialize skipped unknown field");
                continue;
            };

            value.clear();
            if let Err(e) = (spec.encode)(obj, &mut value) {
                error!(field = %name, error = %e, "Serialize failed to encode field");
                continue;
            }

            let blob_len = spec.name.len() + 1 + value.len();
            if blob_len > u8::MAX as usize {
                error!(field = %name, blob_len, "Serialized field too large, dropping");
                continue;
            }

            body.put_u8(blob_len as u8);
            body.put_slice(spec.name.as_bytes());
            body.put_u8(FIELD_DELIMITER);
            body.put_slice(&value);
            count += 1;
        }

        let mut out = BytesMut::with_capacity(1 + body.len());
        out.put_u8(count as u8);
        out.extend_from_slice(&body);
        out.freeze()
    }

    /// Applies every field in `data` to `obj`, returning how many were applied.
    ///
    /// Fields are applied in order, so on error the fields before the failing
    /// one have already been written; callers wanting all-or-nothing apply to a
    /// copy first.
    pub fn unserialize(&self, obj: &mut T, data: &[u8]) -> Result<usize, FieldError> {
        let mut src = data;
        let count = codec::get_u8(&mut src).map_err(|_| FieldError::Truncated)?;

        for _ in 0..count {
            let blob_len = codec::get_u8(&mut src).map_err(|_| FieldError::Truncated)? as usize;
            let blob = codec::get_slice(&mut src, blob_len).map_err(|_| FieldError::Truncated)?;

            let split = blob
                .iter()
                .position(|b| *b == FIELD_DELIMITER)
                .ok_or(FieldError::MissingDelimiter)?;
            let name = std::str::from_utf8(&blob[..split])
                .ok()
                .filter(|n| n.is_ascii())
                .ok_or(FieldError::InvalidName)?;
            let value = &blob[split + 1..];

            let spec = self
                .get(name)
                .ok_or_else(|| FieldError::UnknownField(name.to_string()))?;
            (spec.decode)(obj, value)?;
            trace!(field = name, len = value.len(), "Unserialized field");
        }

        if !src.is_empty() {
            return Err(FieldError::TrailingBytes(src.len()));
        }
        Ok(count as usize)
    }
}
