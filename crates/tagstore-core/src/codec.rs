//! Canonical tuple encoding.
//!
//! A tuple is the concatenation of `(tag, value)` elements in strictly
//! ascending tag order. Each element is the tag as a big-endian `u64`, one
//! kind byte, then an order-preserving payload, so two mappings with the same
//! pairs always produce the same bytes and key tuples with the same tag set
//! sort in value order.

use std::fmt::{Display, Formatter};

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::schema::{Column, Schema, Tag, TypeKind};
use crate::value::{TaggedValues, Value};
use crate::KernelError;

const TAG_LEN: usize = 8;
const STRING_ESCAPE: u8 = 0xFF;
const SIGN_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TupleSelection {
    /// Primary-key columns only.
    Key,
    /// Non-key columns only.
    Value,
    /// Every column present in the mapping.
    All,
}

impl TupleSelection {
    fn includes(self, column: &Column) -> bool {
        match self {
            Self::Key => column.is_primary_key,
            Self::Value => !column.is_primary_key,
            Self::All => true,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tuple(Vec<u8>);

impl Tuple {
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wrap stored bytes without validating them; [`Tuple::elements`]
    /// reports malformed input.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// # Errors
    /// Returns [`KernelError::RowDecode`] when `raw` is not valid hex.
    pub fn from_hex(raw: &str) -> Result<Self, KernelError> {
        hex::decode(raw)
            .map(Self)
            .map_err(|err| KernelError::RowDecode(format!("invalid tuple hex: {err}")))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content address of the tuple bytes.
    #[must_use]
    pub fn content_hash(&self) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(&self.0)))
    }

    /// Decode the raw `(tag, value)` pairs without consulting a schema.
    ///
    /// # Errors
    /// Returns [`KernelError::RowDecode`] on truncated input, unknown kind
    /// codes, or tags that are not strictly ascending.
    pub fn elements(&self) -> Result<Vec<(Tag, Value)>, KernelError> {
        let mut reader = Reader { bytes: &self.0, offset: 0 };
        let mut elements: Vec<(Tag, Value)> = Vec::new();

        while !reader.is_done() {
            let tag = Tag(reader.read_u64()?);
            if let Some((previous, _)) = elements.last() {
                if *previous >= tag {
                    return Err(KernelError::RowDecode(format!(
                        "non-canonical tuple: tag {tag} follows tag {previous}"
                    )));
                }
            }
            let code = reader.read_u8()?;
            let kind = TypeKind::from_code(code)
                .ok_or_else(|| KernelError::RowDecode(format!("unknown kind code {code}")))?;
            elements.push((tag, reader.read_payload(kind)?));
        }

        Ok(elements)
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A stored row: key tuple plus value tuple.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Row {
    pub key: Tuple,
    pub value: Tuple,
}

impl Row {
    /// # Errors
    /// See [`decode`].
    pub fn decode(&self, schema: &Schema) -> Result<TaggedValues, KernelError> {
        decode(schema, &self.key, &self.value)
    }
}

/// Encode the selected columns of `values` into one canonical tuple.
///
/// Null values are omitted. Tags are validated even when the selection
/// skips their column.
///
/// # Errors
/// Returns [`KernelError::UnknownTag`] for a tag with no column and
/// [`KernelError::TypeMismatch`] when a value's kind differs from its column.
pub fn encode(
    schema: &Schema,
    values: &TaggedValues,
    selection: TupleSelection,
) -> Result<Tuple, KernelError> {
    let mut buf = Vec::new();

    for (tag, value) in values {
        let column = schema.column_by_tag(*tag).ok_or(KernelError::UnknownTag(*tag))?;
        if value.is_null() || !selection.includes(column) {
            continue;
        }
        check_kind(column, value)?;
        write_element(&mut buf, *tag, value);
    }

    Ok(Tuple(buf))
}

/// Encode both halves of a row.
///
/// # Errors
/// See [`encode`].
pub fn encode_row(schema: &Schema, values: &TaggedValues) -> Result<Row, KernelError> {
    Ok(Row {
        key: encode(schema, values, TupleSelection::Key)?,
        value: encode(schema, values, TupleSelection::Value)?,
    })
}

/// Rebuild the tag→value mapping of a stored row.
///
/// # Errors
/// Returns [`KernelError::RowDecode`] when either tuple is malformed, names a
/// tag the schema lacks, places a column in the wrong half, or carries a
/// value of the wrong kind.
pub fn decode(schema: &Schema, key: &Tuple, value: &Tuple) -> Result<TaggedValues, KernelError> {
    let mut values = TaggedValues::new();

    for (in_key, tuple) in [(true, key), (false, value)] {
        let half = if in_key { "key" } else { "value" };
        for (tag, decoded) in tuple.elements()? {
            let column = schema.column_by_tag(tag).ok_or_else(|| {
                KernelError::RowDecode(format!("{half} tuple references unknown tag {tag}"))
            })?;
            if column.is_primary_key != in_key {
                return Err(KernelError::RowDecode(format!(
                    "column `{}` found in {half} tuple",
                    column.name
                )));
            }
            if decoded.kind() != Some(column.kind) {
                return Err(KernelError::RowDecode(format!(
                    "column `{}` expects {} but tuple holds {decoded:?}",
                    column.name, column.kind
                )));
            }
            values.insert(tag, decoded);
        }
    }

    Ok(values)
}

fn check_kind(column: &Column, value: &Value) -> Result<(), KernelError> {
    if value.kind() == Some(column.kind) {
        return Ok(());
    }
    Err(KernelError::TypeMismatch {
        column: column.name.clone(),
        expected: column.kind,
        found: value.kind().map_or("null", TypeKind::as_str).to_string(),
    })
}

fn write_element(buf: &mut Vec<u8>, tag: Tag, value: &Value) {
    let Some(kind) = value.kind() else {
        return;
    };
    buf.extend_from_slice(&tag.0.to_be_bytes());
    buf.push(kind.code());

    match value {
        Value::Null => {}
        Value::String(text) => {
            for byte in text.as_bytes() {
                buf.push(*byte);
                if *byte == 0 {
                    buf.push(STRING_ESCAPE);
                }
            }
            buf.extend_from_slice(&[0, 0]);
        }
        Value::Int(number) => buf.extend_from_slice(&signed_sortable(*number).to_be_bytes()),
        Value::Uint(number) => buf.extend_from_slice(&number.to_be_bytes()),
        Value::Float(number) => buf.extend_from_slice(&float_sortable(*number).to_be_bytes()),
        Value::Bool(flag) => buf.push(u8::from(*flag)),
        Value::Timestamp(at) => {
            buf.extend_from_slice(&signed_sortable(at.unix_timestamp()).to_be_bytes());
            buf.extend_from_slice(&at.nanosecond().to_be_bytes());
        }
    }
}

#[allow(clippy::cast_sign_loss)]
fn signed_sortable(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

#[allow(clippy::cast_possible_wrap)]
fn signed_from_sortable(raw: u64) -> i64 {
    (raw ^ SIGN_BIT) as i64
}

fn float_sortable(value: f64) -> u64 {
    // -0.0 and every NaN collapse to one encoding.
    let normalized = if value == 0.0 {
        0.0
    } else if value.is_nan() {
        f64::NAN
    } else {
        value
    };
    let bits = normalized.to_bits();
    if bits & SIGN_BIT == 0 {
        bits ^ SIGN_BIT
    } else {
        !bits
    }
}

fn float_from_sortable(raw: u64) -> f64 {
    let bits = if raw & SIGN_BIT == 0 { !raw } else { raw ^ SIGN_BIT };
    f64::from_bits(bits)
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Reader<'_> {
    fn is_done(&self) -> bool {
        self.offset >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&[u8], KernelError> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.bytes.len()).ok_or_else(
            || KernelError::RowDecode(format!("truncated tuple at byte {}", self.offset)),
        )?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, KernelError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, KernelError> {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    fn read_u64(&mut self) -> Result<u64, KernelError> {
        let mut raw = [0_u8; TAG_LEN];
        raw.copy_from_slice(self.take(TAG_LEN)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_string(&mut self) -> Result<String, KernelError> {
        let mut out = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte != 0 {
                out.push(byte);
                continue;
            }
            match self.read_u8()? {
                0 => break,
                STRING_ESCAPE => out.push(0),
                other => {
                    return Err(KernelError::RowDecode(format!(
                        "invalid string escape byte {other:#04x}"
                    )))
                }
            }
        }
        String::from_utf8(out)
            .map_err(|err| KernelError::RowDecode(format!("string is not UTF-8: {err}")))
    }

    fn read_payload(&mut self, kind: TypeKind) -> Result<Value, KernelError> {
        match kind {
            TypeKind::String => self.read_string().map(Value::String),
            TypeKind::Int => Ok(Value::Int(signed_from_sortable(self.read_u64()?))),
            TypeKind::Uint => Ok(Value::Uint(self.read_u64()?)),
            TypeKind::Float => Ok(Value::Float(float_from_sortable(self.read_u64()?))),
            TypeKind::Bool => match self.read_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(KernelError::RowDecode(format!("invalid bool byte {other}"))),
            },
            TypeKind::Timestamp => {
                let seconds = signed_from_sortable(self.read_u64()?);
                let nanos = self.read_u32()?;
                let at = OffsetDateTime::from_unix_timestamp(seconds)
                    .ok()
                    .and_then(|at| at.replace_nanosecond(nanos).ok())
                    .ok_or_else(|| {
                        KernelError::RowDecode(format!(
                            "timestamp out of range: {seconds}s {nanos}ns"
                        ))
                    })?;
                Ok(Value::Timestamp(at))
            }
        }
    }
}
