//! Command-line key specifications.
//!
//! `args[0]` may be a comma-separated header naming the columns the
//! following tokens fill. When it is not, the primary-key columns (in tag
//! order) are the header and every token is data.

use std::collections::BTreeSet;

use crate::codec::{encode, Tuple, TupleSelection};
use crate::schema::{Column, Schema};
use crate::value::{TaggedValues, Value};
use crate::KernelError;

/// Resolve `args` into one tag→value mapping per key.
///
/// # Errors
/// Returns [`KernelError::MalformedKeySpec`] when a token does not split into
/// exactly one value per header column or the header repeats a column, and
/// [`KernelError::ValueParse`] when a value does not fit its column kind.
pub fn parse_key_mappings<S: AsRef<str>>(
    schema: &Schema,
    args: &[S],
) -> Result<Vec<TaggedValues>, KernelError> {
    let Some(first) = args.first() else {
        return Ok(Vec::new());
    };

    let (header, data) = match explicit_header(schema, first.as_ref())? {
        Some(header) => (header, &args[1..]),
        None => (schema.pk_columns(), args),
    };

    data.iter().map(|token| mapping_for_token(&header, token.as_ref())).collect()
}

/// Resolve `args` into canonical key tuples, one per key in input order.
///
/// # Errors
/// See [`parse_key_mappings`]; codec errors are passed through.
pub fn parse_key_values<S: AsRef<str>>(
    schema: &Schema,
    args: &[S],
) -> Result<Vec<Tuple>, KernelError> {
    parse_key_mappings(schema, args)?
        .iter()
        .map(|mapping| encode(schema, mapping, TupleSelection::All))
        .collect()
}

fn explicit_header<'a>(
    schema: &'a Schema,
    token: &str,
) -> Result<Option<Vec<&'a Column>>, KernelError> {
    let mut header = Vec::new();
    for name in token.split(',') {
        match schema.column_by_name(name.trim()) {
            Some(column) => header.push(column),
            None => return Ok(None),
        }
    }

    let mut seen = BTreeSet::new();
    for column in &header {
        if !seen.insert(column.tag) {
            return Err(KernelError::MalformedKeySpec(format!(
                "header `{token}` names column `{}` more than once",
                column.name
            )));
        }
    }

    Ok(Some(header))
}

fn mapping_for_token(header: &[&Column], token: &str) -> Result<TaggedValues, KernelError> {
    let raw_values: Vec<&str> = if header.len() > 1 { token.split(',').collect() } else { vec![token] };

    if raw_values.len() != header.len() {
        let names = header.iter().map(|column| column.name.as_str()).collect::<Vec<_>>();
        return Err(KernelError::MalformedKeySpec(format!(
            "`{token}` has {} value(s) but the key header ({}) has {}",
            raw_values.len(),
            names.join(","),
            header.len()
        )));
    }

    header
        .iter()
        .zip(raw_values)
        .map(|(column, raw)| Ok((column.tag, Value::parse(column, raw)?)))
        .collect()
}
