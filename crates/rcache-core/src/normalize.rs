//! Canonical text form of argument values, used as fingerprint input.
//!
//! Sequences keep their order; mappings and sets do not. A mapping renders
//! as the sorted set of its `(value, key)` pairs, so two mappings with the
//! same entries normalize identically whatever their insertion order.
//! Callables normalize to their declared name and opaque objects to their
//! type name. Normalization never fails: past [`MAX_DEPTH`] nesting levels
//! a value collapses to [`DEPTH_PLACEHOLDER`].

use std::collections::BTreeSet;
use std::fmt::Write as _;

use rcache_types::{Kwargs, Value};
use tracing::warn;

/// Deepest nesting level rendered before collapsing to the placeholder.
pub const MAX_DEPTH: usize = 99;

/// Token standing in for anything nested too deeply to render.
pub const DEPTH_PLACEHOLDER: &str = "<depth-limit>";

/// Canonical rendering of `value`, starting at nesting level `depth`.
#[must_use]
pub fn normalize(value: &Value, depth: usize) -> String {
    let mut out = String::new();
    render(value, depth, &mut out);
    out
}

/// Canonical rendering of a positional argument list.
#[must_use]
pub fn normalize_args(args: &[Value]) -> String {
    if args.is_empty() {
        return "()".to_owned();
    }
    let mut out = String::from("[");
    for (idx, arg) in args.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        render(arg, 1, &mut out);
    }
    out.push(']');
    out
}

/// Canonical rendering of keyword arguments, as an unordered mapping.
#[must_use]
pub fn normalize_kwargs(kwargs: &Kwargs) -> String {
    let mut out = String::new();
    render_pairs(
        kwargs
            .iter()
            .map(|(k, v)| (Value::Str(k.clone()), v.clone())),
        1,
        &mut out,
    );
    out
}

fn render(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        warn!(max_depth = MAX_DEPTH, "value nested too deeply; normalized to placeholder");
        out.push_str(DEPTH_PLACEHOLDER);
        return;
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        Value::Int(v) => {
            let _ = write!(out, "{v}");
        }
        Value::Float(v) => {
            let _ = write!(out, "{v:?}");
        }
        Value::Str(v) => {
            let _ = write!(out, "{v:?}");
        }
        Value::Bytes(v) => {
            out.push_str("b'");
            for byte in v {
                let _ = write!(out, "{byte:02x}");
            }
            out.push('\'');
        }
        Value::List(items) => render_sequence(items, '[', ']', depth, out),
        Value::Tuple(items) => {
            if items.len() == 1 {
                out.push('(');
                render(&items[0], depth + 1, out);
                out.push_str(",)");
            } else {
                render_sequence(items, '(', ')', depth, out);
            }
        }
        Value::Map(entries) => render_pairs(entries.iter().cloned(), depth, out),
        Value::Set(items) => {
            let rendered: BTreeSet<String> =
                items.iter().map(|item| normalize(item, depth + 1)).collect();
            out.push('{');
            join_into(rendered.iter(), out);
            out.push('}');
        }
        Value::Callable(name) => out.push_str(name),
        Value::Opaque(type_name) => out.push_str(type_name),
    }
}

fn render_sequence(items: &[Value], open: char, close: char, depth: usize, out: &mut String) {
    out.push(open);
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        render(item, depth + 1, out);
    }
    out.push(close);
}

fn render_pairs(entries: impl Iterator<Item = (Value, Value)>, depth: usize, out: &mut String) {
    let rendered: BTreeSet<String> = entries
        .map(|(k, v)| {
            format!(
                "({}, {})",
                normalize(&v, depth + 1),
                normalize(&k, depth + 1)
            )
        })
        .collect();
    out.push('{');
    join_into(rendered.iter(), out);
    out.push('}');
}

fn join_into<'a>(parts: impl Iterator<Item = &'a String>, out: &mut String) {
    for (idx, part) in parts.enumerate() {
        if idx > 0 {
            out.push_str(", ");
        }
        out.push_str(part);
    }
}
