//! Dataflow compatibility checks.
//!
//! Two phases: [`can_connect`] runs when an edge is attached and only sees
//! schemas; [`is_runtime_compatible`] runs when data is delivered and the
//! source's actual format tag is known.

use crate::error::TaskError;
use crate::schema::{FormatTag, PortSchema, PrimitiveKind, SchemaKind};

/// Outcome of a static compatibility check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
    /// Compatible; no further check needed beyond delivery-time tags.
    Static,
    /// Structurally compatible, but the target's format can only be checked
    /// once the source's format is known at delivery.
    Deferred,
    /// Edge must be rejected.
    Incompatible(String),
}

impl Compatibility {
    /// Returns true unless the edge must be rejected.
    pub fn is_connectable(&self) -> bool {
        !matches!(self, Self::Incompatible(_))
    }
}

/// Decides whether an edge from `source` to `target` may exist.
pub fn can_connect(source: &PortSchema, target: &PortSchema) -> Compatibility {
    if !structurally_compatible(source, target) {
        return Compatibility::Incompatible(format!(
            "{} cannot feed {}",
            describe(source),
            describe(target)
        ));
    }

    match (&source.format, &target.format) {
        (_, None) => Compatibility::Static,
        (Some(s), Some(t)) => {
            if is_runtime_compatible(Some(s), Some(t)) {
                Compatibility::Static
            } else {
                Compatibility::Incompatible(format!("format {} cannot feed format {}", s, t))
            }
        }
        (None, Some(_)) => Compatibility::Deferred,
    }
}

/// Structural part of the static check. Format tags are ignored.
pub fn structurally_compatible(source: &PortSchema, target: &PortSchema) -> bool {
    match (&source.kind, &target.kind) {
        (_, SchemaKind::Any) | (SchemaKind::Any, _) => true,
        (SchemaKind::OneOf { alternatives }, _) => alternatives
            .iter()
            .all(|alt| structurally_compatible(alt, target)),
        (_, SchemaKind::OneOf { alternatives }) => alternatives
            .iter()
            .any(|alt| structurally_compatible(source, alt)),
        (SchemaKind::Primitive { kind: s }, SchemaKind::Primitive { kind: t }) => {
            s == t || (*s == PrimitiveKind::Integer && *t == PrimitiveKind::Number)
        }
        (SchemaKind::Array { items: s }, SchemaKind::Array { items: t }) => {
            structurally_compatible(s, t)
        }
        (
            SchemaKind::Object { fields: s_fields, .. },
            SchemaKind::Object {
                fields: t_fields,
                required: t_required,
            },
        ) => t_fields.iter().all(|(name, t_field)| match s_fields.get(name) {
            Some(s_field) => structurally_compatible(s_field, t_field),
            None => !t_required.contains(name),
        }),
        _ => false,
    }
}

/// Checks format tags once both sides are known.
///
/// - untagged target accepts anything
/// - tagged target never accepts an untagged source
/// - names must match
/// - a bare target accepts any qualifier; a qualified target needs the same qualifier
pub fn is_runtime_compatible(source: Option<&FormatTag>, target: Option<&FormatTag>) -> bool {
    let Some(target) = target else {
        return true;
    };
    let Some(source) = source else {
        return false;
    };
    if source.name() != target.name() {
        return false;
    }
    match target.qualifier() {
        None => true,
        Some(q) => source.qualifier() == Some(q),
    }
}

/// Delivery-time check producing a [`TaskError::RuntimeIncompatibility`].
pub fn check_delivery(
    dataflow: &str,
    source: Option<&FormatTag>,
    target: Option<&FormatTag>,
) -> Result<(), TaskError> {
    if is_runtime_compatible(source, target) {
        return Ok(());
    }
    Err(TaskError::RuntimeIncompatibility {
        dataflow: dataflow.to_string(),
        source_format: source.map_or_else(|| "<none>".to_string(), |f| f.to_string()),
        target_format: target.map_or_else(|| "<none>".to_string(), |f| f.to_string()),
    })
}

fn describe(schema: &PortSchema) -> String {
    let kind = match &schema.kind {
        SchemaKind::Any => "any".to_string(),
        SchemaKind::Object { .. } => "object".to_string(),
        SchemaKind::Array { items } => format!("array<{}>", describe(items)),
        SchemaKind::Primitive { kind } => format!("{:?}", kind).to_lowercase(),
        SchemaKind::OneOf { alternatives } => {
            let alts: Vec<String> = alternatives.iter().map(describe).collect();
            format!("oneOf<{}>", alts.join("|"))
        }
    };
    match &schema.format {
        Some(f) => format!("{}({})", kind, f),
        None => kind,
    }
}
