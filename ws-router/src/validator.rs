//! Validator adapter contract (spec §4.2) plus a strict reference
//! implementation. The framework is validator-agnostic: swap
//! `StrictJsonValidator` for a jsonschema/protobuf/whatever-backed adapter by
//! implementing [`ValidatorAdapter`] against your own `Schema` type.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::envelope::RawEnvelope;
use crate::registry::MessageDescriptor;

#[derive(Debug, Clone)]
pub enum FieldKind {
    String { min_len: Option<usize> },
    Integer,
    Number,
    Bool,
    Any,
    Object(Box<ObjectSchema>),
    Array(Box<FieldKind>),
}

#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    pub fields: BTreeMap<String, FieldSpec>,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
}

impl ObjectSchema {
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, required });
        self
    }
}

/// The `S` that flows through [`MessageDescriptor`] when using the reference
/// validator: a payload shape plus the set of extra `meta` keys this message
/// type is allowed to carry beyond `correlationId`/`timestamp`.
#[derive(Debug, Clone, Default)]
pub struct JsonMessageSchema {
    pub message_type: Option<String>,
    pub payload: Option<ObjectSchema>,
    pub extra_meta_keys: Vec<String>,
}

impl JsonMessageSchema {
    pub fn new(message_type: impl Into<String>, payload: ObjectSchema) -> Self {
        Self {
            message_type: Some(message_type.into()),
            payload: Some(payload),
            extra_meta_keys: Vec::new(),
        }
    }

    pub fn no_payload(message_type: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type.into()),
            payload: None,
            extra_meta_keys: Vec::new(),
        }
    }

    pub fn with_extra_meta_keys(mut self, keys: impl IntoIterator<Item = &'static str>) -> Self {
        self.extra_meta_keys = keys.into_iter().map(str::to_string).collect();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub value: Option<Value>,
    pub issues: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok(value: Option<Value>) -> Self {
        Self {
            ok: true,
            value,
            issues: Vec::new(),
        }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self {
            ok: false,
            value: None,
            issues,
        }
    }
}

const RECOGNIZED_META_KEYS: &[&str] = &["correlationId", "timestamp", "timeoutMs"];

#[async_trait]
pub trait ValidatorAdapter: Send + Sync {
    type Schema: Send + Sync + 'static;

    /// Validate an inbound raw envelope's `meta` and `payload` against the
    /// descriptor. MUST be strict: unknown keys at root, in `meta`, or in
    /// `payload` are rejected (spec testable property 6).
    async fn validate(
        &self,
        descriptor: &MessageDescriptor<Self::Schema>,
        raw: &RawEnvelope,
    ) -> ValidationOutcome;

    /// Optional outbound validation; if not overridden, outbound is never
    /// checked (spec §4.2).
    async fn validate_outgoing(&self, _schema: &Self::Schema, _payload: &Value) -> ValidationOutcome {
        ValidationOutcome::ok(None)
    }

    fn get_message_type(&self, schema: &Self::Schema) -> Option<String>;
}

/// Reference strict-JSON validator. Not schema-driven by a real JSON Schema
/// engine — just enough structural checking to exercise the contract.
pub struct StrictJsonValidator;

impl StrictJsonValidator {
    fn validate_field(path: &str, kind: &FieldKind, value: &Value, issues: &mut Vec<String>) {
        match kind {
            FieldKind::String { min_len } => match value.as_str() {
                Some(s) => {
                    if let Some(min_len) = min_len {
                        if s.len() < *min_len {
                            issues.push(format!("{}: shorter than min length {}", path, min_len));
                        }
                    }
                }
                None => issues.push(format!("{}: expected string", path)),
            },
            FieldKind::Integer => {
                if !value.is_i64() && !value.is_u64() {
                    issues.push(format!("{}: expected integer", path));
                }
            }
            FieldKind::Number => {
                if !value.is_number() {
                    issues.push(format!("{}: expected number", path));
                }
            }
            FieldKind::Bool => {
                if !value.is_boolean() {
                    issues.push(format!("{}: expected bool", path));
                }
            }
            FieldKind::Any => {}
            FieldKind::Object(schema) => match value.as_object() {
                Some(obj) => Self::validate_object(path, schema, obj, issues),
                None => issues.push(format!("{}: expected object", path)),
            },
            FieldKind::Array(item_kind) => match value.as_array() {
                Some(arr) => {
                    for (i, item) in arr.iter().enumerate() {
                        Self::validate_field(&format!("{}[{}]", path, i), item_kind, item, issues);
                    }
                }
                None => issues.push(format!("{}: expected array", path)),
            },
        }
    }

    fn validate_object(
        path: &str,
        schema: &ObjectSchema,
        obj: &Map<String, Value>,
        issues: &mut Vec<String>,
    ) {
        for (key, spec) in &schema.fields {
            let field_path = format!("{}.{}", path, key);
            match obj.get(key) {
                Some(value) => Self::validate_field(&field_path, &spec.kind, value, issues),
                None if spec.required => issues.push(format!("{}: missing required field", field_path)),
                None => {}
            }
        }

        for key in obj.keys() {
            if !schema.fields.contains_key(key) {
                issues.push(format!("{}.{}: unknown field", path, key));
            }
        }
    }
}

#[async_trait]
impl ValidatorAdapter for StrictJsonValidator {
    type Schema = JsonMessageSchema;

    async fn validate(
        &self,
        descriptor: &MessageDescriptor<Self::Schema>,
        raw: &RawEnvelope,
    ) -> ValidationOutcome {
        let mut issues = Vec::new();

        for key in raw.meta.keys() {
            if RECOGNIZED_META_KEYS.contains(&key.as_str())
                || descriptor
                    .request_schema
                    .extra_meta_keys
                    .iter()
                    .any(|k| k == key)
            {
                continue;
            }
            issues.push(format!("meta.{}: unrecognized key", key));
        }

        match (&descriptor.request_schema.payload, &raw.payload) {
            (Some(schema), Some(payload)) => match payload.as_object() {
                Some(obj) => Self::validate_object("payload", schema, obj, &mut issues),
                None => issues.push("payload: expected object".to_string()),
            },
            (Some(_), None) => issues.push("payload: missing required payload".to_string()),
            (None, Some(_)) => issues.push("payload: no payload expected for this message type".to_string()),
            (None, None) => {}
        }

        if issues.is_empty() {
            ValidationOutcome::ok(raw.payload.clone())
        } else {
            ValidationOutcome::fail(issues)
        }
    }

    fn get_message_type(&self, schema: &Self::Schema) -> Option<String> {
        schema.message_type.clone()
    }
}
