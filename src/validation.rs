use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// FieldType
///
/// The JSON shapes a declared field may take. Query-string values are coerced into
/// these shapes before checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Uuid,
}

/// Field
///
/// One declared input field and its constraints.
#[derive(Debug, Clone)]
pub struct Field {
    name: &'static str,
    kind: FieldType,
    required: bool,
    non_blank: bool,
    min_len: Option<usize>,
    max_len: Option<usize>,
    min: Option<i64>,
    max: Option<i64>,
}

impl Field {
    fn new(name: &'static str, kind: FieldType) -> Self {
        Self {
            name,
            kind,
            required: false,
            non_blank: false,
            min_len: None,
            max_len: None,
            min: None,
            max: None,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn uuid(name: &'static str) -> Self {
        Self::new(name, FieldType::Uuid)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Rejects strings that are empty after trimming whitespace.
    pub fn non_blank(mut self) -> Self {
        self.non_blank = true;
        self
    }

    pub fn min_len(mut self, len: usize) -> Self {
        self.min_len = Some(len);
        self
    }

    pub fn max_len(mut self, len: usize) -> Self {
        self.max_len = Some(len);
        self
    }

    /// Inclusive bounds for integer fields.
    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    fn check(&self, value: &Value, out: &mut Violations) {
        match self.kind {
            FieldType::String => {
                let Some(text) = value.as_str() else {
                    return out.push(self.name, "type", format!("{} must be a string", self.name));
                };
                if self.non_blank && text.trim().is_empty() {
                    out.push(self.name, "blank", format!("{} must not be blank", self.name));
                }
                let len = text.chars().count();
                if let Some(min) = self.min_len.filter(|min| len < *min) {
                    out.push(
                        self.name,
                        "too_short",
                        format!("{} must be at least {min} characters", self.name),
                    );
                }
                if let Some(max) = self.max_len.filter(|max| len > *max) {
                    out.push(
                        self.name,
                        "too_long",
                        format!("{} must be at most {max} characters", self.name),
                    );
                }
            }
            FieldType::Integer => {
                let Some(number) = value.as_i64() else {
                    return out.push(self.name, "type", format!("{} must be an integer", self.name));
                };
                let below = self.min.is_some_and(|min| number < min);
                let above = self.max.is_some_and(|max| number > max);
                if below || above {
                    out.push(
                        self.name,
                        "out_of_range",
                        format!(
                            "{} must be between {} and {}",
                            self.name,
                            self.min.unwrap_or(i64::MIN),
                            self.max.unwrap_or(i64::MAX)
                        ),
                    );
                }
            }
            FieldType::Boolean => {
                if !value.is_boolean() {
                    out.push(self.name, "type", format!("{} must be a boolean", self.name));
                }
            }
            FieldType::Uuid => {
                let parsed = value.as_str().map(Uuid::parse_str);
                if !matches!(parsed, Some(Ok(_))) {
                    out.push(self.name, "type", format!("{} must be a uuid", self.name));
                }
            }
        }
    }

    fn coerce(&self, raw: &str) -> Value {
        match self.kind {
            FieldType::Integer => raw
                .parse::<i64>()
                .map(|n| Value::Number(Number::from(n)))
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            FieldType::Boolean => match raw {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(raw.to_string()),
            },
            FieldType::String | FieldType::Uuid => Value::String(raw.to_string()),
        }
    }
}

/// Violation
///
/// One field-level validation failure, as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Violation {
    /// Offending field, or `$` for the input as a whole.
    pub field: String,
    /// Stable machine-readable reason, e.g. `required` or `too_long`.
    pub code: String,
    pub message: String,
}

/// Violations
///
/// Every violation found in one pass over an input. Never returned empty by the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations(Vec<Violation>);

impl Violations {
    fn push(&mut self, field: &str, code: &str, message: String) {
        self.0.push(Violation {
            field: field.to_string(),
            code: code.to_string(),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Violation for an input that could not be read at all (bad JSON, bad path id).
    pub fn malformed(field: &str, message: impl Into<String>) -> Self {
        let mut out = Self::default();
        out.push(field, "malformed", message.into());
        out
    }

    pub fn into_vec(self) -> Vec<Violation> {
        self.0
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.0.iter().map(|v| v.field.as_str()).collect();
        write!(f, "{} violation(s) on [{}]", self.0.len(), fields.join(", "))
    }
}

impl std::error::Error for Violations {}

/// Schema
///
/// A declarative description of one input shape, built once per process and shared
/// by every request. Validation is pure: the same input always produces the same
/// result and nothing outside the gate is touched.
///
/// ```ignore
/// let schema = Schema::new("new_project")
///     .field(Field::string("title").required().non_blank().max_len(200))
///     .field(Field::boolean("is_public"));
/// ```
#[derive(Debug, Clone)]
pub struct Schema {
    name: &'static str,
    fields: Vec<Field>,
    require_any: bool,
}

impl Schema {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
            require_any: false,
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// At least one declared field must be present. Used for partial updates.
    pub fn require_any(mut self) -> Self {
        self.require_any = true;
        self
    }

    /// validate
    ///
    /// Checks `input` against every declared field and returns either the typed
    /// value or the complete list of violations. Unknown fields are violations;
    /// `null` counts as absent.
    pub fn validate<T: DeserializeOwned>(&self, input: &Value) -> Result<T, Violations> {
        let Some(object) = input.as_object() else {
            let mut out = Violations::default();
            out.push("$", "type", format!("{} must be a JSON object", self.name));
            return Err(out);
        };

        let mut out = Violations::default();

        for key in object.keys() {
            if !self.fields.iter().any(|f| f.name == key) {
                out.push(key, "unknown_field", format!("{key} is not accepted here"));
            }
        }

        let mut present = 0;
        for field in &self.fields {
            match object.get(field.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    present += 1;
                    field.check(value, &mut out);
                }
                None if field.required => {
                    out.push(field.name, "required", format!("{} is required", field.name));
                }
                None => {}
            }
        }

        if self.require_any && present == 0 {
            out.push("$", "empty", "at least one field must be provided".to_string());
        }

        if !out.is_empty() {
            return Err(out);
        }

        serde_json::from_value(input.clone())
            .map_err(|err| Violations::malformed("$", err.to_string()))
    }

    /// validate_params
    ///
    /// Same as `validate` for query-string parameters, which arrive as strings and
    /// are coerced to each field's declared type first.
    pub fn validate_params<T: DeserializeOwned>(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<T, Violations> {
        let object: Map<String, Value> = params
            .iter()
            .map(|(key, raw)| {
                let value = match self.fields.iter().find(|f| f.name == key) {
                    Some(field) => field.coerce(raw),
                    None => Value::String(raw.clone()),
                };
                (key.clone(), value)
            })
            .collect();
        self.validate(&Value::Object(object))
    }
}
