//! Field declarations and lax value coercion.
//!
//! Records arrive as loosely-typed JSON rows, often after a trip through a
//! parquet table, so coercion accepts the representations such a trip
//! produces: integral floats for integers, numeric strings, `t`/`f` booleans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::io::FileReference;

/// The kind of a declared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Str,
    Choice { choices: Vec<String> },
    FileRef,
}

impl FieldKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Int | FieldKind::Float)
    }

    pub fn is_file_ref(&self) -> bool {
        matches!(self, FieldKind::FileRef)
    }
}

/// Numeric bounds on a field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ge: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub le: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
}

impl Bounds {
    pub fn is_empty(&self) -> bool {
        self.ge.is_none() && self.gt.is_none() && self.le.is_none() && self.lt.is_none()
    }

    /// Describe the first bound `value` violates
    fn check(&self, value: f64) -> Result<(), String> {
        if value.is_nan() && !self.is_empty() {
            return Err("must be a number within bounds, got NaN".to_string());
        }
        if let Some(ge) = self.ge
            && value < ge
        {
            return Err(format!("must be >= {ge}, got {value}"));
        }
        if let Some(gt) = self.gt
            && value <= gt
        {
            return Err(format!("must be > {gt}, got {value}"));
        }
        if let Some(le) = self.le
            && value > le
        {
            return Err(format!("must be <= {le}, got {value}"));
        }
        if let Some(lt) = self.lt
            && value >= lt
        {
            return Err(format!("must be < {lt}, got {value}"));
        }
        Ok(())
    }
}

/// A declared field: name, kind, constraints, and documentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(flatten)]
    pub bounds: Bounds,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            bounds: Bounds::default(),
            description: None,
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Bool)
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn str(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Str)
    }

    pub fn file_ref(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::FileRef)
    }

    pub fn choice<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            FieldKind::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn ge(mut self, bound: f64) -> Self {
        self.bounds.ge = Some(bound);
        self
    }

    pub fn gt(mut self, bound: f64) -> Self {
        self.bounds.gt = Some(bound);
        self
    }

    pub fn le(mut self, bound: f64) -> Self {
        self.bounds.le = Some(bound);
        self
    }

    pub fn lt(mut self, bound: f64) -> Self {
        self.bounds.lt = Some(bound);
        self
    }

    /// Allow the field to be missing or null
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Value used when the field is missing; implies optional
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.required = false;
        self.default = Some(value.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate and coerce one raw value; `None` means the field was absent
    pub fn coerce(&self, raw: Option<&Value>) -> Result<FieldValue, String> {
        let raw = match raw {
            Some(Value::Null) | None => match &self.default {
                Some(default) => default,
                None if self.required => return Err("field required".to_string()),
                None => return Ok(FieldValue::Null),
            },
            Some(value) => value,
        };

        let value = match &self.kind {
            FieldKind::Bool => FieldValue::Bool(coerce_bool(raw)?),
            FieldKind::Int => FieldValue::Int(coerce_int(raw)?),
            FieldKind::Float => FieldValue::Float(coerce_float(raw)?),
            FieldKind::Str => FieldValue::Str(coerce_str(raw)?),
            FieldKind::Choice { choices } => {
                let value = coerce_str(raw)?;
                if !choices.contains(&value) {
                    return Err(format!("must be one of {choices:?}, got '{value}'"));
                }
                FieldValue::Str(value)
            }
            FieldKind::FileRef => {
                let raw = coerce_str(raw)?;
                let reference =
                    FileReference::parse(&raw).map_err(|e| format!("invalid file reference: {e}"))?;
                FieldValue::FileRef(reference)
            }
        };

        match &value {
            FieldValue::Int(n) => self.bounds.check(*n as f64)?,
            FieldValue::Float(x) => self.bounds.check(*x)?,
            _ => {}
        }

        Ok(value)
    }
}

/// A validated, typed field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FileRef(FileReference),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(n) => Value::from(*n),
            FieldValue::Float(x) => Value::from(*x),
            FieldValue::Str(s) => Value::String(s.clone()),
            FieldValue::FileRef(reference) => Value::String(reference.to_string()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(x) => Some(*x),
            FieldValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_file_ref(&self) -> Option<&FileReference> {
        match self {
            FieldValue::FileRef(reference) => Some(reference),
            _ => None,
        }
    }
}

fn describe(raw: &Value) -> String {
    match raw {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

/// Parse boolean values, supporting both PostgreSQL-style (t/f) and standard (true/false) formats
fn coerce_bool(raw: &Value) -> Result<bool, String> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Ok(true),
            Some(0) => Ok(false),
            _ => Err(format!("expected a boolean, got {}", describe(raw))),
        },
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "t" | "true" | "1" => Ok(true),
            "f" | "false" | "0" => Ok(false),
            _ => Err(format!("expected a boolean, got {}", describe(raw))),
        },
        _ => Err(format!("expected a boolean, got {}", describe(raw))),
    }
}

fn coerce_int(raw: &Value) -> Result<i64, String> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(x) = n.as_f64()
                && x.fract() == 0.0
                && x.abs() < i64::MAX as f64
            {
                Ok(x as i64)
            } else {
                Err(format!("expected an integer, got {}", describe(raw)))
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("expected an integer, got {}", describe(raw))),
        _ => Err(format!("expected an integer, got {}", describe(raw))),
    }
}

fn coerce_float(raw: &Value) -> Result<f64, String> {
    let value = match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("expected a number, got {}", describe(raw)))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("expected a number, got {}", describe(raw)))?,
        _ => return Err(format!("expected a number, got {}", describe(raw))),
    };
    // JSON cannot carry NaN or infinities, so rows would not survive a round trip
    if !value.is_finite() {
        return Err(format!("expected a finite number, got {}", describe(raw)));
    }
    Ok(value)
}

fn coerce_str(raw: &Value) -> Result<String, String> {
    match raw {
        Value::String(s) => Ok(s.clone()),
        _ => Err(format!("expected a string, got {}", describe(raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_coercion() {
        let field = FieldSpec::int("n");
        assert_eq!(field.coerce(Some(&json!(3))).unwrap(), FieldValue::Int(3));
        assert_eq!(field.coerce(Some(&json!(3.0))).unwrap(), FieldValue::Int(3));
        assert_eq!(field.coerce(Some(&json!(" 42 "))).unwrap(), FieldValue::Int(42));
        assert!(field.coerce(Some(&json!(3.5))).is_err());
        assert!(field.coerce(Some(&json!("three"))).is_err());
        assert!(field.coerce(Some(&json!(true))).is_err());
    }

    #[test]
    fn test_float_accepts_integers() {
        let field = FieldSpec::float("x");
        assert_eq!(field.coerce(Some(&json!(2))).unwrap(), FieldValue::Float(2.0));
        assert_eq!(field.coerce(Some(&json!("2.5"))).unwrap(), FieldValue::Float(2.5));
    }

    #[test]
    fn test_bool_formats() {
        let field = FieldSpec::bool("flag");
        for raw in [json!(true), json!("t"), json!("TRUE"), json!(1), json!("1")] {
            assert_eq!(field.coerce(Some(&raw)).unwrap(), FieldValue::Bool(true));
        }
        for raw in [json!(false), json!("f"), json!("false"), json!(0)] {
            assert_eq!(field.coerce(Some(&raw)).unwrap(), FieldValue::Bool(false));
        }
        assert!(field.coerce(Some(&json!("yes"))).is_err());
    }

    #[test]
    fn test_bounds() {
        let field = FieldSpec::float("ratio").ge(0.0).lt(1.0);
        assert!(field.coerce(Some(&json!(0.0))).is_ok());
        assert!(field.coerce(Some(&json!(0.99))).is_ok());
        let err = field.coerce(Some(&json!(1.0))).unwrap_err();
        assert!(err.contains("must be < 1"));
        assert!(field.coerce(Some(&json!(-0.1))).is_err());

        let count = FieldSpec::int("count").gt(0.0).le(10.0);
        assert!(count.coerce(Some(&json!(0))).is_err());
        assert!(count.coerce(Some(&json!(10))).is_ok());
        assert!(count.coerce(Some(&json!(11))).is_err());
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        let bounded = FieldSpec::float("x").ge(0.0).le(1.0);
        for raw in ["NaN", "nan", "inf", "-infinity"] {
            let err = bounded.coerce(Some(&json!(raw))).unwrap_err();
            assert!(err.contains("finite"), "{}: {}", raw, err);
        }

        let unbounded = FieldSpec::float("y");
        assert!(unbounded.coerce(Some(&json!("NaN"))).is_err());
        assert_eq!(unbounded.coerce(Some(&json!("0.5"))).unwrap(), FieldValue::Float(0.5));

        let bounds = Bounds {
            ge: Some(0.0),
            ..Bounds::default()
        };
        assert!(bounds.check(f64::NAN).is_err());
    }

    #[test]
    fn test_required_optional_default() {
        let required = FieldSpec::str("name");
        assert_eq!(required.coerce(None).unwrap_err(), "field required");
        assert_eq!(required.coerce(Some(&Value::Null)).unwrap_err(), "field required");

        let optional = FieldSpec::str("name").optional();
        assert_eq!(optional.coerce(None).unwrap(), FieldValue::Null);

        let defaulted = FieldSpec::int("n").default_value(5);
        assert_eq!(defaulted.coerce(None).unwrap(), FieldValue::Int(5));
        assert!(!defaulted.required);
    }

    #[test]
    fn test_choice() {
        let field = FieldSpec::choice("climate", ["hot", "cold"]);
        assert_eq!(
            field.coerce(Some(&json!("hot"))).unwrap(),
            FieldValue::Str("hot".to_string())
        );
        let err = field.coerce(Some(&json!("mild"))).unwrap_err();
        assert!(err.contains("must be one of"));
    }

    #[test]
    fn test_file_ref() {
        let field = FieldSpec::file_ref("weather");
        let value = field.coerce(Some(&json!("s3://bucket/w.epw"))).unwrap();
        assert!(matches!(value, FieldValue::FileRef(FileReference::ObjectUri(_))));
        assert!(field.coerce(Some(&json!("ftp://host/w.epw"))).is_err());
        assert!(field.coerce(Some(&json!(12))).is_err());
    }

    #[test]
    fn test_field_document_shape() {
        let field = FieldSpec::int("n").ge(0.0).describe("a count");
        let doc = serde_json::to_value(&field).unwrap();
        assert_eq!(
            doc,
            json!({"name": "n", "type": "int", "required": true, "ge": 0.0, "description": "a count"})
        );
    }
}
