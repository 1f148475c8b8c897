use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::field::{FieldKind, FieldSpec, FieldValue};
use crate::error::SweepError;
use crate::io::FileReference;

/// A loosely-typed row, as read from a table or supplied by a caller
pub type Row = Map<String, Value>;

pub const EXPERIMENT_ID: &str = "experiment_id";
pub const SORT_INDEX: &str = "sort_index";
pub const WORKFLOW_RUN_ID: &str = "workflow_run_id";
pub const ROOT_WORKFLOW_RUN_ID: &str = "root_workflow_run_id";
pub const SORT_SUBINDEX: &str = "sort_subindex";

/// Fields every input record carries in addition to its declared ones
pub const SYSTEM_FIELDS: [&str; 4] = [EXPERIMENT_ID, SORT_INDEX, WORKFLOW_RUN_ID, ROOT_WORKFLOW_RUN_ID];

pub const SCALARS_TABLE: &str = "scalars";
pub const FILE_REFS_TABLE: &str = "result_file_refs";

/// Table names produced by every sweep and so unavailable for auxiliary tables
pub const RESERVED_TABLES: [&str; 2] = [SCALARS_TABLE, FILE_REFS_TABLE];

/// One violated constraint
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    /// Position of the offending row when validating a batch
    pub row: Option<usize>,
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(row) = self.row {
            write!(f, "row {}: ", row)?;
        }
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found while validating one record or one batch of records
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{subject} failed validation ({} violation(s)): {}", .violations.len(), join_violations(.violations))]
pub struct ValidationError {
    pub subject: String,
    pub violations: Vec<FieldViolation>,
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn new(subject: impl Into<String>, violations: Vec<FieldViolation>) -> Self {
        Self {
            subject: subject.into(),
            violations,
        }
    }

    pub fn single(subject: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            subject,
            vec![FieldViolation {
                row: None,
                field: field.into(),
                message: message.into(),
            }],
        )
    }

    /// Tag every violation with the row it came from
    pub fn at_row(mut self, row: usize) -> Self {
        for violation in &mut self.violations {
            violation.row = Some(row);
        }
        self
    }
}

/// Validated values in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.values.iter_mut().find(|(field, _)| field == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_row(&self) -> Row {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

/// Which side of an experiment a schema describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFamily {
    Input,
    Output,
}

/// A typed record definition
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    name: String,
    family: RecordFamily,
    fields: Vec<FieldSpec>,
    aux_tables: Vec<String>,
}

/// Machine-readable description of a schema, persisted with every experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub name: String,
    pub family: RecordFamily,
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux_tables: Vec<String>,
}

impl RecordSchema {
    /// Declare an input schema
    pub fn input(name: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, SweepError> {
        let schema = Self {
            name: name.into(),
            family: RecordFamily::Input,
            fields,
            aux_tables: Vec::new(),
        };
        schema.check()?;
        Ok(schema)
    }

    /// Declare an output schema along with the auxiliary tables its experiments may emit
    pub fn output<I, S>(
        name: impl Into<String>,
        fields: Vec<FieldSpec>,
        aux_tables: I,
    ) -> Result<Self, SweepError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let schema = Self {
            name: name.into(),
            family: RecordFamily::Output,
            fields,
            aux_tables: aux_tables.into_iter().map(Into::into).collect(),
        };
        schema.check()?;
        Ok(schema)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> RecordFamily {
        self.family
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn aux_tables(&self) -> &[String] {
        &self.aux_tables
    }

    pub fn file_ref_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.kind.is_file_ref())
    }

    pub fn has_file_refs(&self) -> bool {
        self.file_ref_fields().next().is_some()
    }

    /// Reject declarations that could never validate a record
    fn check(&self) -> Result<(), SweepError> {
        let invalid = |message: String| SweepError::InvalidSchema(format!("{}: {}", self.name, message));
        let mut seen = HashSet::new();

        for field in &self.fields {
            if field.name.is_empty() {
                return Err(invalid("field names must not be empty".to_string()));
            }
            if SYSTEM_FIELDS.contains(&field.name.as_str()) || field.name == SORT_SUBINDEX {
                return Err(invalid(format!("'{}' is a reserved field name", field.name)));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("field '{}' is declared twice", field.name)));
            }
            if !field.bounds.is_empty() && !field.kind.is_numeric() {
                return Err(invalid(format!(
                    "field '{}' has numeric bounds but is not numeric",
                    field.name
                )));
            }
            if let FieldKind::Choice { choices } = &field.kind
                && choices.is_empty()
            {
                return Err(invalid(format!("choice field '{}' has no choices", field.name)));
            }
            if field.default.is_some() {
                field
                    .coerce(None)
                    .map_err(|e| invalid(format!("default of '{}' is invalid: {}", field.name, e)))?;
            }
        }

        let mut tables = HashSet::new();
        for table in &self.aux_tables {
            if self.family == RecordFamily::Input {
                return Err(invalid("input schemas cannot declare auxiliary tables".to_string()));
            }
            if table.is_empty() || table.contains('/') {
                return Err(invalid(format!("'{}' is not a valid table name", table)));
            }
            if RESERVED_TABLES.contains(&table.as_str()) {
                return Err(invalid(format!("'{}' is a reserved table name", table)));
            }
            if !tables.insert(table.as_str()) {
                return Err(invalid(format!("table '{}' is declared twice", table)));
            }
        }

        Ok(())
    }

    /// Validate a loose row against the declared fields, collecting every violation
    pub fn validate(&self, row: &Row) -> Result<Record, ValidationError> {
        let mut violations = Vec::new();
        let mut record = Record::default();

        for field in &self.fields {
            match field.coerce(row.get(&field.name)) {
                Ok(value) => record.values.push((field.name.clone(), value)),
                Err(message) => violations.push(FieldViolation {
                    row: None,
                    field: field.name.clone(),
                    message,
                }),
            }
        }

        for key in row.keys() {
            if self.field(key).is_none() {
                violations.push(FieldViolation {
                    row: None,
                    field: key.clone(),
                    message: "unknown field".to_string(),
                });
            }
        }

        if violations.is_empty() {
            Ok(record)
        } else {
            Err(ValidationError::new(self.name.clone(), violations))
        }
    }

    /// Validate what an experiment returned
    pub fn validate_output(&self, values: OutputValues) -> Result<OutputRecord, ValidationError> {
        let record = self.validate(&values.values);
        let mut violations = match &record {
            Ok(_) => Vec::new(),
            Err(e) => e.violations.clone(),
        };

        for table in values.tables.keys() {
            if !self.aux_tables.contains(table) {
                violations.push(FieldViolation {
                    row: None,
                    field: table.clone(),
                    message: "undeclared auxiliary table".to_string(),
                });
            }
        }

        match record {
            Ok(fields) if violations.is_empty() => Ok(OutputRecord {
                fields,
                tables: values.tables,
            }),
            _ => Err(ValidationError::new(self.name.clone(), violations)),
        }
    }

    /// Describe the schema; input schemas list their system fields first
    pub fn document(&self) -> SchemaDocument {
        let mut fields = Vec::new();
        if self.family == RecordFamily::Input {
            fields.push(
                FieldSpec::str(EXPERIMENT_ID).describe("Experiment this record belongs to"),
            );
            fields.push(
                FieldSpec::int(SORT_INDEX)
                    .ge(0.0)
                    .describe("Position of the record within its experiment"),
            );
            fields.push(
                FieldSpec::str(WORKFLOW_RUN_ID)
                    .optional()
                    .describe("Run that executed this record"),
            );
            fields.push(
                FieldSpec::str(ROOT_WORKFLOW_RUN_ID)
                    .optional()
                    .describe("Run of the root scatter/gather node"),
            );
        }
        fields.extend(self.fields.iter().cloned());

        SchemaDocument {
            name: self.name.clone(),
            family: self.family,
            fields,
            aux_tables: self.aux_tables.clone(),
        }
    }
}

/// A fully-validated leaf input
#[derive(Debug, Clone, PartialEq)]
pub struct InputRecord {
    pub experiment_id: String,
    pub sort_index: u64,
    pub workflow_run_id: Option<String>,
    pub root_workflow_run_id: Option<String>,
    pub fields: Record,
    /// Local copies of file-reference fields, filled in before execution
    local_files: BTreeMap<String, PathBuf>,
}

impl InputRecord {
    pub fn new(experiment_id: impl Into<String>, sort_index: u64, fields: Record) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            sort_index,
            workflow_run_id: None,
            root_workflow_run_id: None,
            fields,
            local_files: BTreeMap::new(),
        }
    }

    /// Split a stored row into system fields and schema-validated fields
    pub fn from_row(schema: &RecordSchema, row: &Row) -> Result<Self, ValidationError> {
        let mut violations = Vec::new();
        let mut user_row = row.clone();

        let experiment_id = FieldSpec::str(EXPERIMENT_ID).coerce(user_row.remove(EXPERIMENT_ID).as_ref());
        let sort_index = FieldSpec::int(SORT_INDEX).ge(0.0).coerce(user_row.remove(SORT_INDEX).as_ref());
        let workflow_run_id =
            FieldSpec::str(WORKFLOW_RUN_ID).optional().coerce(user_row.remove(WORKFLOW_RUN_ID).as_ref());
        let root_workflow_run_id = FieldSpec::str(ROOT_WORKFLOW_RUN_ID)
            .optional()
            .coerce(user_row.remove(ROOT_WORKFLOW_RUN_ID).as_ref());

        let mut system = |name: &str, result: Result<FieldValue, String>| match result {
            Ok(value) => Some(value),
            Err(message) => {
                violations.push(FieldViolation {
                    row: None,
                    field: name.to_string(),
                    message,
                });
                None
            }
        };
        let experiment_id = system(EXPERIMENT_ID, experiment_id);
        let sort_index = system(SORT_INDEX, sort_index);
        let workflow_run_id = system(WORKFLOW_RUN_ID, workflow_run_id);
        let root_workflow_run_id = system(ROOT_WORKFLOW_RUN_ID, root_workflow_run_id);

        let fields = match schema.validate(&user_row) {
            Ok(fields) => Some(fields),
            Err(e) => {
                violations.extend(e.violations);
                None
            }
        };

        match (experiment_id, sort_index, fields) {
            (Some(FieldValue::Str(experiment_id)), Some(FieldValue::Int(sort_index)), Some(fields))
                if violations.is_empty() =>
            {
                Ok(Self {
                    experiment_id,
                    sort_index: sort_index as u64,
                    workflow_run_id: workflow_run_id.and_then(|v| v.as_str().map(str::to_string)),
                    root_workflow_run_id: root_workflow_run_id
                        .and_then(|v| v.as_str().map(str::to_string)),
                    fields,
                    local_files: BTreeMap::new(),
                })
            }
            _ => Err(ValidationError::new(schema.name(), violations)),
        }
    }

    /// System fields first, then declared fields
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(EXPERIMENT_ID.to_string(), Value::from(self.experiment_id.clone()));
        row.insert(SORT_INDEX.to_string(), Value::from(self.sort_index));
        row.insert(
            WORKFLOW_RUN_ID.to_string(),
            self.workflow_run_id.clone().map_or(Value::Null, Value::from),
        );
        row.insert(
            ROOT_WORKFLOW_RUN_ID.to_string(),
            self.root_workflow_run_id.clone().map_or(Value::Null, Value::from),
        );
        row.extend(self.fields.to_row());
        row
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn file_refs(&self) -> impl Iterator<Item = (&str, &FileReference)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| value.as_file_ref().map(|r| (name, r)))
    }

    /// Local copy of a file-reference field, available during execution
    pub fn local_file(&self, name: &str) -> Option<&Path> {
        self.local_files.get(name).map(PathBuf::as_path)
    }

    pub(crate) fn set_local_file(&mut self, name: &str, path: PathBuf) {
        self.local_files.insert(name.to_string(), path);
    }

    /// Convert into a caller-defined struct
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.to_row()))
    }
}

/// What an experiment returns, before validation
///
/// File-reference fields may point at files inside the working directory;
/// they are uploaded after the experiment returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputValues {
    values: Row,
    tables: BTreeMap<String, Vec<Row>>,
}

impl OutputValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Set a file-reference field to a local path
    pub fn file(self, name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.set(name, path)
    }

    /// Attach rows of an auxiliary table
    pub fn table(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.tables.entry(name.into()).or_default().extend(rows);
        self
    }

    pub fn push_row(&mut self, table: impl Into<String>, row: Row) {
        self.tables.entry(table.into()).or_default().push(row);
    }
}

/// A validated experiment result
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub fields: Record,
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl OutputRecord {
    /// Non-file fields, keyed by name
    pub fn scalars(&self, schema: &RecordSchema) -> Row {
        self.fields
            .iter()
            .filter(|(name, _)| !schema.field(name).is_some_and(|f| f.kind.is_file_ref()))
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }

    /// File-reference fields, keyed by name
    pub fn file_refs(&self, schema: &RecordSchema) -> Row {
        self.fields
            .iter()
            .filter(|(name, _)| schema.field(name).is_some_and(|f| f.kind.is_file_ref()))
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn building_schema() -> RecordSchema {
        RecordSchema::input(
            "BuildingSpec",
            vec![
                FieldSpec::float("r_value").gt(0.0),
                FieldSpec::int("floors").ge(1.0).le(100.0),
                FieldSpec::choice("climate", ["hot", "cold"]),
                FieldSpec::file_ref("weather").optional(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_validate_collects_all_violations() {
        let schema = building_schema();
        let err = schema
            .validate(&row(json!({
                "r_value": -1.0,
                "floors": "many",
                "color": "blue"
            })))
            .unwrap_err();

        let fields: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["r_value", "floors", "climate", "color"]);
        assert!(err.to_string().contains("4 violation(s)"));
    }

    #[test]
    fn test_validate_preserves_declaration_order() {
        let schema = building_schema();
        let record = schema
            .validate(&row(json!({"climate": "hot", "floors": 3, "r_value": 2})))
            .unwrap();
        let names: Vec<&str> = record.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["r_value", "floors", "climate", "weather"]);
        assert_eq!(record.get("r_value"), Some(&FieldValue::Float(2.0)));
        assert_eq!(record.get("weather"), Some(&FieldValue::Null));
    }

    #[test]
    fn test_reserved_and_duplicate_names_rejected() {
        let reserved = RecordSchema::input("Bad", vec![FieldSpec::int(SORT_INDEX)]);
        assert!(matches!(reserved, Err(SweepError::InvalidSchema(_))));

        let duplicate = RecordSchema::input("Bad", vec![FieldSpec::int("a"), FieldSpec::float("a")]);
        assert!(duplicate.is_err());

        let table = RecordSchema::output("Out", vec![], ["scalars"]);
        assert!(table.is_err());

        let bounded_str = RecordSchema::input("Bad", vec![FieldSpec::str("s").ge(1.0)]);
        assert!(bounded_str.is_err());

        let bad_default = RecordSchema::input("Bad", vec![FieldSpec::int("n").ge(0.0).default_value(-1)]);
        assert!(bad_default.is_err());
    }

    #[test]
    fn test_input_record_from_row() {
        let schema = building_schema();
        let record = InputRecord::from_row(
            &schema,
            &row(json!({
                "experiment_id": "exp/v1.0.0/ts",
                "sort_index": 4.0,
                "workflow_run_id": null,
                "r_value": 1.5,
                "floors": 2,
                "climate": "cold",
                "weather": "s3://bucket/w.epw"
            })),
        )
        .unwrap();

        assert_eq!(record.experiment_id, "exp/v1.0.0/ts");
        assert_eq!(record.sort_index, 4);
        assert_eq!(record.workflow_run_id, None);
        assert_eq!(record.file_refs().count(), 1);

        let back = record.to_row();
        let keys: Vec<&String> = back.keys().collect();
        assert_eq!(
            keys,
            vec![
                "experiment_id",
                "sort_index",
                "workflow_run_id",
                "root_workflow_run_id",
                "r_value",
                "floors",
                "climate",
                "weather"
            ]
        );
    }

    #[test]
    fn test_input_record_requires_system_fields() {
        let schema = building_schema();
        let err = InputRecord::from_row(
            &schema,
            &row(json!({"sort_index": -1, "r_value": 1.0, "floors": 1, "climate": "hot"})),
        )
        .unwrap_err();
        let fields: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["experiment_id", "sort_index"]);
    }

    #[test]
    fn test_deserialize_into_struct() {
        #[derive(Deserialize)]
        struct Spec {
            sort_index: u64,
            r_value: f64,
            climate: String,
        }

        let schema = building_schema();
        let fields = schema
            .validate(&row(json!({"r_value": 3, "floors": 1, "climate": "hot"})))
            .unwrap();
        let record = InputRecord::new("exp", 9, fields);
        let spec: Spec = record.deserialize().unwrap();
        assert_eq!(spec.sort_index, 9);
        assert_eq!(spec.r_value, 3.0);
        assert_eq!(spec.climate, "hot");
    }

    #[test]
    fn test_validate_output() {
        let schema = RecordSchema::output(
            "Result",
            vec![FieldSpec::float("energy"), FieldSpec::file_ref("report")],
            ["timeseries"],
        )
        .unwrap();

        let output = schema
            .validate_output(
                OutputValues::new()
                    .set("energy", 12.5)
                    .file("report", "/tmp/work/report.txt")
                    .table("timeseries", vec![row(json!({"hour": 0, "kw": 1.0}))]),
            )
            .unwrap();
        assert_eq!(output.scalars(&schema), row(json!({"energy": 12.5})));
        assert_eq!(output.file_refs(&schema), row(json!({"report": "/tmp/work/report.txt"})));
        assert_eq!(output.tables["timeseries"].len(), 1);

        let err = schema
            .validate_output(OutputValues::new().set("energy", 1.0).table("undeclared", vec![]))
            .unwrap_err();
        let fields: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["report", "undeclared"]);
    }

    #[test]
    fn test_input_document_lists_system_fields_first() {
        let doc = building_schema().document();
        let names: Vec<&str> = doc.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(&names[..4], &SYSTEM_FIELDS);
        assert_eq!(names.len(), 8);

        let yaml = serde_yaml::to_string(&doc).unwrap();
        let back: SchemaDocument = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, doc);
    }
}
