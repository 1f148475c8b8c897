//! Conversion between loosely-typed JSON rows and Arrow RecordBatches.
//!
//! Rows become columns with one inferred type per column; columns come back as
//! JSON values, with nulls represented as `Value::Null`.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::*;
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type,
    Int64Type, Schema, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow::record_batch::RecordBatch;
use serde_json::{Number, Value};

use crate::schema::Row;

/// Column types produced when building tables from rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }

    /// Type of a single value; `None` for nulls
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Int64),
            Value::Number(_) => Some(ColumnType::Float64),
            _ => Some(ColumnType::Utf8),
        }
    }

    /// Type of an existing Arrow column; `None` for all-null columns
    pub fn of_data_type(data_type: &DataType) -> Option<ColumnType> {
        match data_type {
            DataType::Null => None,
            DataType::Boolean => Some(ColumnType::Boolean),
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => Some(ColumnType::Int64),
            DataType::Float16 | DataType::Float32 | DataType::Float64 => Some(ColumnType::Float64),
            _ => Some(ColumnType::Utf8),
        }
    }

    /// Find a common type that can represent both types
    ///
    /// Integers widen to floats; any other mismatch falls back to strings.
    pub fn common_type(&self, other: &ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => *a,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => Utf8,
        }
    }

    /// Fold many optional types into one, defaulting to strings
    pub fn unify(types: impl IntoIterator<Item = Option<ColumnType>>) -> ColumnType {
        types
            .into_iter()
            .flatten()
            .reduce(|a, b| a.common_type(&b))
            .unwrap_or(ColumnType::Utf8)
    }
}

/// Build a RecordBatch from rows; columns appear in first-seen order
pub fn rows_to_record_batch(rows: &[Row]) -> Result<RecordBatch> {
    let mut names: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !names.contains(&key.as_str()) {
                names.push(key);
            }
        }
    }

    if names.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let mut fields = Vec::with_capacity(names.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(names.len());

    for name in names {
        let values: Vec<&Value> = rows
            .iter()
            .map(|row| row.get(name).unwrap_or(&Value::Null))
            .collect();
        let column_type = ColumnType::unify(values.iter().map(|v| ColumnType::of_value(v)));
        let array = values_to_array(&values, column_type)
            .with_context(|| format!("Failed to build column {}", name))?;

        fields.push(Field::new(name, column_type.data_type(), true));
        columns.push(array);
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("Failed to assemble record batch")?;
    Ok(batch)
}

fn values_to_array(values: &[&Value], column_type: ColumnType) -> Result<ArrayRef> {
    let array: ArrayRef = match column_type {
        ColumnType::Boolean => Arc::new(BooleanArray::from(
            values.iter().map(|v| v.as_bool()).collect::<Vec<_>>(),
        )),
        ColumnType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Number(n) => n
                        .as_i64()
                        .map(Some)
                        .with_context(|| format!("Integer {} does not fit in 64 bits", n)),
                    other => Err(anyhow::anyhow!("Expected an integer, got {}", other)),
                })
                .collect::<Result<Vec<_>>>()?,
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from(
            values.iter().map(|v| v.as_f64()).collect::<Vec<_>>(),
        )),
        ColumnType::Utf8 => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>(),
        )),
    };
    Ok(array)
}

/// Convert a RecordBatch to rows keyed by column name
pub fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let num_rows = batch.num_rows();
    let schema = batch.schema();

    let mut columns: Vec<Vec<Value>> = Vec::with_capacity(batch.num_columns());
    for (col_idx, field) in schema.fields().iter().enumerate() {
        let array = batch.column(col_idx);
        let values = array_to_values(array.as_ref()).with_context(|| {
            format!(
                "Failed to convert column {} ({:?}) to values",
                field.name(),
                array.data_type()
            )
        })?;
        columns.push(values);
    }

    // Transpose to rows
    let mut rows = Vec::with_capacity(num_rows);
    for row_idx in 0..num_rows {
        let row = schema
            .fields()
            .iter()
            .zip(&columns)
            .map(|(field, column)| (field.name().clone(), column[row_idx].clone()))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

/// Convert an Arrow array to JSON values
fn array_to_values(array: &dyn Array) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(array.len());

    match array.data_type() {
        DataType::Null => values.resize(array.len(), Value::Null),
        DataType::Boolean => {
            let arr = as_boolean_array(array);
            for i in 0..arr.len() {
                values.push(if arr.is_null(i) {
                    Value::Null
                } else {
                    Value::Bool(arr.value(i))
                });
            }
        }
        DataType::Int8 => convert_primitive::<Int8Type>(array, &mut values),
        DataType::Int16 => convert_primitive::<Int16Type>(array, &mut values),
        DataType::Int32 => convert_primitive::<Int32Type>(array, &mut values),
        DataType::Int64 => convert_primitive::<Int64Type>(array, &mut values),
        DataType::UInt8 => convert_primitive::<UInt8Type>(array, &mut values),
        DataType::UInt16 => convert_primitive::<UInt16Type>(array, &mut values),
        DataType::UInt32 => convert_primitive::<UInt32Type>(array, &mut values),
        DataType::UInt64 => convert_primitive::<UInt64Type>(array, &mut values),
        DataType::Float32 => {
            let arr = as_primitive_array::<Float32Type>(array);
            for i in 0..arr.len() {
                values.push(if arr.is_null(i) {
                    Value::Null
                } else {
                    float_value(arr.value(i) as f64)
                });
            }
        }
        DataType::Float64 => {
            let arr = as_primitive_array::<Float64Type>(array);
            for i in 0..arr.len() {
                values.push(if arr.is_null(i) {
                    Value::Null
                } else {
                    float_value(arr.value(i))
                });
            }
        }
        DataType::Utf8 => {
            let arr = as_string_array(array);
            for i in 0..arr.len() {
                values.push(if arr.is_null(i) {
                    Value::Null
                } else {
                    Value::String(arr.value(i).to_string())
                });
            }
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unsupported array type for conversion: {:?}",
                array.data_type()
            ));
        }
    }

    Ok(values)
}

/// Non-finite floats have no JSON representation and become null
fn float_value(x: f64) -> Value {
    Number::from_f64(x).map_or(Value::Null, Value::Number)
}

/// Helper to convert primitive integer arrays
fn convert_primitive<T: ArrowPrimitiveType>(array: &dyn Array, values: &mut Vec<Value>)
where
    T::Native: Into<Value>,
{
    let arr = as_primitive_array::<T>(array);
    for i in 0..arr.len() {
        values.push(if arr.is_null(i) {
            Value::Null
        } else {
            arr.value(i).into()
        });
    }
}
