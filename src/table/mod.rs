//! In-memory result tables and their parquet encoding

pub mod conversion;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use arrow::array::{Array, ArrayRef, Int64Array, new_null_array};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

pub use conversion::ColumnType;
use conversion::{record_batch_to_rows, rows_to_record_batch};

use crate::error::SweepError;
use crate::schema::Row;

/// A rectangular table backed by a single Arrow RecordBatch
#[derive(Debug, Clone)]
pub struct Table {
    batch: RecordBatch,
}

impl Table {
    pub fn empty() -> Self {
        Self {
            batch: RecordBatch::new_empty(Arc::new(Schema::empty())),
        }
    }

    pub fn from_batch(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn from_rows(rows: &[Row]) -> Result<Self> {
        Ok(Self {
            batch: rows_to_record_batch(rows)?,
        })
    }

    pub fn to_rows(&self) -> Result<Vec<Row>> {
        record_batch_to_rows(&self.batch)
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    /// Rows `[offset, offset + len)`
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self> {
        if offset + len > self.num_rows() {
            return Err(anyhow!(
                "Slice [{}, {}) out of bounds for table of {} rows",
                offset,
                offset + len,
                self.num_rows()
            ));
        }
        Ok(Self {
            batch: self.batch.slice(offset, len),
        })
    }

    /// Values of an integer column; fails on nulls
    pub fn int_column(&self, name: &str) -> Result<Vec<i64>> {
        let column = self
            .batch
            .column_by_name(name)
            .with_context(|| format!("Table has no column {}", name))?;
        let column = cast(column, &DataType::Int64)
            .with_context(|| format!("Column {} is not an integer column", name))?;
        let column = column
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("Cast to Int64 produced a different array type")?;

        if column.null_count() > 0 {
            return Err(anyhow!("Column {} contains nulls", name));
        }
        Ok(column.values().iter().copied().collect())
    }

    /// Fail unless `column` is non-decreasing
    pub fn check_sorted(&self, column: &str) -> Result<()> {
        let values = self.int_column(column)?;
        if let Some(pos) = values.windows(2).position(|w| w[0] > w[1]) {
            return Err(SweepError::PartitionInvariant(format!(
                "{} out of order at row {}: {} precedes {}",
                column,
                pos + 1,
                values[pos],
                values[pos + 1]
            ))
            .into());
        }
        Ok(())
    }

    /// Encode as a single parquet file
    pub fn to_parquet(&self) -> Result<Bytes> {
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, self.batch.schema(), None)
            .context("Failed to create parquet writer")?;
        writer
            .write(&self.batch)
            .context("Failed to write parquet row group")?;
        writer.close().context("Failed to finish parquet file")?;
        Ok(Bytes::from(buffer))
    }

    pub fn from_parquet(data: Bytes) -> Result<Self> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(data)
            .context("Failed to open parquet data")?;
        let schema = builder.schema().clone();
        let reader = builder.build().context("Failed to build parquet reader")?;

        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read parquet batches")?;
        let batch = concat_batches(&schema, &batches).context("Failed to combine parquet batches")?;

        Ok(Self { batch })
    }

    /// Stack tables vertically in the given order
    ///
    /// Columns are the union of all inputs in first-seen order; a column
    /// missing from one input is null there, and differing column types are
    /// promoted to a common type. All-null columns do not take part in type
    /// promotion.
    pub fn concat(tables: &[Table]) -> Result<Self> {
        let tables: Vec<&Table> = tables.iter().filter(|t| t.num_columns() > 0).collect();
        if tables.is_empty() {
            return Ok(Self::empty());
        }

        let mut names: Vec<String> = Vec::new();
        for table in &tables {
            for name in table.column_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let fields: Vec<Field> = names
            .iter()
            .map(|name| {
                let column_type = ColumnType::unify(tables.iter().map(|t| {
                    t.batch
                        .column_by_name(name)
                        .filter(|c| c.null_count() < c.len())
                        .and_then(|c| ColumnType::of_data_type(c.data_type()))
                }));
                Field::new(name, column_type.data_type(), true)
            })
            .collect();
        let schema = Arc::new(Schema::new(fields));

        let mut batches = Vec::with_capacity(tables.len());
        for table in &tables {
            let rows = table.num_rows();
            let columns = schema
                .fields()
                .iter()
                .map(|field| -> Result<ArrayRef> {
                    match table.batch.column_by_name(field.name()) {
                        Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
                        Some(column) => cast(column, field.data_type()).with_context(|| {
                            format!(
                                "Failed to cast column {} from {:?} to {:?}",
                                field.name(),
                                column.data_type(),
                                field.data_type()
                            )
                        }),
                        None => Ok(new_null_array(field.data_type(), rows)),
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            batches.push(
                RecordBatch::try_new(schema.clone(), columns)
                    .context("Failed to align table to merged schema")?,
            );
        }

        let batch = concat_batches(&schema, &batches).context("Failed to concatenate tables")?;
        Ok(Self { batch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_parquet_preserves_rows() {
        let input = rows(json!([
            {"sort_index": 0, "energy": 1.5, "label": "a", "ok": true},
            {"sort_index": 1, "energy": null, "label": "b", "ok": false}
        ]));
        let table = Table::from_rows(&input).unwrap();
        let decoded = Table::from_parquet(table.to_parquet().unwrap()).unwrap();
        assert_eq!(decoded.to_rows().unwrap(), input);
    }

    #[test]
    fn test_concat_unions_columns_in_order() {
        let first = Table::from_rows(&rows(json!([{"sort_index": 0, "a": 1}]))).unwrap();
        let second = Table::from_rows(&rows(json!([{"sort_index": 1, "b": "x", "a": 2.5}]))).unwrap();

        let merged = Table::concat(&[first, second]).unwrap();
        assert_eq!(merged.column_names(), vec!["sort_index", "a", "b"]);
        assert_eq!(
            merged.to_rows().unwrap(),
            rows(json!([
                {"sort_index": 0, "a": 1.0, "b": null},
                {"sort_index": 1, "a": 2.5, "b": "x"}
            ]))
        );
    }

    #[test]
    fn test_concat_null_column_takes_other_type() {
        let first = Table::from_rows(&rows(json!([{"sort_index": 0, "v": null}]))).unwrap();
        let second = Table::from_rows(&rows(json!([{"sort_index": 1, "v": 4}]))).unwrap();
        let merged = Table::concat(&[first, second]).unwrap();
        let values: Vec<Value> = merged.to_rows().unwrap().into_iter().map(|r| r["v"].clone()).collect();
        assert_eq!(values, vec![Value::Null, json!(4)]);
    }

    #[test]
    fn test_concat_skips_empty_tables() {
        let table = Table::from_rows(&rows(json!([{"sort_index": 3}]))).unwrap();
        let merged = Table::concat(&[Table::empty(), table, Table::empty()]).unwrap();
        assert_eq!(merged.num_rows(), 1);
        assert!(Table::concat(&[]).unwrap().num_rows() == 0);
    }

    #[test]
    fn test_check_sorted() {
        let sorted = Table::from_rows(&rows(json!([{"i": 0}, {"i": 0}, {"i": 2}]))).unwrap();
        assert!(sorted.check_sorted("i").is_ok());

        let unsorted = Table::from_rows(&rows(json!([{"i": 0}, {"i": 2}, {"i": 1}]))).unwrap();
        let err = unsorted.check_sorted("i").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::PartitionInvariant(_))
        ));
        assert!(sorted.check_sorted("missing").is_err());
    }

    #[test]
    fn test_slice() {
        let table = Table::from_rows(&rows(json!([{"i": 0}, {"i": 1}, {"i": 2}, {"i": 3}]))).unwrap();
        let slice = table.slice(1, 2).unwrap();
        assert_eq!(slice.int_column("i").unwrap(), vec![1, 2]);
        assert!(table.slice(3, 2).is_err());
    }
}
