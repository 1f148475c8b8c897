//! Typed input and output records for experiments

pub mod field;
pub mod record;

pub use field::{Bounds, FieldKind, FieldSpec, FieldValue};
pub use record::{
    FILE_REFS_TABLE, FieldViolation, InputRecord, OutputRecord, OutputValues, Record,
    RecordFamily, RecordSchema, Row, SCALARS_TABLE, SORT_INDEX, SORT_SUBINDEX, SchemaDocument,
    ValidationError,
};
