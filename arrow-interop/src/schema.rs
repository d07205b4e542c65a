//! Arrow schema construction from column views and name metadata.

use std::sync::Arc;

use arrow_schema::ffi::FFI_ArrowSchema;
use arrow_schema::{DataType as ArrowType, Field, Fields, Schema};
use tracing::{debug, info};

use crate::column::{ColumnMetadata, ColumnView, TableView, TypeId};
use crate::error::{InteropError, Result};
use crate::type_mapper::to_arrow_type;

/// Default name of a list's element field.
pub const LIST_ELEMENT_NAME: &str = "element";
/// Default name of a dictionary's value field.
pub const DICTIONARY_KEYS_NAME: &str = "keys";

/// Build the Arrow field for one column, recursing into children.
///
/// The field is nullable exactly when the column carries a validity mask.
pub fn build_field(column: &ColumnView, metadata: &ColumnMetadata) -> Result<Field> {
    let nullable = column.nullable();
    let id = column.dtype().id();

    // A nested column without children is untyped.
    if id == TypeId::Empty || (id.is_nested() && column.num_children() == 0) {
        return Ok(Field::new(&metadata.name, ArrowType::Null, true));
    }

    let data_type = match id {
        TypeId::List => {
            let element = column.child(1).ok_or_else(|| {
                InteropError::ShapeMismatch(format!(
                    "list column '{}' has offsets but no element child",
                    metadata.name
                ))
            })?;
            let element_meta = child_metadata(metadata, 0, LIST_ELEMENT_NAME);
            ArrowType::List(Arc::new(build_field(element, &element_meta)?))
        }
        TypeId::Struct => {
            if metadata.children.len() != column.num_children() {
                return Err(InteropError::ShapeMismatch(format!(
                    "struct column '{}' has {} children but metadata names {}",
                    metadata.name,
                    column.num_children(),
                    metadata.children.len()
                )));
            }
            let fields = column
                .children()
                .iter()
                .zip(&metadata.children)
                .map(|(child, meta)| build_field(child, meta))
                .collect::<Result<Vec<_>>>()?;
            ArrowType::Struct(Fields::from(fields))
        }
        TypeId::Dictionary32 => {
            let (Some(indices), Some(keys)) = (column.child(0), column.child(1)) else {
                return Err(InteropError::ShapeMismatch(format!(
                    "dictionary column '{}' needs indices and keys",
                    metadata.name
                )));
            };
            if !indices.dtype().id().is_integer() {
                return Err(InteropError::UnsupportedType(format!(
                    "dictionary indices of '{}' are {:?}",
                    metadata.name,
                    indices.dtype().id()
                )));
            }
            let keys_meta = child_metadata(metadata, 0, DICTIONARY_KEYS_NAME);
            let values = build_field(keys, &keys_meta)?;
            ArrowType::Dictionary(
                Box::new(to_arrow_type(&indices.dtype())?),
                Box::new(values.data_type().clone()),
            )
        }
        _ => to_arrow_type(&column.dtype())?,
    };

    debug!("Field '{}': {:?} -> {}", metadata.name, id, data_type);
    Ok(Field::new(&metadata.name, data_type, nullable))
}

fn child_metadata(metadata: &ColumnMetadata, i: usize, default_name: &str) -> ColumnMetadata {
    metadata
        .children
        .get(i)
        .cloned()
        .unwrap_or_else(|| ColumnMetadata::new(default_name))
}

/// Arrow schema with one field per table column.
pub fn to_arrow_fields(table: &TableView, metadata: &[ColumnMetadata]) -> Result<Schema> {
    if metadata.len() != table.num_columns() {
        return Err(InteropError::ShapeMismatch(format!(
            "table has {} columns but metadata names {}",
            table.num_columns(),
            metadata.len()
        )));
    }
    let fields = table
        .columns()
        .iter()
        .zip(metadata)
        .map(|(column, meta)| build_field(column, meta))
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(fields))
}

/// Arrow C `ArrowSchema` for the table: a struct (`+s`) whose children are
/// the column fields.
pub fn to_arrow_schema(table: &TableView, metadata: &[ColumnMetadata]) -> Result<FFI_ArrowSchema> {
    let schema = to_arrow_fields(table, metadata)?;
    info!("Exporting Arrow schema with {} fields", schema.fields().len());
    Ok(FFI_ArrowSchema::try_from(&schema)?)
}
