//! Device-resident columnar storage.
//!
//! A [`DeviceColumn`] owns its data buffer, optional validity bitmask and
//! children until [`DeviceColumn::release`] hands them out. A [`ColumnView`]
//! is a non-owning description of the same layout (raw device pointers) and
//! is what schema building and IPC export walk.
//!
//! # Layout contract
//!
//! ```text
//! data      [ value[0] | value[1] | ... | value[n-1] ]    fixed-width types
//! null mask bit i of the LSB-first 32-bit word stream, 1 = valid, padded to 64 bytes
//! ```
//!
//! Nested columns carry no data buffer; their children are
//! `List = [offsets: Int32 (n + 1), element]`, `String = [offsets]` (with the
//! UTF-8 bytes as data), `Dictionary32 = [indices, keys]`, `Struct = fields`.

use std::mem;
use std::sync::Arc;

use bytemuck::Pod;
use gpu_kernel_compiler::{bitmask_allocation_size, pack_bits};
use gpu_memory_manager::{Device, DeviceBuffer, DevicePtr, MemoryResource, Stream};

use crate::error::{InteropError, Result};

/// Closed set of logical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Empty,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// One byte per value, nonzero = true.
    Bool8,
    TimestampDays,
    TimestampSeconds,
    TimestampMilliseconds,
    TimestampMicroseconds,
    TimestampNanoseconds,
    DurationDays,
    DurationSeconds,
    DurationMilliseconds,
    DurationMicroseconds,
    DurationNanoseconds,
    Dictionary32,
    String,
    List,
    Decimal32,
    Decimal64,
    Decimal128,
    Struct,
}

impl TypeId {
    /// Bytes per element for fixed-width types.
    pub fn size_of(self) -> Option<usize> {
        use TypeId::*;
        match self {
            Int8 | UInt8 | Bool8 => Some(1),
            Int16 | UInt16 => Some(2),
            Int32 | UInt32 | Float32 | TimestampDays | DurationDays | Decimal32 => Some(4),
            Int64 | UInt64 | Float64 | TimestampSeconds | TimestampMilliseconds
            | TimestampMicroseconds | TimestampNanoseconds | DurationSeconds
            | DurationMilliseconds | DurationMicroseconds | DurationNanoseconds | Decimal64 => {
                Some(8)
            }
            Decimal128 => Some(16),
            Empty | Dictionary32 | String | List | Struct => None,
        }
    }

    pub fn is_nested(self) -> bool {
        matches!(self, TypeId::List | TypeId::Struct | TypeId::Dictionary32)
    }

    pub fn is_integer(self) -> bool {
        use TypeId::*;
        matches!(self, Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64)
    }

    pub fn is_decimal(self) -> bool {
        matches!(self, TypeId::Decimal32 | TypeId::Decimal64 | TypeId::Decimal128)
    }
}

/// A [`TypeId`] plus the decimal scale.
///
/// The scale is a base-10 exponent: the represented value is
/// `unscaled * 10^scale`, so a negative scale means fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType {
    id: TypeId,
    scale: i32,
}

impl DataType {
    pub const fn new(id: TypeId) -> Self {
        Self { id, scale: 0 }
    }

    pub const fn decimal(id: TypeId, scale: i32) -> Self {
        Self { id, scale }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }
}

impl From<TypeId> for DataType {
    fn from(id: TypeId) -> Self {
        Self::new(id)
    }
}

/// Caller-supplied name tree for one column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub children: Vec<ColumnMetadata>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(name: impl Into<String>, children: Vec<ColumnMetadata>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    pub fn child(mut self, child: ColumnMetadata) -> Self {
        self.children.push(child);
        self
    }
}

/// Everything a column owned, as returned by [`DeviceColumn::release`].
#[derive(Debug, Default)]
pub struct ColumnContents {
    pub data: Option<DeviceBuffer>,
    pub null_mask: Option<DeviceBuffer>,
    pub children: Vec<DeviceColumn>,
}

#[derive(Debug)]
pub struct DeviceColumn {
    dtype: DataType,
    size: usize,
    data: Option<DeviceBuffer>,
    null_mask: Option<DeviceBuffer>,
    null_count: usize,
    children: Vec<DeviceColumn>,
}

impl DeviceColumn {
    /// Assemble a column from already-populated buffers.
    pub fn new(
        dtype: DataType,
        size: usize,
        data: Option<DeviceBuffer>,
        null_mask: Option<DeviceBuffer>,
        null_count: usize,
        children: Vec<DeviceColumn>,
    ) -> Self {
        Self {
            dtype,
            size,
            data,
            null_mask,
            null_count,
            children,
        }
    }

    /// Copy fixed-width host values to the device. `validity[i] == false`
    /// marks row `i` null.
    pub fn from_slice<T: Pod>(
        dtype: impl Into<DataType>,
        values: &[T],
        validity: Option<&[bool]>,
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        let dtype = dtype.into();
        if dtype.id().size_of() != Some(mem::size_of::<T>()) {
            return Err(InteropError::UnsupportedType(format!(
                "{}-byte host values cannot back a {:?} column",
                mem::size_of::<T>(),
                dtype.id()
            )));
        }
        let (null_mask, null_count) = build_null_mask(validity, values.len(), stream, mr)?;
        let data = DeviceBuffer::from_host(bytemuck::cast_slice(values), stream, mr)?;
        Ok(Self::new(dtype, values.len(), Some(data), null_mask, null_count, Vec::new()))
    }

    /// A `Bool8` column, one byte per value.
    pub fn from_bools(
        values: &[bool],
        validity: Option<&[bool]>,
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().map(|v| *v as u8).collect();
        Self::from_slice(TypeId::Bool8, bytes.as_slice(), validity, stream, mr)
    }

    /// A column of `size` nulls with no storage.
    pub fn new_empty(size: usize) -> Self {
        Self::new(TypeId::Empty.into(), size, None, None, size, Vec::new())
    }

    pub fn new_strings(
        values: &[Option<&str>],
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        let mut offsets = Vec::with_capacity(values.len() + 1);
        let mut chars = Vec::new();
        offsets.push(0i32);
        for value in values {
            chars.extend_from_slice(value.unwrap_or_default().as_bytes());
            let end = i32::try_from(chars.len()).map_err(|_| {
                InteropError::ShapeMismatch("string column exceeds 2^31 bytes".into())
            })?;
            offsets.push(end);
        }
        let validity: Option<Vec<bool>> = values
            .iter()
            .any(Option::is_none)
            .then(|| values.iter().map(Option::is_some).collect());

        let offsets = Self::from_slice(TypeId::Int32, offsets.as_slice(), None, stream, mr)?;
        let (null_mask, null_count) =
            build_null_mask(validity.as_deref(), values.len(), stream, mr)?;
        let data = DeviceBuffer::from_host(&chars, stream, mr)?;
        Ok(Self::new(
            TypeId::String.into(),
            values.len(),
            Some(data),
            null_mask,
            null_count,
            vec![offsets],
        ))
    }

    /// A list column; `offsets` has one more entry than there are rows and
    /// its last entry must equal the element column's size.
    pub fn new_list(
        offsets: &[i32],
        element: DeviceColumn,
        validity: Option<&[bool]>,
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        let Some(last) = offsets.last() else {
            return Err(InteropError::ShapeMismatch("list offsets cannot be empty".into()));
        };
        if *last as usize != element.size() {
            return Err(InteropError::ShapeMismatch(format!(
                "list offsets end at {} but the element column has {} rows",
                last,
                element.size()
            )));
        }
        let size = offsets.len() - 1;
        let offsets = Self::from_slice(TypeId::Int32, offsets, None, stream, mr)?;
        let (null_mask, null_count) = build_null_mask(validity, size, stream, mr)?;
        Ok(Self::new(
            TypeId::List.into(),
            size,
            None,
            null_mask,
            null_count,
            vec![offsets, element],
        ))
    }

    pub fn new_struct(
        size: usize,
        fields: Vec<DeviceColumn>,
        validity: Option<&[bool]>,
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        if let Some((i, field)) = fields.iter().enumerate().find(|(_, f)| f.size() != size) {
            return Err(InteropError::ShapeMismatch(format!(
                "struct field {} has {} rows, expected {}",
                i,
                field.size(),
                size
            )));
        }
        let (null_mask, null_count) = build_null_mask(validity, size, stream, mr)?;
        Ok(Self::new(TypeId::Struct.into(), size, None, null_mask, null_count, fields))
    }

    /// A dictionary column: row `i` is `keys[indices[i]]`.
    pub fn new_dictionary(
        indices: DeviceColumn,
        keys: DeviceColumn,
        validity: Option<&[bool]>,
        stream: &Stream,
        mr: &Arc<dyn MemoryResource>,
    ) -> Result<Self> {
        if !indices.dtype().id().is_integer() {
            return Err(InteropError::UnsupportedType(format!(
                "dictionary indices must be integers, got {:?}",
                indices.dtype().id()
            )));
        }
        let size = indices.size();
        let (null_mask, null_count) = build_null_mask(validity, size, stream, mr)?;
        Ok(Self::new(
            TypeId::Dictionary32.into(),
            size,
            None,
            null_mask,
            null_count,
            vec![indices, keys],
        ))
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn null_count(&self) -> usize {
        self.null_count
    }

    pub fn nullable(&self) -> bool {
        self.null_mask.is_some()
    }

    pub fn data(&self) -> Option<&DeviceBuffer> {
        self.data.as_ref()
    }

    pub fn null_mask(&self) -> Option<&DeviceBuffer> {
        self.null_mask.as_ref()
    }

    pub fn children(&self) -> &[DeviceColumn] {
        &self.children
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Give up ownership of every buffer and child. The column is left empty
    /// (zero rows, no storage) but keeps its type.
    pub fn release(&mut self) -> ColumnContents {
        self.size = 0;
        self.null_count = 0;
        ColumnContents {
            data: self.data.take(),
            null_mask: self.null_mask.take(),
            children: mem::take(&mut self.children),
        }
    }

    pub fn view(&self) -> ColumnView {
        ColumnView::new(
            self.dtype,
            self.size,
            self.data.as_ref().map_or(0, DeviceBuffer::ptr),
            self.null_mask.as_ref().map_or(0, DeviceBuffer::ptr),
            self.null_count,
            self.children.iter().map(DeviceColumn::view).collect(),
        )
    }
}

fn build_null_mask(
    validity: Option<&[bool]>,
    size: usize,
    stream: &Stream,
    mr: &Arc<dyn MemoryResource>,
) -> Result<(Option<DeviceBuffer>, usize)> {
    let Some(validity) = validity else {
        return Ok((None, 0));
    };
    if validity.len() != size {
        return Err(InteropError::ShapeMismatch(format!(
            "validity has {} entries for {} rows",
            validity.len(),
            size
        )));
    }
    if size == 0 {
        return Ok((None, 0));
    }
    let mut bits = pack_bits(validity.iter().copied());
    bits.resize(bitmask_allocation_size(size), 0);
    let mask = DeviceBuffer::from_host(&bits, stream, mr)?;
    Ok((Some(mask), validity.iter().filter(|v| !**v).count()))
}

/// Non-owning description of a column. The pointers stay valid only as long
/// as whatever owns the memory (a [`DeviceColumn`] or an imported mapping).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnView {
    dtype: DataType,
    size: usize,
    data: DevicePtr,
    null_mask: DevicePtr,
    null_count: usize,
    children: Vec<ColumnView>,
}

impl ColumnView {
    /// A null pointer (`0`) means the buffer is absent.
    pub fn new(
        dtype: DataType,
        size: usize,
        data: DevicePtr,
        null_mask: DevicePtr,
        null_count: usize,
        children: Vec<ColumnView>,
    ) -> Self {
        Self {
            dtype,
            size,
            data,
            null_mask,
            null_count,
            children,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> Option<DevicePtr> {
        (self.data != 0).then_some(self.data)
    }

    pub fn null_mask(&self) -> Option<DevicePtr> {
        (self.null_mask != 0).then_some(self.null_mask)
    }

    pub fn null_count(&self) -> usize {
        self.null_count
    }

    pub fn nullable(&self) -> bool {
        self.null_mask().is_some()
    }

    pub fn children(&self) -> &[ColumnView] {
        &self.children
    }

    pub fn child(&self, i: usize) -> Option<&ColumnView> {
        self.children.get(i)
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    /// Bytes occupied by the data buffer, for fixed-width types.
    pub fn data_bytes(&self) -> Option<usize> {
        self.dtype.id().size_of().map(|w| w * self.size)
    }

    /// Bytes occupied by the validity bitmask, padding included.
    pub fn null_mask_bytes(&self) -> usize {
        bitmask_allocation_size(self.size)
    }

    /// Copy the data buffer back as host values of type `T`.
    pub fn data_to_host<T: Pod>(&self, device: &Device, stream: &Stream) -> Result<Vec<T>> {
        if self.size == 0 {
            return Ok(Vec::new());
        }
        let ptr = self
            .data()
            .ok_or_else(|| InteropError::ShapeMismatch(format!("{:?} view has no data", self.dtype.id())))?;
        let bytes = device.read(ptr, self.size * mem::size_of::<T>(), stream)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Per-row validity, or `None` when the column has no bitmask.
    pub fn validity_to_host(&self, device: &Device, stream: &Stream) -> Result<Option<Vec<bool>>> {
        let Some(mask) = self.null_mask() else {
            return Ok(None);
        };
        let bytes = device.read(mask, self.size.div_ceil(8), stream)?;
        Ok(Some(
            (0..self.size)
                .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
                .collect(),
        ))
    }
}

/// Columns sharing a row count, bound to one device.
#[derive(Debug)]
pub struct Table {
    device: Device,
    columns: Vec<DeviceColumn>,
}

impl Table {
    pub fn new(device: Device, columns: Vec<DeviceColumn>) -> Result<Self> {
        if let Some(first) = columns.first() {
            if let Some((i, col)) = columns.iter().enumerate().find(|(_, c)| c.size() != first.size()) {
                return Err(InteropError::ShapeMismatch(format!(
                    "column {} has {} rows, column 0 has {}",
                    i,
                    col.size(),
                    first.size()
                )));
            }
        }
        Ok(Self { device, columns })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, DeviceColumn::size)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, i: usize) -> &DeviceColumn {
        &self.columns[i]
    }

    pub fn columns(&self) -> &[DeviceColumn] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [DeviceColumn] {
        &mut self.columns
    }

    pub fn into_columns(self) -> Vec<DeviceColumn> {
        self.columns
    }

    pub fn view(&self) -> TableView {
        TableView::new(
            self.device.clone(),
            self.columns.iter().map(DeviceColumn::view).collect(),
        )
    }
}

/// Non-owning counterpart of [`Table`].
#[derive(Debug, Clone)]
pub struct TableView {
    device: Device,
    columns: Vec<ColumnView>,
}

impl TableView {
    pub fn new(device: Device, columns: Vec<ColumnView>) -> Self {
        Self { device, columns }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, ColumnView::size)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, i: usize) -> &ColumnView {
        &self.columns[i]
    }

    pub fn columns(&self) -> &[ColumnView] {
        &self.columns
    }
}
