//! Table slices: row-major typed mini-batches with an explicit ID offset.
//!
//! A slice owns a flattened layout and a block of rows; row `i` carries
//! the global event ID `offset + i`. Slices are immutable once finished
//! and shared behind `Arc` by every consumer (segment store, indexes,
//! subscribers).
//!
//! The byte encoding (used inside segment chunks) is a small header plus
//! the bincode-serialized layout and wire-encoded cells.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::error::{Error, Result};
use crate::schema::{type_check, RecordType};
use crate::value::{wire, Value, ValueView};

// -- TableSlice -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSlice {
    layout: RecordType,
    offset: u64,
    rows: Vec<Vec<Value>>,
}

impl TableSlice {
    pub fn new(layout: RecordType, offset: u64, rows: Vec<Vec<Value>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == layout.fields.len()));
        Self {
            layout,
            offset,
            rows,
        }
    }

    pub fn layout(&self) -> &RecordType {
        &self.layout
    }

    /// ID of the first row.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stamp the ID of the first row. Only the importer does this, before
    /// the slice is shared.
    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn rows(&self) -> u64 {
        self.rows.len() as u64
    }

    pub fn columns(&self) -> usize {
        self.layout.fields.len()
    }

    /// Borrow the cell at `(row, col)`.
    pub fn at(&self, row: usize, col: usize) -> ValueView<'_> {
        self.rows[row][col].view()
    }

    pub fn row(&self, row: usize) -> &[Value] {
        &self.rows[row]
    }

    /// The half-open ID interval `[offset, offset + rows)`.
    pub fn id_range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.rows())
    }

    /// Extract the sub-slices of rows whose IDs are set in `mask`. Each
    /// maximal run of kept rows becomes one new slice with the original
    /// IDs preserved.
    pub fn select(&self, mask: &Bitmap) -> Vec<TableSlice> {
        let (lo, hi) = self.id_range();
        let mut result = Vec::new();
        let mut pos = 0u64;
        for (bit, len) in mask.runs() {
            let start = pos.max(lo);
            let end = (pos + len).min(hi);
            pos += len;
            if !bit || start >= end {
                if pos >= hi {
                    break;
                }
                continue;
            }
            let rows: Vec<Vec<Value>> = ((start - lo) as usize..(end - lo) as usize)
                .map(|i| self.rows[i].clone())
                .collect();
            result.push(TableSlice::new(self.layout.clone(), start, rows));
            if pos >= hi {
                break;
            }
        }
        result
    }

    // -- Byte encoding ----------------------------------------------------

    /// Serialize into the writer: layout length + bincode layout, then
    /// offset, row count, column count, and wire-encoded cells.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let layout_bytes = bincode::serialize(&self.layout)?;
        w.write_all(&(layout_bytes.len() as u64).to_le_bytes())?;
        w.write_all(&layout_bytes)?;
        w.write_all(&self.offset.to_le_bytes())?;
        w.write_all(&self.rows().to_le_bytes())?;
        w.write_all(&(self.columns() as u64).to_le_bytes())?;
        for row in &self.rows {
            for cell in row {
                wire::write_value(w, cell.view())?;
            }
        }
        Ok(())
    }

    /// Serialized byte size without writing.
    pub fn encoded(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize a slice written by [`write_to`](Self::write_to).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut input = bytes;
        let layout_len = read_u64(&mut input)? as usize;
        if input.len() < layout_len {
            return Err(Error::Format("truncated slice layout".into()));
        }
        let (layout_bytes, rest) = input.split_at(layout_len);
        input = rest;
        let layout: RecordType = bincode::deserialize(layout_bytes)?;
        let offset = read_u64(&mut input)?;
        let num_rows = read_u64(&mut input)? as usize;
        let num_cols = read_u64(&mut input)? as usize;
        if num_cols != layout.fields.len() {
            return Err(Error::Format(format!(
                "slice column count {num_cols} does not match layout width {}",
                layout.fields.len()
            )));
        }
        let mut rows = Vec::with_capacity(num_rows);
        for _ in 0..num_rows {
            let mut row = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                row.push(wire::read_value(&mut input)?);
            }
            rows.push(row);
        }
        if !input.is_empty() {
            return Err(Error::Format("trailing bytes after slice rows".into()));
        }
        Ok(Self {
            layout,
            offset,
            rows,
        })
    }
}

fn read_u64(input: &mut &[u8]) -> Result<u64> {
    if input.len() < 8 {
        return Err(Error::Format("truncated slice header".into()));
    }
    let (head, rest) = input.split_at(8);
    *input = rest;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

// -- Builder --------------------------------------------------------------

/// Row-wise slice builder. Appends type-checked cells column by column;
/// a full row moves into the slice under construction.
pub struct TableSliceBuilder {
    layout: RecordType,
    row: Vec<Value>,
    col: usize,
    rows: Vec<Vec<Value>>,
}

impl TableSliceBuilder {
    /// Create a builder for a layout. The layout is flattened first.
    pub fn new(layout: &RecordType) -> Self {
        let layout = layout.flatten();
        let width = layout.fields.len();
        assert!(width > 0, "layout must have at least one field");
        Self {
            layout,
            row: vec![Value::Nil; width],
            col: 0,
            rows: Vec::new(),
        }
    }

    pub fn layout(&self) -> &RecordType {
        &self.layout
    }

    /// Append one cell. Fails on a type mismatch with the current column.
    pub fn append(&mut self, value: Value) -> Result<()> {
        let field = &self.layout.fields[self.col];
        if !type_check(&field.ty, value.view()) {
            return Err(Error::TypeClash(format!(
                "value {} does not fit field '{}'",
                value.kind_name(),
                field.name
            )));
        }
        self.row[self.col] = value;
        self.col += 1;
        if self.col == self.layout.fields.len() {
            let width = self.layout.fields.len();
            self.rows.push(std::mem::replace(
                &mut self.row,
                vec![Value::Nil; width],
            ));
            self.col = 0;
        }
        Ok(())
    }

    /// Number of complete rows buffered so far.
    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// Close the slice at offset zero; the importer stamps the real ID
    /// block later. An incomplete trailing row is kept as-is, its unset
    /// tail implicitly nil. The builder is ready for reuse.
    pub fn finish(&mut self) -> TableSlice {
        let width = self.layout.fields.len();
        if self.col != 0 {
            self.rows
                .push(std::mem::replace(&mut self.row, vec![Value::Nil; width]));
            self.col = 0;
        }
        let rows = std::mem::take(&mut self.rows);
        TableSlice::new(self.layout.clone(), 0, rows)
    }
}

// -- Tests ----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, Type};

    fn layout() -> RecordType {
        RecordType::new(
            "event",
            vec![
                Field::new("msg", Type::String),
                Field::new("n", Type::Count),
            ],
        )
    }

    fn sample_slice(offset: u64, n: usize) -> TableSlice {
        let rows = (0..n)
            .map(|i| {
                vec![
                    Value::String(format!("row{i}")),
                    Value::Count(i as u64),
                ]
            })
            .collect();
        TableSlice::new(layout(), offset, rows)
    }

    #[test]
    fn test_builder_rows_and_ids() {
        let mut b = TableSliceBuilder::new(&layout());
        b.append(Value::String("a".into())).unwrap();
        b.append(Value::Count(1)).unwrap();
        b.append(Value::String("b".into())).unwrap();
        b.append(Value::Count(2)).unwrap();
        let slice = b.finish();
        assert_eq!(slice.rows(), 2);
        assert_eq!(slice.columns(), 2);
        assert_eq!(slice.at(0, 0), ValueView::String("a"));
        assert_eq!(slice.at(1, 1), ValueView::Count(2));
    }

    #[test]
    fn test_builder_type_check() {
        let mut b = TableSliceBuilder::new(&layout());
        assert!(b.append(Value::Count(1)).is_err()); // first column is a string
        b.append(Value::String("ok".into())).unwrap();
        assert!(b.append(Value::Integer(-1)).is_err());
        b.append(Value::Nil).unwrap(); // nil fits anything
        assert_eq!(b.finish().rows(), 1);
    }

    #[test]
    fn test_builder_partial_trailing_row() {
        let mut b = TableSliceBuilder::new(&layout());
        b.append(Value::String("full".into())).unwrap();
        b.append(Value::Count(1)).unwrap();
        b.append(Value::String("partial".into())).unwrap();
        let slice = b.finish();
        // The incomplete row is captured, its tail nil.
        assert_eq!(slice.rows(), 2);
        assert_eq!(slice.at(1, 0), ValueView::String("partial"));
        assert_eq!(slice.at(1, 1), ValueView::Nil);
    }

    #[test]
    fn test_builder_flattens_layout() {
        let nested = RecordType::new(
            "outer",
            vec![Field::new(
                "rec",
                Type::Record(RecordType::new(
                    "inner",
                    vec![
                        Field::new("a", Type::Count),
                        Field::new("b", Type::Count),
                    ],
                )),
            )],
        );
        let b = TableSliceBuilder::new(&nested);
        assert_eq!(b.layout().fields.len(), 2);
        assert_eq!(b.layout().fields[0].name, "rec.a");
    }

    #[test]
    fn test_builder_reuse_after_finish() {
        let mut b = TableSliceBuilder::new(&layout());
        b.append(Value::String("x".into())).unwrap();
        b.append(Value::Count(0)).unwrap();
        let first = b.finish();
        assert_eq!(first.rows(), 1);
        b.append(Value::String("y".into())).unwrap();
        b.append(Value::Count(1)).unwrap();
        let second = b.finish();
        assert_eq!(second.rows(), 1);
        assert_eq!(second.at(0, 0), ValueView::String("y"));
    }

    #[test]
    fn test_slice_encode_roundtrip() {
        let slice = sample_slice(1234, 7);
        let bytes = slice.encoded().unwrap();
        let back = TableSlice::from_bytes(&bytes).unwrap();
        assert_eq!(back, slice);
        assert_eq!(back.offset(), 1234);
    }

    #[test]
    fn test_slice_decode_truncated() {
        let bytes = sample_slice(0, 3).encoded().unwrap();
        for cut in [0, 4, 8, bytes.len() / 2, bytes.len() - 1] {
            assert!(TableSlice::from_bytes(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_select_runs() {
        let slice = sample_slice(100, 10); // ids 100..110
        // Keep 100..=102 and 107..=109.
        let mut mask = Bitmap::filled(100, false);
        mask.append_bits(true, 3);
        mask.append_bits(false, 4);
        mask.append_bits(true, 3);
        let parts = slice.select(&mask);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].id_range(), (100, 103));
        assert_eq!(parts[1].id_range(), (107, 110));
        assert_eq!(parts[0].at(0, 0), ValueView::String("row0"));
        assert_eq!(parts[1].at(0, 0), ValueView::String("row7"));
    }

    #[test]
    fn test_select_mask_shorter_than_slice() {
        let slice = sample_slice(0, 5);
        // Mask covers only the first two ids; the rest reads as zero.
        let mask = Bitmap::filled(2, true);
        let parts = slice.select(&mask);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].id_range(), (0, 2));
    }

    #[test]
    fn test_select_all_and_none() {
        let slice = sample_slice(10, 4);
        let all = slice.select(&Bitmap::filled(20, true));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id_range(), (10, 14));
        assert_eq!(all[0], slice);
        let none = slice.select(&Bitmap::filled(20, false));
        assert!(none.is_empty());
    }
}
