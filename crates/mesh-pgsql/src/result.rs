//! Result Projection: host view of one command result.
//!
//! Every index crossing this API is 1-based; the native result is 0-based.
//! Rows and fields are read straight out of the already materialized grid,
//! so none of these calls touches the network.
//!
//! [`Tuple`] and [`Field`] are positions, not copies: they borrow the
//! [`ResultSet`] and read through it, so they cannot outlive it, and
//! reading through one after `clear()` fails with `InvalidHandle`.

use mesh_pq::{ExecStatus, Oid, PgResult};

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::host::Value;
use crate::marshal::decode_cell;

pub use mesh_pq::res_status;

pub struct ResultSet {
    handle: Handle<PgResult>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet").field("handle", &self.handle).finish()
    }
}

/// 1-based index to 0-based, checked against `len`.
fn index(i: usize, len: usize) -> Result<usize> {
    if i == 0 || i > len {
        return Err(Error::IndexOutOfRange { index: i, len });
    }
    Ok(i - 1)
}

impl ResultSet {
    pub(crate) fn from_native(res: Box<PgResult>) -> Self {
        ResultSet {
            handle: Handle::acquire(res),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&PgResult) -> R) -> Result<R> {
        self.handle.with(f)
    }

    fn read_col<R>(&self, col: usize, f: impl FnOnce(&PgResult, usize) -> R) -> Result<R> {
        self.handle.with(|r| {
            let c = index(col, r.nfields())?;
            Ok(f(r, c))
        })?
    }

    fn read_cell<R>(
        &self,
        row: usize,
        col: usize,
        f: impl FnOnce(&PgResult, usize, usize) -> R,
    ) -> Result<R> {
        self.handle.with(|r| {
            let rw = index(row, r.ntuples())?;
            let c = index(col, r.nfields())?;
            Ok(f(r, rw, c))
        })?
    }

    /// Free the native result. Safe to call more than once.
    pub fn clear(&self) -> Result<()> {
        self.handle.release().map(|_| ())
    }

    pub fn is_cleared(&self) -> bool {
        self.handle.is_released()
    }

    // ── Status ─────────────────────────────────────────────────────────

    pub fn status(&self) -> Result<ExecStatus> {
        self.read(PgResult::status)
    }

    /// Symbolic name of this result's status.
    pub fn status_name(&self) -> Result<&'static str> {
        self.read(|r| r.status().name())
    }

    pub fn error_message(&self) -> Result<String> {
        self.read(|r| r.error_message().to_string())
    }

    /// One diagnostic field; see [`mesh_pq::diag`] for the codes.
    pub fn error_field(&self, code: u8) -> Result<Option<String>> {
        self.read(|r| r.error_field(code).map(str::to_string))
    }

    pub fn cmd_status(&self) -> Result<String> {
        self.read(|r| r.cmd_status().to_string())
    }

    pub fn cmd_tuples(&self) -> Result<String> {
        self.read(|r| r.cmd_tuples().to_string())
    }

    pub fn oid_value(&self) -> Result<Oid> {
        self.read(PgResult::oid_value)
    }

    pub fn oid_status(&self) -> Result<String> {
        self.read(|r| r.oid_status().to_string())
    }

    // ── Shape ──────────────────────────────────────────────────────────

    pub fn ntuples(&self) -> Result<usize> {
        self.read(PgResult::ntuples)
    }

    pub fn nfields(&self) -> Result<usize> {
        self.read(PgResult::nfields)
    }

    pub fn binary_tuples(&self) -> Result<bool> {
        self.read(PgResult::binary_tuples)
    }

    pub fn fname(&self, col: usize) -> Result<String> {
        self.read_col(col, |r, c| r.fname(c).unwrap_or_default().to_string())
    }

    /// Column number of `name`, or `None` if no column has that name.
    pub fn fnumber(&self, name: &str) -> Result<Option<usize>> {
        self.read(|r| r.fnumber(name).map(|c| c + 1))
    }

    pub fn ftable(&self, col: usize) -> Result<Oid> {
        self.read_col(col, PgResult::ftable)
    }

    pub fn ftablecol(&self, col: usize) -> Result<i32> {
        self.read_col(col, PgResult::ftablecol)
    }

    pub fn fformat(&self, col: usize) -> Result<i32> {
        self.read_col(col, PgResult::fformat)
    }

    pub fn ftype(&self, col: usize) -> Result<Oid> {
        self.read_col(col, PgResult::ftype)
    }

    pub fn fmod(&self, col: usize) -> Result<i32> {
        self.read_col(col, PgResult::fmod)
    }

    pub fn fsize(&self, col: usize) -> Result<i32> {
        self.read_col(col, PgResult::fsize)
    }

    pub fn nparams(&self) -> Result<usize> {
        self.read(PgResult::nparams)
    }

    pub fn paramtype(&self, param: usize) -> Result<Oid> {
        self.handle.with(|r| {
            let p = index(param, r.nparams())?;
            Ok(r.paramtype(p))
        })?
    }

    // ── Cells ──────────────────────────────────────────────────────────

    /// Cell bytes; SQL NULL reads as empty, use `getisnull` to tell apart.
    pub fn getvalue(&self, row: usize, col: usize) -> Result<Vec<u8>> {
        self.read_cell(row, col, |r, rw, c| r.getvalue(rw, c).unwrap_or_default().to_vec())
    }

    pub fn getisnull(&self, row: usize, col: usize) -> Result<bool> {
        self.read_cell(row, col, PgResult::getisnull)
    }

    pub fn getlength(&self, row: usize, col: usize) -> Result<usize> {
        self.read_cell(row, col, PgResult::getlength)
    }

    /// One cell as a host value: nil for SQL NULL, otherwise converted
    /// as [`decode_cell`] does.
    pub fn value(&self, row: usize, col: usize, typed: bool) -> Result<Value> {
        self.read_cell(row, col, |r, rw, c| {
            decode_cell(r.cell(rw, c).flatten(), r.ftype(c), r.fformat(c) as i16, typed)
        })
    }

    /// Snapshot the whole grid, row by row. With `typed`, boolean,
    /// integer, float and numeric columns become host numbers and
    /// booleans; other columns stay strings.
    pub fn copy(&self, typed: bool) -> Result<Vec<Vec<Value>>> {
        self.read(|r| {
            let types: Vec<(Oid, i16)> =
                r.fields().iter().map(|f| (f.type_oid, f.format)).collect();
            let mut rows: Vec<Vec<Value>> = Vec::new();
            rows.try_reserve_exact(r.ntuples()).map_err(|_| Error::Allocation)?;
            for rw in 0..r.ntuples() {
                rows.push(
                    types
                        .iter()
                        .enumerate()
                        .map(|(c, &(oid, format))| {
                            decode_cell(r.cell(rw, c).flatten(), oid, format, typed)
                        })
                        .collect(),
                );
            }
            Ok(rows)
        })?
    }

    /// Fresh cursor over the rows, from the first.
    pub fn tuples(&self) -> Tuples<'_> {
        Tuples { res: self, next: 1 }
    }

    /// Row `row` as a positional view.
    pub fn tuple(&self, row: usize) -> Result<Tuple<'_>> {
        index(row, self.ntuples()?)?;
        Ok(Tuple { res: self, row })
    }
}

// ── Cursors ────────────────────────────────────────────────────────────

/// Forward cursor over rows. Ends (and stays ended) after the last row or
/// once the result is cleared.
pub struct Tuples<'r> {
    res: &'r ResultSet,
    next: usize,
}

impl<'r> Iterator for Tuples<'r> {
    type Item = Tuple<'r>;

    fn next(&mut self) -> Option<Tuple<'r>> {
        let n = self.res.ntuples().unwrap_or(0);
        if self.next > n {
            self.next = usize::MAX;
            return None;
        }
        let row = self.next;
        self.next += 1;
        Some(Tuple { res: self.res, row })
    }
}

impl std::iter::FusedIterator for Tuples<'_> {}

/// Column selector for [`Tuple::field`].
#[derive(Debug, Clone, Copy)]
pub enum Column<'a> {
    Index(usize),
    Name(&'a str),
}

impl From<usize> for Column<'_> {
    fn from(i: usize) -> Self {
        Column::Index(i)
    }
}

impl<'a> From<&'a str> for Column<'a> {
    fn from(name: &'a str) -> Self {
        Column::Name(name)
    }
}

/// One row of a result.
#[derive(Clone, Copy)]
pub struct Tuple<'r> {
    res: &'r ResultSet,
    row: usize,
}

impl<'r> Tuple<'r> {
    /// 1-based row number.
    pub fn row(&self) -> usize {
        self.row
    }

    /// Cell text by column number or name; nil for SQL NULL.
    pub fn get<'a>(&self, col: impl Into<Column<'a>>) -> Result<Value> {
        self.field(col)?.value()
    }

    pub fn field<'a>(&self, col: impl Into<Column<'a>>) -> Result<Field<'r>> {
        let col = match col.into() {
            Column::Index(i) => {
                index(i, self.res.nfields()?)?;
                i
            }
            Column::Name(name) => self
                .res
                .fnumber(name)?
                .ok_or_else(|| Error::Argument(format!("no column named \"{}\"", name)))?,
        };
        Ok(Field { tuple: *self, col })
    }

    /// Cursor over `(name, value)` pairs of this row.
    pub fn fields(&self) -> Fields<'r> {
        Fields {
            tuple: *self,
            next: 1,
        }
    }
}

impl std::fmt::Debug for Tuple<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tuple").field("row", &self.row).finish()
    }
}

pub struct Fields<'r> {
    tuple: Tuple<'r>,
    next: usize,
}

impl Iterator for Fields<'_> {
    type Item = (String, Value);

    fn next(&mut self) -> Option<(String, Value)> {
        let n = self.tuple.res.nfields().unwrap_or(0);
        if self.next > n {
            self.next = usize::MAX;
            return None;
        }
        let field = Field {
            tuple: self.tuple,
            col: self.next,
        };
        self.next += 1;
        Some((field.name().ok()?, field.value().ok()?))
    }
}

impl std::iter::FusedIterator for Fields<'_> {}

/// One cell of a row.
#[derive(Debug, Clone, Copy)]
pub struct Field<'r> {
    tuple: Tuple<'r>,
    col: usize,
}

impl Field<'_> {
    /// 1-based column number.
    pub fn number(&self) -> usize {
        self.col
    }

    pub fn name(&self) -> Result<String> {
        self.tuple.res.fname(self.col)
    }

    pub fn ftype(&self) -> Result<Oid> {
        self.tuple.res.ftype(self.col)
    }

    pub fn is_null(&self) -> Result<bool> {
        self.tuple.res.getisnull(self.tuple.row, self.col)
    }

    pub fn length(&self) -> Result<usize> {
        self.tuple.res.getlength(self.tuple.row, self.col)
    }

    /// Cell as a host string, nil for SQL NULL.
    pub fn value(&self) -> Result<Value> {
        self.tuple.res.value(self.tuple.row, self.col, false)
    }

    /// Cell converted by column type.
    pub fn typed_value(&self) -> Result<Value> {
        self.tuple.res.value(self.tuple.row, self.col, true)
    }
}
