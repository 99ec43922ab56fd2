//! Column-major matrix views
//!
//! GEMM operands are borrowed as views over caller buffers: element `(i, j)`
//! of a view with leading dimension `ld` lives at offset `j * ld + i`.
//!
//! [`MatMut`] can only be subdivided by consuming it
//! ([`MatMut::split_rows_at`], [`MatMut::split_cols_at`]), so two live views
//! of the output never cover the same element. The recursive partitioner and
//! the hybrid pipeline rely on this to hand disjoint regions of `C` to
//! independent host and device work.

use crate::error::{Error, Result};
use std::marker::PhantomData;

/// Operation applied to an operand before multiplication
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Transpose {
    /// `op(X) = X`
    #[default]
    NoTrans,
    /// `op(X) = Xᵀ`
    Trans,
    /// `op(X) = Xᴴ` (equal to `Trans` for real types)
    ConjTrans,
}

impl Transpose {
    /// Parse a BLAS transpose character (`N`, `T`, `C`, any case)
    pub fn from_char(c: char) -> Result<Self> {
        match c.to_ascii_uppercase() {
            'N' => Ok(Self::NoTrans),
            'T' => Ok(Self::Trans),
            'C' => Ok(Self::ConjTrans),
            other => Err(Error::invalid_argument(
                "trans",
                format!("expected one of N, T, C, got '{other}'"),
            )),
        }
    }

    /// BLAS transpose character
    pub const fn as_char(self) -> char {
        match self {
            Self::NoTrans => 'N',
            Self::Trans => 'T',
            Self::ConjTrans => 'C',
        }
    }

    /// Returns true for `Trans` and `ConjTrans`
    #[inline]
    pub const fn is_transposed(self) -> bool {
        !matches!(self, Self::NoTrans)
    }

    /// Stored shape of an operand whose `op(X)` is `rows x cols`
    #[inline]
    pub const fn stored_shape(self, rows: usize, cols: usize) -> (usize, usize) {
        if self.is_transposed() {
            (cols, rows)
        } else {
            (rows, cols)
        }
    }
}

/// Minimum buffer length holding a `rows x cols` matrix with leading dimension `ld`
///
/// `None` when the length does not fit in `usize`.
#[inline]
pub const fn required_len(rows: usize, cols: usize, ld: usize) -> Option<usize> {
    if rows == 0 || cols == 0 {
        return Some(0);
    }
    match (cols - 1).checked_mul(ld) {
        Some(offset) => offset.checked_add(rows),
        None => None,
    }
}

/// Validate a leading dimension and buffer length the way BLAS does.
pub(crate) fn check_operand(
    arg: &'static str,
    len: usize,
    rows: usize,
    cols: usize,
    ld: usize,
) -> Result<()> {
    if ld < rows.max(1) {
        return Err(Error::invalid_argument(
            arg,
            format!("leading dimension {ld} is smaller than max(1, {rows})"),
        ));
    }
    let Some(needed) = required_len(rows, cols, ld) else {
        return Err(Error::invalid_argument(
            arg,
            format!("{rows}x{cols} with ld {ld} overflows usize"),
        ));
    };
    if len < needed {
        return Err(Error::invalid_argument(
            arg,
            format!("buffer holds {len} elements, {rows}x{cols} with ld {ld} needs {needed}"),
        ));
    }
    Ok(())
}

// ============================================================================
// MatRef
// ============================================================================

/// Immutable column-major view
#[derive(Debug)]
pub struct MatRef<'a, T> {
    ptr: *const T,
    rows: usize,
    cols: usize,
    ld: usize,
    _marker: PhantomData<&'a [T]>,
}

impl<T> Clone for MatRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MatRef<'_, T> {}

// SAFETY: a MatRef is a shared borrow of `[T]`.
unsafe impl<T: Sync> Send for MatRef<'_, T> {}
unsafe impl<T: Sync> Sync for MatRef<'_, T> {}

impl<'a, T> MatRef<'a, T> {
    /// View `data` as a `rows x cols` matrix with leading dimension `ld`
    pub fn from_slice(data: &'a [T], rows: usize, cols: usize, ld: usize) -> Result<Self> {
        check_operand("data", data.len(), rows, cols, ld)?;
        Ok(Self {
            ptr: data.as_ptr(),
            rows,
            cols,
            ld,
            _marker: PhantomData,
        })
    }

    /// View raw memory as a `rows x cols` matrix.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `required_len(rows, cols, ld)`
    /// elements for `'a`, and `ld >= max(1, rows)`.
    pub(crate) unsafe fn from_raw_parts(ptr: *const T, rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            ptr,
            rows,
            cols,
            ld,
            _marker: PhantomData,
        }
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Leading dimension in elements
    #[inline]
    pub fn ld(&self) -> usize {
        self.ld
    }

    /// Returns true if the view has no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Pointer to element `(0, 0)`
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    /// Column `j` as a contiguous slice of `rows` elements
    #[inline]
    pub fn col(&self, j: usize) -> &'a [T] {
        assert!(j < self.cols, "column {j} out of range ({})", self.cols);
        if self.rows == 0 {
            return &[];
        }
        // SAFETY: column j of the view spans [j*ld, j*ld + rows) inside the
        // borrowed buffer (checked by from_slice / submatrix).
        unsafe { std::slice::from_raw_parts(self.ptr.wrapping_add(j * self.ld), self.rows) }
    }

    /// Sub-view of `rows x cols` elements starting at `(row, col)`
    pub fn submatrix(&self, row: usize, col: usize, rows: usize, cols: usize) -> MatRef<'a, T> {
        assert!(
            row + rows <= self.rows && col + cols <= self.cols,
            "submatrix ({row}, {col}) {rows}x{cols} exceeds {}x{}",
            self.rows,
            self.cols
        );
        MatRef {
            ptr: self.ptr.wrapping_add(col * self.ld + row),
            rows,
            cols,
            ld: self.ld,
            _marker: PhantomData,
        }
    }
}

impl<T: Copy> MatRef<'_, T> {
    /// Element `(i, j)`
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.col(j)[i]
    }
}

// ============================================================================
// MatMut
// ============================================================================

/// Mutable column-major view
#[derive(Debug)]
pub struct MatMut<'a, T> {
    ptr: *mut T,
    rows: usize,
    cols: usize,
    ld: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: a MatMut is an exclusive borrow of `[T]`.
unsafe impl<T: Send> Send for MatMut<'_, T> {}
unsafe impl<T: Sync> Sync for MatMut<'_, T> {}

impl<'a, T> MatMut<'a, T> {
    /// View `data` as a mutable `rows x cols` matrix with leading dimension `ld`
    pub fn from_slice_mut(data: &'a mut [T], rows: usize, cols: usize, ld: usize) -> Result<Self> {
        check_operand("data", data.len(), rows, cols, ld)?;
        Ok(Self {
            ptr: data.as_mut_ptr(),
            rows,
            cols,
            ld,
            _marker: PhantomData,
        })
    }

    /// View raw memory as a mutable `rows x cols` matrix.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of
    /// `required_len(rows, cols, ld)` elements for `'a`, with no other live
    /// access to them, and `ld >= max(1, rows)`.
    pub(crate) unsafe fn from_raw_parts_mut(ptr: *mut T, rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            ptr,
            rows,
            cols,
            ld,
            _marker: PhantomData,
        }
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Leading dimension in elements
    #[inline]
    pub fn ld(&self) -> usize {
        self.ld
    }

    /// Returns true if the view has no elements
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Pointer to element `(0, 0)`
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }

    /// Shared view of the same region
    #[inline]
    pub fn view(&self) -> MatRef<'_, T> {
        MatRef {
            ptr: self.ptr,
            rows: self.rows,
            cols: self.cols,
            ld: self.ld,
            _marker: PhantomData,
        }
    }

    /// Shorter-lived mutable view of the same region
    #[inline]
    pub fn reborrow(&mut self) -> MatMut<'_, T> {
        MatMut {
            ptr: self.ptr,
            rows: self.rows,
            cols: self.cols,
            ld: self.ld,
            _marker: PhantomData,
        }
    }

    /// Column `j` as a contiguous mutable slice of `rows` elements
    #[inline]
    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        assert!(j < self.cols, "column {j} out of range ({})", self.cols);
        if self.rows == 0 {
            return &mut [];
        }
        // SAFETY: column j spans [j*ld, j*ld + rows) of the exclusively
        // borrowed region; no other live view covers these elements.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.wrapping_add(j * self.ld), self.rows) }
    }

    /// Split into rows `[0, r)` and `[r, rows)`
    pub fn split_rows_at(self, r: usize) -> (MatMut<'a, T>, MatMut<'a, T>) {
        assert!(r <= self.rows, "row split {r} exceeds {} rows", self.rows);
        let top = MatMut {
            ptr: self.ptr,
            rows: r,
            cols: self.cols,
            ld: self.ld,
            _marker: PhantomData,
        };
        let bottom = MatMut {
            ptr: self.ptr.wrapping_add(r),
            rows: self.rows - r,
            cols: self.cols,
            ld: self.ld,
            _marker: PhantomData,
        };
        (top, bottom)
    }

    /// Split into columns `[0, c)` and `[c, cols)`
    pub fn split_cols_at(self, c: usize) -> (MatMut<'a, T>, MatMut<'a, T>) {
        assert!(c <= self.cols, "column split {c} exceeds {} columns", self.cols);
        let left = MatMut {
            ptr: self.ptr,
            rows: self.rows,
            cols: c,
            ld: self.ld,
            _marker: PhantomData,
        };
        let right = MatMut {
            ptr: self.ptr.wrapping_add(c * self.ld),
            rows: self.rows,
            cols: self.cols - c,
            ld: self.ld,
            _marker: PhantomData,
        };
        (left, right)
    }
}

impl<T: Copy> MatMut<'_, T> {
    /// Element `(i, j)`
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.view().get(i, j)
    }

    /// Overwrite element `(i, j)`
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        self.col_mut(j)[i] = value;
    }
}
