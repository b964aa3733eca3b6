//! Compressed sparse matrices with prefix-sum offset arrays.
//!
//! [`CsrMatrix`] is row-major with a dense row space; [`CscMatrix`] is
//! column-major over a sparse column space (only non-empty columns are
//! stored, ids sorted). Values are log probabilities. Both are built once from
//! triplets and never mutated afterwards.

use crate::semiring::LogProb;

/// A (row, column, value) entry.
pub type Triplet = (u32, u32, LogProb);

/// Sort triplets by (major, minor) and collapse duplicates, keeping the max.
fn sort_and_dedup(triplets: &mut Vec<Triplet>, by_column: bool) {
    if by_column {
        triplets.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
    } else {
        triplets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    }
    triplets.dedup_by(|next, kept| {
        if next.0 == kept.0 && next.1 == kept.1 {
            if next.2 > kept.2 {
                kept.2 = next.2;
            }
            true
        } else {
            false
        }
    });
}

/// Compressed sparse row matrix.
#[derive(Debug, Clone, Default)]
pub struct CsrMatrix {
    offsets: Vec<usize>,
    columns: Vec<u32>,
    values: Vec<LogProb>,
}

impl CsrMatrix {
    /// Build from triplets. Rows must be `< num_rows`.
    pub fn from_triplets(num_rows: usize, mut triplets: Vec<Triplet>) -> Self {
        sort_and_dedup(&mut triplets, false);

        let mut offsets = vec![0usize; num_rows + 1];
        for &(row, _, _) in &triplets {
            offsets[row as usize + 1] += 1;
        }
        for r in 0..num_rows {
            offsets[r + 1] += offsets[r];
        }

        CsrMatrix {
            offsets,
            columns: triplets.iter().map(|t| t.1).collect(),
            values: triplets.iter().map(|t| t.2).collect(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.columns.len()
    }

    /// Prefix sums: row `r` occupies `offsets[r]..offsets[r + 1]`.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    #[inline(always)]
    pub fn row(&self, row: usize) -> (&[u32], &[LogProb]) {
        let range = self.offsets[row]..self.offsets[row + 1];
        (&self.columns[range.clone()], &self.values[range])
    }

    pub fn row_nnz(&self, row: usize) -> usize {
        self.offsets[row + 1] - self.offsets[row]
    }

    /// Value at (row, column), if stored.
    pub fn get(&self, row: u32, column: u32) -> Option<LogProb> {
        if row as usize >= self.num_rows() {
            return None;
        }
        let (columns, values) = self.row(row as usize);
        columns.binary_search(&column).ok().map(|i| values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = Triplet> + '_ {
        (0..self.num_rows()).flat_map(move |r| {
            let (columns, values) = self.row(r);
            columns
                .iter()
                .zip(values)
                .map(move |(&c, &v)| (r as u32, c, v))
        })
    }
}

/// Compressed sparse column matrix over a sparse column id space.
#[derive(Debug, Clone, Default)]
pub struct CscMatrix {
    column_ids: Vec<u32>,
    offsets: Vec<usize>,
    rows: Vec<u32>,
    values: Vec<LogProb>,
}

impl CscMatrix {
    pub fn from_triplets(mut triplets: Vec<Triplet>) -> Self {
        sort_and_dedup(&mut triplets, true);

        let mut column_ids = Vec::new();
        let mut offsets = vec![0usize];
        for (i, &(_, column, _)) in triplets.iter().enumerate() {
            if column_ids.last() != Some(&column) {
                if i > 0 {
                    offsets.push(i);
                }
                column_ids.push(column);
            }
        }
        if !triplets.is_empty() {
            offsets.push(triplets.len());
        }

        CscMatrix {
            column_ids,
            offsets,
            rows: triplets.iter().map(|t| t.0).collect(),
            values: triplets.iter().map(|t| t.2).collect(),
        }
    }

    /// Number of non-empty columns.
    pub fn num_columns(&self) -> usize {
        self.column_ids.len()
    }

    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    /// Sorted ids of the non-empty columns.
    pub fn column_ids(&self) -> &[u32] {
        &self.column_ids
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// The `i`-th stored column (by position, not id).
    #[inline(always)]
    pub fn column_at(&self, i: usize) -> (u32, &[u32], &[LogProb]) {
        let range = self.offsets[i]..self.offsets[i + 1];
        (
            self.column_ids[i],
            &self.rows[range.clone()],
            &self.values[range],
        )
    }

    /// Rows and values of the column with the given id.
    #[inline]
    pub fn column(&self, id: u32) -> Option<(&[u32], &[LogProb])> {
        self.column_ids.binary_search(&id).ok().map(|i| {
            let (_, rows, values) = self.column_at(i);
            (rows, values)
        })
    }

    pub fn get(&self, row: u32, column: u32) -> Option<LogProb> {
        let (rows, values) = self.column(column)?;
        // Rows within a column are sorted by construction.
        rows.binary_search(&row).ok().map(|i| values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = Triplet> + '_ {
        (0..self.num_columns()).flat_map(move |i| {
            let (column, rows, values) = self.column_at(i);
            rows.iter().zip(values).map(move |(&r, &v)| (r, column, v))
        })
    }
}
