//! Bit-level decomposition of integer weight matrices.
//!
//! The bit-serial multiply-accumulate hardware consumes a weight matrix one
//! two's-complement bit-plane at a time: an `N x K` matrix of `S`-bit weights
//! becomes `S * N` binary rows, each tagged with its bit level (0 = LSB) and
//! the output channel its partial products accumulate into.

mod distribution;
mod matrix;

pub use distribution::ProbabilityDistribution;
pub use matrix::IntMatrix;

/// One binary row of a bit-sliced weight matrix.
#[derive(Clone, Debug)]
pub struct TransRow {
    pub bits: Vec<bool>,
    /// Bit level of this row; 0 is the least significant bit.
    pub bit_level: u32,
    /// Output channel the row's partial products accumulate into.
    pub target_accumulator: usize,
    /// The row's bits read as an MSB-first integer.
    pub value: u64,
    pub popcount: u32,
}

impl TransRow {
    pub fn new(bits: Vec<bool>, bit_level: u32, target_accumulator: usize) -> Self {
        let value = bits.iter().fold(0u64, |v, &b| (v << 1) | u64::from(b));
        let popcount = bits.iter().filter(|&&b| b).count() as u32;
        Self {
            bits,
            bit_level,
            target_accumulator,
            value,
            popcount,
        }
    }
}

/// An ordered collection of [`TransRow`]s, as fed to a hardware engine.
#[derive(Clone, Debug, Default)]
pub struct MatrixSlice {
    rows: Vec<TransRow>,
}

impl MatrixSlice {
    pub fn new(rows: Vec<TransRow>) -> Self {
        Self { rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row_width(&self) -> usize {
        self.rows.first().map_or(0, |r| r.bits.len())
    }

    pub fn rows(&self) -> &[TransRow] {
        &self.rows
    }

    pub fn push(&mut self, row: TransRow) {
        self.rows.push(row);
    }

    pub fn rows_at_level(&self, bit_level: u32) -> impl Iterator<Item = &TransRow> {
        self.rows.iter().filter(move |r| r.bit_level == bit_level)
    }

    pub fn bit_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.rows.iter().map(|r| r.bit_level).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }

    pub fn target_accumulators(&self) -> Vec<usize> {
        let mut targets: Vec<usize> = self.rows.iter().map(|r| r.target_accumulator).collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }
}

impl std::ops::Index<usize> for MatrixSlice {
    type Output = TransRow;

    fn index(&self, index: usize) -> &TransRow {
        &self.rows[index]
    }
}

/// The S-bit two's-complement representation of `value`, MSB first,
/// saturating to the representable range.
pub fn to_twos_complement(value: i64, s_bits: u32) -> Vec<bool> {
    assert!((1..=32).contains(&s_bits), "unsupported bit width {s_bits}");
    let min = -(1i64 << (s_bits - 1));
    let max = (1i64 << (s_bits - 1)) - 1;
    let clipped = value.clamp(min, max);
    let encoded = if clipped < 0 {
        (1i64 << s_bits) + clipped
    } else {
        clipped
    } as u64;
    (0..s_bits)
        .rev()
        .map(|bit| encoded >> bit & 1 == 1)
        .collect()
}

/// Bit-slice an `N x K` weight matrix into `S * N` binary rows.
///
/// Source row `i`, bit `s` (0 = MSB) lands in output row `i * S + s` with
/// `bit_level = S - 1 - s`; the output channel is the source row index.
pub fn slice_matrix(matrix: &IntMatrix, s_bits: u32) -> MatrixSlice {
    let mut rows = Vec::with_capacity(matrix.rows() * s_bits as usize);
    for i in 0..matrix.rows() {
        let element_bits: Vec<Vec<bool>> = (0..matrix.cols())
            .map(|j| to_twos_complement(matrix[(i, j)], s_bits))
            .collect();
        for s in 0..s_bits as usize {
            let bits: Vec<bool> = element_bits.iter().map(|e| e[s]).collect();
            rows.push(TransRow::new(bits, s_bits - 1 - s as u32, i));
        }
    }
    MatrixSlice::new(rows)
}
