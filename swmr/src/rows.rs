use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces the values of the rows the writer appends.
pub trait RowSource {
    /// Fills `out` with consecutive rows of `width` values, the first being row `first_row`.
    fn fill(&mut self, first_row: usize, width: usize, out: &mut [f32]);
}

/// Uniform `[0, 1)` values.
pub struct RandomRows {
    rng: StdRng,
}

impl RandomRows {
    pub fn new(seed: Option<u64>) -> RandomRows {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        RandomRows { rng }
    }
}

impl RowSource for RandomRows {
    fn fill(&mut self, _first_row: usize, _width: usize, out: &mut [f32]) {
        for v in out.iter_mut() {
            *v = self.rng.gen::<f32>();
        }
    }
}

/// Every value of row `i` is `i`, which makes appended data checkable.
pub struct RowIndexRows;

impl RowSource for RowIndexRows {
    fn fill(&mut self, first_row: usize, width: usize, out: &mut [f32]) {
        for (i, row) in out.chunks_mut(width.max(1)).enumerate() {
            let value = (first_row + i) as f32;
            row.iter_mut().for_each(|v| *v = value);
        }
    }
}
