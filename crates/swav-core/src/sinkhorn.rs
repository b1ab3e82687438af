//! Balanced-transport normalization of prototype similarities.

use ndarray::{Array2, Axis};

use crate::collective::Collective;
use crate::Result;

/// Balances a `K x B` non-negative similarity matrix into soft assignments.
///
/// Takes the matrix by value: it is rescaled in place across the iterations
/// and must not be aliased by the caller. Row marginals are driven towards
/// `1/K` and column marginals towards `1/(world_size * B)`; both the global
/// mass and the per-iteration row sums are summed across the worker group so
/// every worker normalizes against the global batch rather than its local
/// shard. Returns the transpose normalized once more by its column sums, a
/// `B x K` matrix whose rows are per-sample assignment distributions.
///
/// Callers must guarantee `K, B > 0` and strictly positive entries (upstream
/// exponentiation of temperature-scaled scores provides this); degenerate
/// marginals are not special-cased here. `iterations == 0` skips refinement
/// and yields the plain column normalization of the mass-scaled input.
pub fn balanced_assignments<C: Collective>(
    mut q: Array2<f32>,
    iterations: usize,
    collective: &C,
) -> Result<Array2<f32>> {
    let (num_prototypes, batch) = q.dim();

    let mut mass = [q.sum()];
    collective.all_reduce_sum(&mut mass)?;
    let mass = mass[0];
    q.mapv_inplace(|v| v / mass);

    let row_target = 1.0 / num_prototypes as f32;
    let col_target = 1.0 / (collective.world_size() as f32 * batch as f32);

    for _ in 0..iterations {
        let mut row_sums = q.sum_axis(Axis(1)).to_vec();
        collective.all_reduce_sum(&mut row_sums)?;
        for (mut row, sum) in q.rows_mut().into_iter().zip(row_sums) {
            let scale = row_target / sum;
            row.mapv_inplace(|v| v * scale);
        }

        let col_sums = q.sum_axis(Axis(0));
        for (mut col, sum) in q.columns_mut().into_iter().zip(col_sums.iter()) {
            let scale = col_target / sum;
            col.mapv_inplace(|v| v * scale);
        }
    }

    let col_sums = q.sum_axis(Axis(0));
    for (mut col, sum) in q.columns_mut().into_iter().zip(col_sums.iter()) {
        col.mapv_inplace(|v| v / sum);
    }

    Ok(q.reversed_axes().as_standard_layout().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::SingleProcess;
    use ndarray::array;

    #[test]
    fn output_rows_are_distributions() {
        let q = array![[0.9f32, 0.1], [0.4, 1.3], [0.2, 0.6], [1.1, 0.05]];
        let assignments = balanced_assignments(q, 3, &SingleProcess).unwrap();
        assert_eq!(assignments.dim(), (2, 4));
        for row in assignments.rows() {
            let sum: f32 = row.sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
        }
    }

    #[test]
    fn zero_iterations_is_scaling_invariant() {
        let q = array![[0.5f32, 1.5, 0.25], [2.0, 0.75, 1.0]];
        let scaled = q.mapv(|v| v * 37.5);
        let base = balanced_assignments(q, 0, &SingleProcess).unwrap();
        let rescaled = balanced_assignments(scaled, 0, &SingleProcess).unwrap();
        for (a, b) in base.iter().zip(rescaled.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
