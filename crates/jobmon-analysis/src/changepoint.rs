//! Non-parametric change-point detection (ED-PELT).
//!
//! Pruned exact linear time search over an empirical-distribution cost
//! function approximated with `quantiles` partial sums. The penalty is
//! `3 ln n`.

/// Partial sums per quantile: `sums[i][tau]` counts, over `data[..tau]`,
/// 2 for every value below the i-th threshold and 1 for every value equal
/// to it.
fn partial_sums(data: &[f64], k: usize) -> Vec<Vec<u32>> {
    let n = data.len();
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);

    let base = (2 * n - 1) as f64;
    (0..k)
        .map(|i| {
            let z = -1.0 + (2 * i + 1) as f64 / k as f64;
            let p = 1.0 / (1.0 + base.powf(-z));
            let t = sorted[((n - 1) as f64 * p).trunc() as usize];

            let mut sums = vec![0u32; n + 1];
            for tau in 1..=n {
                let v = data[tau - 1];
                sums[tau] = sums[tau - 1]
                    + if v < t {
                        2
                    } else if v == t {
                        1
                    } else {
                        0
                    };
            }
            sums
        })
        .collect()
}

fn segment_cost(sums: &[Vec<u32>], tau1: usize, tau2: usize, n: usize) -> f64 {
    let len = (tau2 - tau1) as f64;
    let mut total = 0.0;
    for row in sums {
        let actual = row[tau2] - row[tau1];
        if actual != 0 && actual as usize != (tau2 - tau1) * 2 {
            let fit = actual as f64 * 0.5 / len;
            total += len * (fit * fit.ln() + (1.0 - fit) * (1.0 - fit).ln());
        }
    }
    let c = -((2 * n - 1) as f64).ln();
    2.0 * c / sums.len() as f64 * total
}

/// Indexes of change points in `data`, ascending.
///
/// Each index is the last element of a segment. Segments are at least
/// `min_distance` long; `quantiles` is capped at the series length. Series
/// shorter than three points have no change points.
pub fn non_parametric(data: &[f64], min_distance: usize, quantiles: usize) -> Vec<usize> {
    let n = data.len();
    let min_distance = min_distance.max(1);
    if n <= 2 || min_distance > n || quantiles == 0 {
        return Vec::new();
    }

    let penalty = 3.0 * (n as f64).ln();
    let k = quantiles.min(n);
    let sums = partial_sums(data, k);
    let cost = |tau1: usize, tau2: usize| segment_cost(&sums, tau1, tau2, n);

    let mut best_cost = vec![0.0; n + 1];
    let mut previous = vec![0usize; n + 1];
    best_cost[0] = -penalty;
    for tau in min_distance..(2 * min_distance).min(n + 1) {
        best_cost[tau] = cost(0, tau);
    }

    let mut candidates = vec![0, min_distance];
    let mut costs = Vec::with_capacity(n + 1);
    for tau in 2 * min_distance..=n {
        costs.clear();
        costs.extend(
            candidates
                .iter()
                .map(|&prev| best_cost[prev] + cost(prev, tau) + penalty),
        );

        let (best_idx, best) = costs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::INFINITY), |acc, (i, c)| if c < acc.1 { (i, c) } else { acc });
        best_cost[tau] = best;
        previous[tau] = candidates[best_idx];

        let mut kept = 0;
        for i in 0..candidates.len() {
            if costs[i] < best + penalty {
                candidates[kept] = candidates[i];
                kept += 1;
            }
        }
        candidates.truncate(kept);
        candidates.push(tau + 1 - min_distance);
    }

    let mut indexes = Vec::new();
    let mut current = previous[n];
    while current != 0 {
        indexes.push(current - 1);
        current = previous[current];
    }
    indexes.reverse();
    indexes
}
