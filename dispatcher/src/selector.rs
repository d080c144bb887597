//! Weight-proportional sampling for rules and destinations.
//!
//! The random source is injected so tests can drive selection with a
//! seeded generator. Ties and the all-zero-weight degenerate case
//! resolve to the earliest entry, which makes first-appearance order
//! part of the observable contract.

use rand::Rng;

/// Picks an index with probability `w_i / Σw_j`.
pub fn pick_index<R: Rng + ?Sized>(weights: &[u64], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return Some(0);
    }

    let mut draw = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if draw < *weight {
            return Some(index);
        }
        draw -= weight;
    }
    // Unreachable: the cumulative walk covers [0, total).
    Some(weights.len() - 1)
}

/// Picks one item using the supplied weight accessor.
pub fn pick<'a, T, R, W>(items: &'a [T], weight: W, rng: &mut R) -> Option<&'a T>
where
    R: Rng + ?Sized,
    W: Fn(&T) -> u64,
{
    let weights: Vec<u64> = items.iter().map(&weight).collect();
    pick_index(&weights, rng).map(|i| &items[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn empty_input_picks_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_index(&[], &mut rng), None);
    }

    #[test]
    fn zero_total_weight_picks_the_first() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pick_index(&[0, 0, 0], &mut rng), Some(0));
    }

    #[test]
    fn zero_weight_entries_are_never_picked() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            assert_eq!(pick_index(&[0, 5, 0], &mut rng), Some(1));
        }
    }

    #[test]
    fn frequencies_track_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let weights = [100u64, 100];
        let mut counts = [0u32; 2];
        for _ in 0..2000 {
            counts[pick_index(&weights, &mut rng).unwrap()] += 1;
        }
        // 2000 draws at 50/50: both sides within statistical tolerance.
        assert!((930..=1070).contains(&counts[0]), "counts = {counts:?}");
        assert!((930..=1070).contains(&counts[1]), "counts = {counts:?}");
    }

    #[test]
    fn skewed_weights_skew_the_sample() {
        let mut rng = StdRng::seed_from_u64(42);
        let weights = [90u64, 10];
        let mut counts = [0u32; 2];
        for _ in 0..2000 {
            counts[pick_index(&weights, &mut rng).unwrap()] += 1;
        }
        let share = f64::from(counts[0]) / 2000.0;
        assert!((0.86..=0.94).contains(&share), "share = {share}");
    }

    #[test]
    fn pick_returns_a_reference_into_the_slice() {
        let mut rng = StdRng::seed_from_u64(1);
        let items = [("a", 0u64), ("b", 3)];
        let picked = pick(&items, |(_, w)| *w, &mut rng).unwrap();
        assert_eq!(picked.0, "b");
    }
}
