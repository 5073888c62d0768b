//! Lane-parallel execution
//!
//! Lanes within one decode step never depend on each other, so the layer stack
//! for each lane can run on its own worker. The `parallel` feature routes this
//! through rayon; without it the map falls back to a sequential loop with
//! the same signature and the same output order.

use crate::error::DecodeResult;

/// Map owned items to results, short-circuiting on the first error.
///
/// Results come back in input order regardless of scheduling, which keeps
/// lane `i` of the output aligned with lane `i` of the input.
#[cfg(feature = "parallel")]
pub fn parallel_try_map_owned<I, T, F>(items: Vec<I>, f: F) -> DecodeResult<Vec<T>>
where
    I: Send,
    T: Send,
    F: Fn(usize, I) -> DecodeResult<T> + Send + Sync,
{
    use rayon::prelude::*;
    items
        .into_par_iter()
        .enumerate()
        .map(|(idx, item)| f(idx, item))
        .collect()
}

/// Sequential fallback for `parallel_try_map_owned`.
#[cfg(not(feature = "parallel"))]
pub fn parallel_try_map_owned<I, T, F>(items: Vec<I>, f: F) -> DecodeResult<Vec<T>>
where
    F: Fn(usize, I) -> DecodeResult<T>,
{
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| f(idx, item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn test_try_map_owned_order_preserved() {
        let items: Vec<usize> = (0..100).collect();
        let results = parallel_try_map_owned(items, |idx, item| Ok(idx * 1000 + item))
            .expect("map should succeed");
        let expected: Vec<usize> = (0..100).map(|i| i * 1000 + i).collect();
        assert_eq!(results, expected);
    }

    #[test]
    fn test_try_map_owned_moves_items() {
        let items = vec![vec![1_u32], vec![2, 3], vec![]];
        let lens = parallel_try_map_owned(items, |_, item| Ok(item.len()))
            .expect("map should succeed");
        assert_eq!(lens, vec![1, 2, 0]);
    }

    #[test]
    fn test_try_map_owned_error() {
        let results: DecodeResult<Vec<usize>> =
            parallel_try_map_owned((0..4).collect(), |idx, _: usize| {
                if idx == 2 {
                    Err(DecodeError::Model("lane 2 failed".into()))
                } else {
                    Ok(idx)
                }
            });
        assert!(matches!(results, Err(DecodeError::Model(_))));
    }
}
