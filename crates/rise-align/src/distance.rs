use rise_types::TokenId;

/// Unit-cost Levenshtein distance between two token sequences.
pub fn edit_distance(left: &[TokenId], right: &[TokenId]) -> usize {
    let mut previous: Vec<usize> = (0..=right.len()).collect();
    let mut current = vec![0; right.len() + 1];
    for (i, left_token) in left.iter().enumerate() {
        current[0] = i + 1;
        for (j, right_token) in right.iter().enumerate() {
            let substitution = previous[j] + usize::from(left_token != right_token);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[right.len()]
}

/// Mean distance over `(current, target)` pairs; zero for an empty set.
pub fn mean_edit_distance<'a, I>(pairs: I) -> f64
where
    I: IntoIterator<Item = (&'a [TokenId], &'a [TokenId])>,
{
    let (total, count) = pairs
        .into_iter()
        .fold((0usize, 0usize), |(total, count), (left, right)| {
            (total + edit_distance(left, right), count + 1)
        });
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::{edit_distance, mean_edit_distance};

    #[test]
    fn distance_counts_unit_edits() {
        assert_eq!(edit_distance(&[], &[]), 0);
        assert_eq!(edit_distance(&[1, 2, 3], &[]), 3);
        assert_eq!(edit_distance(&[], &[4, 5]), 2);
        assert_eq!(edit_distance(&[5, 6, 7], &[5, 8, 7]), 1);
        assert_eq!(edit_distance(&[1, 2, 3, 4], &[2, 3, 4, 5]), 2);
    }

    #[test]
    fn mean_distance_handles_empty_input() {
        let pairs: Vec<(&[u32], &[u32])> = Vec::new();
        assert_eq!(mean_edit_distance(pairs), 0.0);
        let a = [1u32, 2];
        let b = [1u32, 3];
        assert_eq!(mean_edit_distance([(&a[..], &b[..]), (&a[..], &a[..])]), 0.5);
    }
}
