use std::collections::VecDeque;

/// Mean over the last `N` values, with the sum maintained incrementally
pub struct RollingMean<const N: usize> {
    values: VecDeque<f64>,
    cached_sum: f64,
}

impl<const N: usize> Default for RollingMean<N> {
    fn default() -> Self {
        RollingMean {
            values: VecDeque::with_capacity(N),
            cached_sum: 0.0,
        }
    }
}

impl<const N: usize> RollingMean<N> {
    pub fn add_value(&mut self, value: f64) {
        if self.values.len() == N {
            if let Some(evicted) = self.values.pop_front() {
                self.cached_sum -= evicted;
            }
        }
        self.values.push_back(value);
        self.cached_sum += value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.cached_sum / self.values.len() as f64)
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], None)]
    #[case::single(vec![4.0], Some(4.0))]
    #[case::partial(vec![1.0, 2.0, 3.0], Some(2.0))]
    #[case::full(vec![1.0, 2.0, 3.0, 6.0], Some(3.0))]
    #[case::evicting(vec![100.0, 1.0, 2.0, 3.0, 6.0], Some(3.0))]
    #[case::evicting_twice(vec![100.0, 100.0, 1.0, 2.0, 3.0, 6.0], Some(3.0))]
    fn test_mean(#[case] values: Vec<f64>, #[case] expected: Option<f64>) {
        let mut rolling = RollingMean::<4>::default();
        for v in &values {
            rolling.add_value(*v);
        }
        assert_eq!(rolling.mean(), expected);
        assert_eq!(rolling.len(), values.len().min(4));
        assert_eq!(rolling.last(), values.last().copied());
    }
}
