use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QuartileError {
    #[error("too small dataset ({0} items)")]
    TooSmallDataset(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quartiles {
    pub q1: f64,
    pub q2: f64,
    pub q3: f64,
}

impl Quartiles {
    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }
}

fn median(sorted: &[usize]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) as f64 / 2.0
    }
}

/// Quartiles of an ascending slice.
///
/// Q1 and Q3 are medians of the lower and upper halves, the middle value
/// of an odd-sized slice belongs to neither half.
pub fn quartiles(sorted: &[usize]) -> Result<Quartiles, QuartileError> {
    let n = sorted.len();
    if n < 4 {
        return Err(QuartileError::TooSmallDataset(n));
    }
    let half = n / 2;
    let upper_start = if n % 2 == 1 { half + 1 } else { half };
    Ok(Quartiles {
        q1: median(&sorted[..half]),
        q2: median(sorted),
        q3: median(&sorted[upper_start..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_dataset() {
        let q = quartiles(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(q.q1, 2.5);
        assert_eq!(q.q2, 4.5);
        assert_eq!(q.q3, 6.5);
        assert_eq!(q.iqr(), 4.0);
    }

    #[test]
    fn test_odd_dataset_excludes_median() {
        let q = quartiles(&[1, 3, 5, 7, 9]).unwrap();
        assert_eq!(q.q1, 2.0);
        assert_eq!(q.q2, 5.0);
        assert_eq!(q.q3, 8.0);
    }

    #[test]
    fn test_too_small() {
        assert_eq!(
            quartiles(&[1, 2, 3]),
            Err(QuartileError::TooSmallDataset(3))
        );
    }
}
