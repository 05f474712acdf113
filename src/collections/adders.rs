use std::ops::AddAssign;

/// Combines two values mapped to the same key.
///
/// Merging relies on the adder being associative and commutative: partial
/// results arrive from threads and ranks in no particular order.
pub trait Adder<V>: Send + Sync {
    fn add(&self, acc: &mut V, value: V);
}

impl<V, F> Adder<V> for F
where
    F: Fn(&mut V, V) + Send + Sync,
{
    fn add(&self, acc: &mut V, value: V) {
        self(acc, value)
    }
}

// Numeric sum
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<V: AddAssign> Adder<V> for Sum {
    fn add(&self, acc: &mut V, value: V) {
        *acc += value;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl<V: PartialOrd> Adder<V> for Max {
    fn add(&self, acc: &mut V, value: V) {
        if value > *acc {
            *acc = value;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl<V: PartialOrd> Adder<V> for Min {
    fn add(&self, acc: &mut V, value: V) {
        if value < *acc {
            *acc = value;
        }
    }
}

/// Appends list values; the resulting order depends on merge order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Concat;

impl<T> Adder<Vec<T>> for Concat {
    fn add(&self, acc: &mut Vec<T>, mut value: Vec<T>) {
        acc.append(&mut value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_adders() {
        let mut v = 3i64;
        Sum.add(&mut v, 4);
        assert_eq!(v, 7);

        let mut f = 1.5f64;
        Sum.add(&mut f, 0.25);
        assert_eq!(f, 1.75);

        let mut m = 3u32;
        Max.add(&mut m, 9);
        Max.add(&mut m, 2);
        assert_eq!(m, 9);
        Min.add(&mut m, 4);
        assert_eq!(m, 4);

        let mut list = vec![1, 2];
        Concat.add(&mut list, vec![3]);
        assert_eq!(list, vec![1, 2, 3]);
    }

    #[test]
    fn test_closure_adder() {
        let longest = |acc: &mut String, v: String| {
            if v.len() > acc.len() {
                *acc = v;
            }
        };
        let mut s = "ab".to_string();
        longest.add(&mut s, "abcd".to_string());
        longest.add(&mut s, "x".to_string());
        assert_eq!(s, "abcd");
    }
}
