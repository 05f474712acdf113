/// Round-robin over several iterators, one item from each in turn.
///
/// Exhausted iterators are dropped from the rotation. Used to hand out the
/// splits of all partitions so that consecutive splits come from different
/// partitions.
pub struct Interleave<I> {
    iterators: Vec<Option<I>>,
    next: usize,
}

impl<I: Iterator> Interleave<I> {
    pub fn new(iterators: Vec<I>) -> Self {
        Self {
            iterators: iterators.into_iter().map(Some).collect(),
            next: 0,
        }
    }
}

impl<I: Iterator> Iterator for Interleave<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.iterators.len();
        for _ in 0..n {
            let i = self.next;
            self.next = (self.next + 1) % n;
            if let Some(it) = self.iterators[i].as_mut() {
                match it.next() {
                    Some(item) => return Some(item),
                    None => self.iterators[i] = None,
                }
            }
        }
        None
    }
}
