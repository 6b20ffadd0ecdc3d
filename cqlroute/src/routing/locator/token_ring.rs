/// A token ring is a continuous hash ring. A key is hashed onto the ring and
/// owned by the first member found walking the ring in the direction of
/// increasing tokens.
///
/// Members are kept sorted by token, so finding the owner of a token is a
/// binary search. The walk wraps from the largest token back to the smallest.
#[derive(Debug, Clone)]
pub struct TokenRing<T, ElemT> {
    ring: Vec<(T, ElemT)>,
}

impl<T: Ord, ElemT> TokenRing<T, ElemT> {
    pub(crate) const fn new_empty() -> Self {
        Self { ring: Vec::new() }
    }

    pub(crate) fn new(ring_iter: impl Iterator<Item = (T, ElemT)>) -> Self {
        let mut ring: Vec<(T, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(T, ElemT)> {
        self.ring.iter()
    }

    /// Iterates over the whole ring once, starting at the first member whose
    /// token is not smaller than `token` and wrapping around after the largest.
    pub fn ring_range_full(&self, token: &T) -> impl Iterator<Item = &(T, ElemT)> {
        let start = self.ring.partition_point(|(t, _)| t < token);

        self.ring[start..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
    }

    /// Like [`ring_range_full`](Self::ring_range_full), yielding members only.
    pub fn ring_range(&self, token: &T) -> impl Iterator<Item = &ElemT> {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// The member owning `token`: the successor of `token` on the ring.
    pub fn get_elem_for_token(&self, token: &T) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    /// Get the total number of members in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` if the token ring contains no elements.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TokenRing;
    use crate::routing::Token;

    fn range_from(ring: &TokenRing<Token, i32>, token: i64) -> Vec<i32> {
        ring.ring_range(&Token::new(token)).cloned().collect()
    }

    #[test]
    fn test_token_ring() {
        let ring_data = [30, -10, 0, -30, 20, 10, -20].map(|t| (Token::new(t), (t / 10) as i32));

        let ring: TokenRing<Token, i32> = TokenRing::new(ring_data.into_iter());
        assert_eq!(ring.len(), 7);

        assert_eq!(range_from(&ring, -35), vec![-3, -2, -1, 0, 1, 2, 3]);
        assert_eq!(range_from(&ring, -30), vec![-3, -2, -1, 0, 1, 2, 3]);
        assert_eq!(range_from(&ring, -25), vec![-2, -1, 0, 1, 2, 3, -3]);
        assert_eq!(range_from(&ring, -10), vec![-1, 0, 1, 2, 3, -3, -2]);
        assert_eq!(range_from(&ring, 5), vec![1, 2, 3, -3, -2, -1, 0]);
        assert_eq!(range_from(&ring, 25), vec![3, -3, -2, -1, 0, 1, 2]);
        assert_eq!(range_from(&ring, 30), vec![3, -3, -2, -1, 0, 1, 2]);
        assert_eq!(range_from(&ring, 35), vec![-3, -2, -1, 0, 1, 2, 3]);
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring: TokenRing<Token, i32> = TokenRing::new_empty();
        assert!(ring.is_empty());
        assert_eq!(ring.get_elem_for_token(&Token::new(0)), None);
    }
}
