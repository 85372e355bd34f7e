use std::ops::Deref;

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not a permutation of 0..n")]
pub struct InvalidPermutation;

/// A permutation `π` of `0..n`; applying it yields `out[i] = in[π(i)]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Permutation(Vec<usize>);

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self((0..n).collect())
    }

    pub fn random<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Self {
        let mut v: Vec<_> = (0..n).collect();
        v.shuffle(rng);
        Self(v)
    }

    pub fn inverse(&self) -> Self {
        let mut v = vec![0; self.len()];
        for (i, &p) in self.iter().enumerate() {
            v[p] = i;
        }
        Self(v)
    }

    /// Returns a permuted copy of `items`.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.iter().map(|&p| items[p].clone()).collect()
    }
}

impl Deref for Permutation {
    type Target = [usize];
    fn deref(&self) -> &[usize] {
        &self.0
    }
}

impl TryFrom<Vec<usize>> for Permutation {
    type Error = InvalidPermutation;

    fn try_from(v: Vec<usize>) -> Result<Self, Self::Error> {
        let mut sorted = v.clone();
        sorted.sort_unstable();
        if sorted.into_iter().ne(0..v.len()) {
            return Err(InvalidPermutation);
        }
        Ok(Self(v))
    }
}
