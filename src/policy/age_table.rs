use crate::globals::{AGE_TABLE_SIZE, MAX_AGE};

/// Words of surviving objects per age, gathered during a pause.
#[derive(Clone, Debug)]
pub struct AgeTable {
    sizes: [usize; AGE_TABLE_SIZE],
}

impl AgeTable {
    pub const fn new() -> Self {
        Self {
            sizes: [0; AGE_TABLE_SIZE],
        }
    }

    pub fn clear(&mut self) {
        self.sizes = [0; AGE_TABLE_SIZE];
    }

    #[inline]
    pub fn add(&mut self, age: u8, words: usize) {
        self.sizes[age.min(MAX_AGE) as usize] += words;
    }

    pub fn merge(&mut self, other: &AgeTable) {
        for (mine, theirs) in self.sizes.iter_mut().zip(other.sizes.iter()) {
            *mine += *theirs;
        }
    }

    pub fn words_at(&self, age: u8) -> usize {
        self.sizes[age.min(MAX_AGE) as usize]
    }

    pub fn total(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Smallest age at which the cumulative survivor volume exceeds the desired
    /// survivor size, capped at `max_threshold`.
    pub fn compute_tenuring_threshold(&self, desired_survivor_words: usize, max_threshold: u8) -> u8 {
        let mut total = 0;
        let mut age = 1u8;
        while (age as usize) < AGE_TABLE_SIZE {
            total += self.sizes[age as usize];
            if total > desired_survivor_words {
                break;
            }
            age += 1;
        }
        age.min(max_threshold)
    }
}

impl Default for AgeTable {
    fn default() -> Self {
        Self::new()
    }
}
