use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on logical processor indices the layer tracks.
pub const MAX_SUPPORTED_CPUS: usize = 1024;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_SUPPORTED_CPUS / WORD_BITS;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AffinityError {
    #[error("Malformed processor range entry {0:?}")]
    Malformed(String),
    #[error("Processor index {0} exceeds the supported maximum of 1024")]
    OutOfRange(usize),
    #[error("Processor range {start}-{end} is reversed")]
    Reversed { start: usize, end: usize },
}

/// Fixed-capacity set of logical processor indices.
///
/// Used both for the process affinity set and for administrator supplied
/// processor lists. Indices at or above [`MAX_SUPPORTED_CPUS`] are never
/// members.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AffinitySet {
    words: [u64; WORDS],
}

impl AffinitySet {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Every processor in `[0, count)`.
    pub fn first_n(count: usize) -> Self {
        (0..count.min(MAX_SUPPORTED_CPUS)).collect()
    }

    /// Processors whose bit is set in a 64-bit mask.
    pub fn from_mask(mask: u64) -> Self {
        let mut set = Self::new();
        set.words[0] = mask;
        set
    }

    pub fn add(&mut self, cpu: usize) {
        debug_assert!(cpu < MAX_SUPPORTED_CPUS, "processor {cpu} out of range");
        if cpu < MAX_SUPPORTED_CPUS {
            self.words[cpu / WORD_BITS] |= 1u64 << (cpu % WORD_BITS);
        }
    }

    pub fn remove(&mut self, cpu: usize) {
        if cpu < MAX_SUPPORTED_CPUS {
            self.words[cpu / WORD_BITS] &= !(1u64 << (cpu % WORD_BITS));
        }
    }

    #[inline]
    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_SUPPORTED_CPUS && self.words[cpu / WORD_BITS] & (1u64 << (cpu % WORD_BITS)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn is_subset_of(&self, other: &AffinitySet) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & !b == 0)
    }

    /// Drops every member not present in `other`.
    pub fn intersect_with(&mut self, other: &AffinitySet) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= *b;
        }
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_SUPPORTED_CPUS).filter(move |&cpu| self.contains(cpu))
    }

    /// The `n`-th member in ascending order, 0-based.
    pub fn nth_member(&self, n: usize) -> Option<usize> {
        let mut remaining = n;
        for (index, &word) in self.words.iter().enumerate() {
            let ones = word.count_ones() as usize;
            if remaining >= ones {
                remaining -= ones;
                continue;
            }
            let mut bits = word;
            for _ in 0..remaining {
                bits &= bits - 1;
            }
            return Some(index * WORD_BITS + bits.trailing_zeros() as usize);
        }
        None
    }

    /// Parses a comma separated list of `a` or `a-b` entries.
    ///
    /// The whole input is validated before anything is returned, so a
    /// malformed entry never yields a partially populated set.
    pub fn parse_ranges(config: &str) -> Result<Self, AffinityError> {
        let mut set = Self::new();
        if config.trim().is_empty() {
            return Ok(set);
        }

        for entry in config.split(',') {
            let (start, end) = parse_index_or_range(entry)?;
            for cpu in start..=end {
                set.add(cpu);
            }
        }

        Ok(set)
    }
}

/// Parses one `a` or `a-b` entry into inclusive processor bounds.
pub fn parse_index_or_range(entry: &str) -> Result<(usize, usize), AffinityError> {
    let entry = entry.trim();
    let malformed = || AffinityError::Malformed(entry.to_string());

    let (start, end) = match entry.split_once('-') {
        Some((start, end)) => (parse_index(start).ok_or_else(malformed)?, parse_index(end).ok_or_else(malformed)?),
        None => {
            let index = parse_index(entry).ok_or_else(malformed)?;
            (index, index)
        }
    };

    if end >= MAX_SUPPORTED_CPUS {
        return Err(AffinityError::OutOfRange(end));
    }
    if start > end {
        return Err(AffinityError::Reversed { start, end });
    }

    Ok((start, end))
}

fn parse_index(text: &str) -> Option<usize> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

impl Default for AffinitySet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<usize> for AffinitySet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for cpu in iter {
            set.add(cpu);
        }
        set
    }
}

impl FromStr for AffinitySet {
    type Err = AffinityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_ranges(s)
    }
}

impl fmt::Debug for AffinitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
