//! Compressed bit-indexed set of `u32` identifiers.
//!
//! The id space is split into 65 536 chunks keyed by the high 16 bits. Each
//! non-empty chunk is stored either as a sorted array of low halves (sparse) or
//! as a 1024-word bitmap (dense). Empty chunks are never stored, so an idle
//! queue with a few million historical ids still costs only the chunks that
//! currently hold members.

use std::collections::btree_map::{self, Entry};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, RangeInclusive, Sub};

/// Above this many members a chunk is kept as a bitmap.
const ARRAY_MAX: usize = 4096;
const BITMAP_WORDS: usize = 1024;

type Words = Box<[u64; BITMAP_WORDS]>;

fn empty_words() -> Words {
    Box::new([0u64; BITMAP_WORDS])
}

fn test_bit(words: &[u64; BITMAP_WORDS], low: u16) -> bool {
    words[usize::from(low >> 6)] & (1u64 << (low & 63)) != 0
}

fn set_bit(words: &mut [u64; BITMAP_WORDS], low: u16) {
    words[usize::from(low >> 6)] |= 1u64 << (low & 63);
}

fn clear_bit(words: &mut [u64; BITMAP_WORDS], low: u16) {
    words[usize::from(low >> 6)] &= !(1u64 << (low & 63));
}

fn split(id: u32) -> (u16, u16) {
    ((id >> 16) as u16, id as u16)
}

fn join(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

fn merge_sorted(a: &[u16], b: &[u16]) -> Vec<u16> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[derive(Clone)]
enum Container {
    Array(Vec<u16>),
    Bitmap { words: Words, len: usize },
}

impl Container {
    fn from_sorted(values: Vec<u16>) -> Self {
        if values.len() > ARRAY_MAX {
            let mut words = empty_words();
            for &v in &values {
                set_bit(&mut words, v);
            }
            Container::Bitmap {
                words,
                len: values.len(),
            }
        } else {
            Container::Array(values)
        }
    }

    fn from_words(words: Words) -> Self {
        let len = words.iter().map(|w| w.count_ones() as usize).sum();
        let mut container = Container::Bitmap { words, len };
        if len <= ARRAY_MAX {
            container.to_array();
        }
        container
    }

    fn len(&self) -> usize {
        match self {
            Container::Array(values) => values.len(),
            Container::Bitmap { len, .. } => *len,
        }
    }

    fn contains(&self, low: u16) -> bool {
        match self {
            Container::Array(values) => values.binary_search(&low).is_ok(),
            Container::Bitmap { words, .. } => test_bit(words, low),
        }
    }

    fn insert(&mut self, low: u16) -> bool {
        let (inserted, overflow) = match self {
            Container::Array(values) => match values.binary_search(&low) {
                Ok(_) => (false, false),
                Err(pos) => {
                    values.insert(pos, low);
                    (true, values.len() > ARRAY_MAX)
                }
            },
            Container::Bitmap { words, len } => {
                if test_bit(words, low) {
                    (false, false)
                } else {
                    set_bit(words, low);
                    *len += 1;
                    (true, false)
                }
            }
        };
        if overflow {
            self.to_bitmap();
        }
        inserted
    }

    fn remove(&mut self, low: u16) -> bool {
        match self {
            Container::Array(values) => match values.binary_search(&low) {
                Ok(pos) => {
                    values.remove(pos);
                    true
                }
                Err(_) => false,
            },
            Container::Bitmap { words, len } => {
                if test_bit(words, low) {
                    clear_bit(words, low);
                    *len -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn to_bitmap(&mut self) {
        if let Container::Array(values) = self {
            let mut words = empty_words();
            for &v in values.iter() {
                set_bit(&mut words, v);
            }
            let len = values.len();
            *self = Container::Bitmap { words, len };
        }
    }

    fn to_array(&mut self) {
        if let Container::Bitmap { .. } = self {
            let values: Vec<u16> = self.iter().collect();
            *self = Container::Array(values);
        }
    }

    /// Picks the smaller representation and drops slack capacity.
    fn optimize(&mut self) {
        if self.len() <= ARRAY_MAX {
            self.to_array();
            if let Container::Array(values) = self {
                values.shrink_to_fit();
            }
        } else {
            self.to_bitmap();
        }
    }

    fn fill_words(&self, words: &mut [u64; BITMAP_WORDS]) {
        match self {
            Container::Array(values) => {
                for &v in values {
                    set_bit(words, v);
                }
            }
            Container::Bitmap { words: own, .. } => {
                for (dst, src) in words.iter_mut().zip(own.iter()) {
                    *dst |= *src;
                }
            }
        }
    }

    fn union_with(&mut self, other: &Container) {
        let result = match (&*self, other) {
            (Container::Array(a), Container::Array(b)) => {
                Container::from_sorted(merge_sorted(a, b))
            }
            _ => {
                let mut words = empty_words();
                self.fill_words(&mut words);
                other.fill_words(&mut words);
                Container::from_words(words)
            }
        };
        *self = result;
    }

    fn intersect_with(&mut self, other: &Container) {
        let result = match (&*self, other) {
            (Container::Bitmap { words: a, .. }, Container::Bitmap { words: b, .. }) => {
                let mut words = empty_words();
                for (i, w) in words.iter_mut().enumerate() {
                    *w = a[i] & b[i];
                }
                Container::from_words(words)
            }
            (Container::Array(a), _) => {
                Container::Array(a.iter().copied().filter(|&v| other.contains(v)).collect())
            }
            (_, Container::Array(b)) => {
                Container::Array(b.iter().copied().filter(|&v| self.contains(v)).collect())
            }
        };
        *self = result;
    }

    fn difference_with(&mut self, other: &Container) {
        let result = match (&*self, other) {
            (Container::Array(a), _) => {
                Container::Array(a.iter().copied().filter(|&v| !other.contains(v)).collect())
            }
            (Container::Bitmap { words: a, .. }, Container::Bitmap { words: b, .. }) => {
                let mut words = empty_words();
                for (i, w) in words.iter_mut().enumerate() {
                    *w = a[i] & !b[i];
                }
                Container::from_words(words)
            }
            (Container::Bitmap { words: a, len }, Container::Array(b)) => {
                let mut words = a.clone();
                let mut len = *len;
                for &v in b {
                    if test_bit(&words, v) {
                        clear_bit(&mut words, v);
                        len -= 1;
                    }
                }
                Container::Bitmap { words, len }
            }
        };
        *self = result;
    }

    fn intersection_len(&self, other: &Container) -> usize {
        match (self, other) {
            (Container::Bitmap { words: a, .. }, Container::Bitmap { words: b, .. }) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x & y).count_ones() as usize)
                .sum(),
            (Container::Array(a), _) => a.iter().filter(|&&v| other.contains(v)).count(),
            (_, Container::Array(b)) => b.iter().filter(|&&v| self.contains(v)).count(),
        }
    }

    fn max(&self) -> Option<u16> {
        match self {
            Container::Array(values) => values.last().copied(),
            Container::Bitmap { words, .. } => words
                .iter()
                .enumerate()
                .rev()
                .find(|(_, w)| **w != 0)
                .map(|(i, w)| (i * 64 + 63 - w.leading_zeros() as usize) as u16),
        }
    }

    fn iter(&self) -> ContainerIter<'_> {
        match self {
            Container::Array(values) => ContainerIter::Array(values.iter()),
            Container::Bitmap { words, .. } => ContainerIter::Bitmap {
                words,
                index: 0,
                current: 0,
            },
        }
    }
}

enum ContainerIter<'a> {
    Array(std::slice::Iter<'a, u16>),
    Bitmap {
        words: &'a [u64; BITMAP_WORDS],
        // index of the next word to load; `current` holds word `index - 1`
        index: usize,
        current: u64,
    },
}

impl Iterator for ContainerIter<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match self {
            ContainerIter::Array(it) => it.next().copied(),
            ContainerIter::Bitmap {
                words,
                index,
                current,
            } => loop {
                if *current != 0 {
                    let bit = current.trailing_zeros() as usize;
                    *current &= *current - 1;
                    return Some(((*index - 1) * 64 + bit) as u16);
                }
                if *index >= BITMAP_WORDS {
                    return None;
                }
                *current = words[*index];
                *index += 1;
            },
        }
    }
}

/// Set of job, client or affinity ids with fast membership, set algebra and
/// cardinality.
#[derive(Clone, Default)]
pub struct IdSet {
    containers: BTreeMap<u16, Container>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not already present.
    pub fn insert(&mut self, id: u32) -> bool {
        let (high, low) = split(id);
        match self.containers.entry(high) {
            Entry::Vacant(e) => {
                e.insert(Container::Array(vec![low]));
                true
            }
            Entry::Occupied(mut e) => e.get_mut().insert(low),
        }
    }

    /// Returns true if the id was present.
    pub fn remove(&mut self, id: u32) -> bool {
        let (high, low) = split(id);
        let Some(container) = self.containers.get_mut(&high) else {
            return false;
        };
        let removed = container.remove(low);
        if container.len() == 0 {
            self.containers.remove(&high);
        }
        removed
    }

    pub fn contains(&self, id: u32) -> bool {
        let (high, low) = split(id);
        self.containers
            .get(&high)
            .is_some_and(|c| c.contains(low))
    }

    /// Inserts every id in the inclusive range.
    pub fn insert_range(&mut self, range: RangeInclusive<u32>) {
        for id in range {
            self.insert(id);
        }
    }

    /// Cardinality.
    pub fn len(&self) -> usize {
        self.containers.values().map(Container::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn clear(&mut self) {
        self.containers.clear();
    }

    /// Smallest member.
    pub fn first(&self) -> Option<u32> {
        let (high, container) = self.containers.iter().next()?;
        container.iter().next().map(|low| join(*high, low))
    }

    /// Largest member.
    pub fn last(&self) -> Option<u32> {
        let (high, container) = self.containers.iter().next_back()?;
        container.max().map(|low| join(*high, low))
    }

    /// Ascending iterator over members.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            outer: self.containers.iter(),
            current: None,
        }
    }

    pub fn union_with(&mut self, other: &IdSet) {
        for (high, theirs) in &other.containers {
            match self.containers.entry(*high) {
                Entry::Vacant(e) => {
                    e.insert(theirs.clone());
                }
                Entry::Occupied(mut e) => e.get_mut().union_with(theirs),
            }
        }
    }

    pub fn intersect_with(&mut self, other: &IdSet) {
        self.containers.retain(|high, ours| match other.containers.get(high) {
            Some(theirs) => {
                ours.intersect_with(theirs);
                ours.len() > 0
            }
            None => false,
        });
    }

    pub fn difference_with(&mut self, other: &IdSet) {
        self.containers.retain(|high, ours| match other.containers.get(high) {
            Some(theirs) => {
                ours.difference_with(theirs);
                ours.len() > 0
            }
            None => true,
        });
    }

    /// Cardinality of `self ∩ other` without materializing it.
    pub fn intersection_len(&self, other: &IdSet) -> usize {
        self.containers
            .iter()
            .filter_map(|(high, ours)| other.containers.get(high).map(|t| ours.intersection_len(t)))
            .sum()
    }

    pub fn is_disjoint(&self, other: &IdSet) -> bool {
        self.intersection_len(other) == 0
    }

    /// Rewrites every chunk into its most compact representation. Membership
    /// is unchanged.
    pub fn optimize(&mut self) {
        for container in self.containers.values_mut() {
            container.optimize();
        }
    }
}

pub struct Iter<'a> {
    outer: btree_map::Iter<'a, u16, Container>,
    current: Option<(u16, ContainerIter<'a>)>,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        loop {
            if let Some((high, inner)) = &mut self.current {
                if let Some(low) = inner.next() {
                    return Some(join(*high, low));
                }
            }
            let (high, container) = self.outer.next()?;
            self.current = Some((*high, container.iter()));
        }
    }
}

impl<'a> IntoIterator for &'a IdSet {
    type Item = u32;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = IdSet::new();
        set.extend(iter);
        set
    }
}

impl Extend<u32> for IdSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for IdSet {}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl BitOr for &IdSet {
    type Output = IdSet;

    fn bitor(self, rhs: &IdSet) -> IdSet {
        let mut out = self.clone();
        out.union_with(rhs);
        out
    }
}

impl BitAnd for &IdSet {
    type Output = IdSet;

    fn bitand(self, rhs: &IdSet) -> IdSet {
        let mut out = self.clone();
        out.intersect_with(rhs);
        out
    }
}

impl Sub for &IdSet {
    type Output = IdSet;

    fn sub(self, rhs: &IdSet) -> IdSet {
        let mut out = self.clone();
        out.difference_with(rhs);
        out
    }
}
