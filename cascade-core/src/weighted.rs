//! Weighted-random-choice structures.
//!
//! The atomic primitive of every simulation step: the set of currently
//! enabled transitions, each carrying a rate, is collected into a weighted
//! structure and a single uniform draw over `[0, total_weight)` selects
//! the next transition. Structures compose: a nested structure contributes
//! its total weight as a single weight, so hierarchical rule sets ("pick a
//! population, then pick a rule within it") work without flattening.

use thiserror::Error;

/// Errors produced by weighted selection.
#[derive(Debug, Error, PartialEq)]
pub enum WeightedError {
    #[error("Cannot select from an empty or zero-weight structure")]
    EmptyStructure,

    #[error("Selection offset {offset} is outside [0, {total})")]
    OutOfRange { offset: f64, total: f64 },

    #[error("Weight {weight} is not a finite non-negative number")]
    InvalidWeight { weight: f64 },
}

/// A payload with a non-negative selection weight.
///
/// Weight zero is legal but the element is never selectable.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedElement<T> {
    pub weight: f64,
    pub value: T,
}

impl<T> WeightedElement<T> {
    pub fn new(weight: f64, value: T) -> Self {
        Self { weight, value }
    }
}

/// Collection supporting weighted-random selection.
///
/// `select(r)` for `r` in `[0, total_weight())` deterministically maps to
/// exactly one element; under a uniform draw of `r` each element is
/// returned with probability `weight / total_weight()`.
pub trait WeightedStructure<T>: Send + Sync {
    /// Sum of all leaf weights contained in this structure.
    fn total_weight(&self) -> f64;

    /// Resolves the selection offset `r` to a leaf element.
    ///
    /// # Errors
    /// - `WeightedError::EmptyStructure` - structure has no selectable weight
    /// - `WeightedError::OutOfRange` - `r` is negative or `>= total_weight()`
    fn select(&self, r: f64) -> Result<&WeightedElement<T>, WeightedError>;
}

/// Flat weighted collection with logarithmic selection.
///
/// Elements are kept alongside a running cumulative-weight table, so
/// `select` is a binary search over prefix sums. `total_weight` is the
/// exact left-to-right sum of the current leaf weights after any sequence
/// of add/remove operations.
#[derive(Debug, Clone, Default)]
pub struct WeightedTree<T> {
    elements: Vec<WeightedElement<T>>,
    cumulative: Vec<f64>,
}

impl<T> WeightedTree<T> {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            cumulative: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            elements: Vec::with_capacity(capacity),
            cumulative: Vec::with_capacity(capacity),
        }
    }

    /// Appends an element with the given weight.
    ///
    /// # Errors
    /// - `WeightedError::InvalidWeight` - weight is negative, NaN or infinite
    pub fn add(&mut self, weight: f64, value: T) -> Result<(), WeightedError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(WeightedError::InvalidWeight { weight });
        }
        let total = self.cumulative.last().copied().unwrap_or(0.0);
        self.elements.push(WeightedElement::new(weight, value));
        self.cumulative.push(total + weight);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WeightedElement<T>> {
        self.elements.iter()
    }
}

impl<T: PartialEq> WeightedTree<T> {
    /// Removes the first element equal to `value`, rebuilding the
    /// cumulative table. Returns whether an element was removed.
    pub fn remove(&mut self, value: &T) -> bool {
        let Some(position) = self.elements.iter().position(|e| &e.value == value) else {
            return false;
        };
        self.elements.remove(position);
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        self.cumulative.clear();
        let mut total = 0.0;
        for element in &self.elements {
            total += element.weight;
            self.cumulative.push(total);
        }
    }
}

impl<T: Send + Sync> WeightedStructure<T> for WeightedTree<T> {
    fn total_weight(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    fn select(&self, r: f64) -> Result<&WeightedElement<T>, WeightedError> {
        let total = self.total_weight();
        if total <= 0.0 {
            return Err(WeightedError::EmptyStructure);
        }
        if !(0.0..total).contains(&r) {
            return Err(WeightedError::OutOfRange { offset: r, total });
        }
        // First prefix sum strictly above r. Zero-weight elements share
        // the prefix sum of their predecessor and can never be first.
        let index = self.cumulative.partition_point(|&c| c <= r);
        self.elements
            .get(index)
            .ok_or(WeightedError::OutOfRange { offset: r, total })
    }
}

/// Weighted structure whose children are themselves weighted structures.
///
/// Each child's total weight acts as a single weight at this level;
/// selection descends into the child owning the offset.
pub struct ComposedWeightedStructure<T> {
    children: Vec<Box<dyn WeightedStructure<T>>>,
}

impl<T> Default for ComposedWeightedStructure<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ComposedWeightedStructure<T> {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: Box<dyn WeightedStructure<T>>) {
        self.children.push(child);
    }

    pub fn children(&self) -> usize {
        self.children.len()
    }
}

impl<T: Send + Sync> WeightedStructure<T> for ComposedWeightedStructure<T> {
    fn total_weight(&self) -> f64 {
        self.children.iter().map(|c| c.total_weight()).sum()
    }

    fn select(&self, r: f64) -> Result<&WeightedElement<T>, WeightedError> {
        let total = self.total_weight();
        if total <= 0.0 {
            return Err(WeightedError::EmptyStructure);
        }
        if !(0.0..total).contains(&r) {
            return Err(WeightedError::OutOfRange { offset: r, total });
        }
        let mut remaining = r;
        for child in &self.children {
            let weight = child.total_weight();
            if remaining < weight {
                return child.select(remaining);
            }
            remaining -= weight;
        }
        // Floating-point carry can land exactly on the boundary; resolve
        // to the last child with selectable weight.
        self.children
            .iter()
            .rev()
            .find(|c| c.total_weight() > 0.0)
            .map(|c| c.select(c.total_weight() * (1.0 - f64::EPSILON)))
            .unwrap_or(Err(WeightedError::EmptyStructure))
    }
}
