/// How a simulated stack value was derived.
///
/// Ordered as a lattice: untagged < `DerivedFromField` < `ToStringResult`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum ProvenanceTag {
    /// Read back out of a collection held in a field.
    DerivedFromField,
    /// Produced by `toString()` or by a builder that stringified a non-string value.
    ToStringResult,
}

impl ProvenanceTag {
    /// Least upper bound of two optional tags, used where control flow merges.
    pub(crate) fn join(left: Option<Self>, right: Option<Self>) -> Option<Self> {
        left.max(right)
    }
}
