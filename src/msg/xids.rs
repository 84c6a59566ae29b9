//! Transaction-id stacks.
//!
//! A message carries the full ancestor chain of the transaction that issued
//! it: the root transaction first, the innermost nested child last. The
//! stack is a value - duplicated freely, compared by content - and an empty
//! stack means the write happened outside any transaction (its effect is
//! immediately committed).

use smallvec::SmallVec;

pub type TxnId = u64;

/// Reserved id; never assigned to a real transaction.
pub const TXNID_NONE: TxnId = 0;

/// A stack of transaction ids from root to innermost nested child.
///
/// Nesting deeper than four levels is rare enough that the inline capacity
/// covers almost every message without a heap allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Xids {
    stack: SmallVec<[TxnId; 4]>,
}

impl Xids {
    /// The empty stack: a write with no surrounding transaction.
    pub fn root() -> Self {
        Self {
            stack: SmallVec::new(),
        }
    }

    /// Extend `parent` with a nested child transaction.
    pub fn child(parent: &Xids, txnid: TxnId) -> Self {
        debug_assert_ne!(txnid, TXNID_NONE);
        let mut stack = parent.stack.clone();
        stack.push(txnid);
        Self { stack }
    }

    /// Build a stack from an explicit root-to-innermost chain.
    pub fn from_chain(chain: &[TxnId]) -> Self {
        Self {
            stack: SmallVec::from_slice(chain),
        }
    }

    /// The innermost transaction, or [`TXNID_NONE`] for the root stack.
    pub fn innermost(&self) -> TxnId {
        self.stack.last().copied().unwrap_or(TXNID_NONE)
    }

    /// The outermost (root) transaction, or [`TXNID_NONE`].
    pub fn outermost(&self) -> TxnId {
        self.stack.first().copied().unwrap_or(TXNID_NONE)
    }

    pub fn num_xids(&self) -> usize {
        self.stack.len()
    }

    pub fn is_root(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.stack.iter().copied()
    }

    pub fn contains(&self, id: TxnId) -> bool {
        self.stack.contains(&id)
    }

    /// True iff `self` begins with all of `prefix`. Commit and abort
    /// messages target every provisional record whose stack lies under the
    /// finishing transaction's chain.
    pub fn starts_with(&self, prefix: &Xids) -> bool {
        self.stack.len() >= prefix.stack.len() && self.stack[..prefix.stack.len()] == prefix.stack[..]
    }

    /// Bytes this stack occupies in the serialized message framing: a count
    /// byte plus eight bytes per id.
    pub fn serialized_size(&self) -> usize {
        1 + 8 * self.stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_stack_is_empty() {
        let x = Xids::root();
        assert!(x.is_root());
        assert_eq!(x.innermost(), TXNID_NONE);
        assert_eq!(x.num_xids(), 0);
        assert_eq!(x.serialized_size(), 1);
    }

    #[test]
    fn child_extends_parent() {
        let root = Xids::root();
        let a = Xids::child(&root, 7);
        let b = Xids::child(&a, 9);
        assert_eq!(a.innermost(), 7);
        assert_eq!(b.innermost(), 9);
        assert_eq!(b.outermost(), 7);
        assert_eq!(b.num_xids(), 2);
        assert_eq!(b.serialized_size(), 1 + 16);
    }

    #[test]
    fn prefix_matching() {
        let a = Xids::from_chain(&[3]);
        let b = Xids::from_chain(&[3, 8]);
        let c = Xids::from_chain(&[4, 8]);
        assert!(b.starts_with(&a));
        assert!(b.starts_with(&b));
        assert!(!a.starts_with(&b));
        assert!(!c.starts_with(&a));
        assert!(a.starts_with(&Xids::root()));
    }
}
