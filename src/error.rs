//! Error type shared by the strict lookup operations.

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The key has no slot, or its slot holds a value that was already
    /// reclaimed. The two cases are deliberately indistinguishable.
    #[error("key not found")]
    KeyNotFound,
}
