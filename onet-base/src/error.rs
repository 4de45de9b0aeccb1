/// Stable classification of every onet error.
///
/// Each error type in the workspace maps onto one of these kinds through a `kind()`
/// method, so callers can branch on the failure class without matching on the concrete
/// error enums.  The numeric [`code`](Self::code) is part of the public contract and never
/// changes for an existing kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed address text or a missing value token.
    #[display("invalid params")]
    InvalidParams,
    /// A protocol or transport name is already registered.
    #[display("already registered")]
    AlreadyRegistered,
    /// Unknown protocol or transport, or no native transport in an address.
    #[display("not found")]
    NotFound,
    /// A segment value was rejected by its protocol's validator.
    #[display("protocol value error")]
    ProtocolValueError,
    /// The listener or connection is closed.
    #[display("closed")]
    Closed,
    /// A mux transport has no session reaching the dial target.
    #[display("mux session not found")]
    MuxSessionNotFound,
    /// A transport implementation failed, e.g. with an I/O error.
    #[display("transport error")]
    Transport,
}

impl ErrorKind {
    /// Returns the stable numeric code of this kind.
    pub const fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidParams => -1,
            ErrorKind::AlreadyRegistered => -2,
            ErrorKind::NotFound => -3,
            ErrorKind::ProtocolValueError => -4,
            ErrorKind::Closed => -5,
            ErrorKind::MuxSessionNotFound => -6,
            ErrorKind::Transport => -7,
        }
    }
}
