//! Shared error classification, mirrored on the teacher's
//! `SidecarError`/`is_retryable_error`/`is_guard_violation` split. Each crate
//! boundary (`nexuts-tree`, `nexuts-wal`, `nexuts-store`, `nexuts-sentry`,
//! `nexuts-ic`) defines its own `thiserror` enum and implements
//! [`ErrorKind`] for it so the HTTP layer maps errors the same way
//! regardless of which subsystem raised them (spec.md §7).

/// The five error kinds of spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Validation,
    NotFound,
    Transient,
    Corruption,
    Fatal,
}

/// Implemented by every crate-boundary error enum so callers (mainly the
/// HTTP handlers) can classify without matching on concrete variants.
pub trait Classified {
    fn kind(&self) -> Kind;
}

pub fn is_retryable<E: Classified>(err: &E) -> bool {
    matches!(err.kind(), Kind::Transient)
}

pub fn is_validation<E: Classified>(err: &E) -> bool {
    matches!(err.kind(), Kind::Validation)
}
