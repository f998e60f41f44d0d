//! Null sentinel for slots that must tell "empty" apart from "holds an absent item".
//!
//! Items are nullable (`Option<T>`), so a queue slot, a value cell or a
//! `poll` result that uses `None` for "nothing here" cannot also use `None`
//! for "the item is absent". Such structures store [`Wrapped<T>`] instead:
//! [`wrap`] maps an absent item to [`Wrapped::Null`], which stands for the
//! process-wide [`NULL`] marker, and [`unwrap`] reverses it.
//!
//! **Do not** emit the sentinel as an ordinary item. Wrapping the bare
//! [`Null`] marker or anything already wrapped is a programming error and
//! fails fast.

use std::any::{type_name, TypeId};
use std::fmt;

use crate::{FlowError, FlowResult};

/// Process-wide marker standing in for an absent item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Null;

/// The sentinel instance. Zero-sized and immutable; safe to share anywhere.
pub static NULL: Null = Null;

/// A stored item: either a value or the null sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Wrapped<T> {
    Value(T),
    Null,
}

impl<T> Wrapped<T> {
    pub fn is_null(&self) -> bool {
        matches!(self, Wrapped::Null)
    }

    /// The shared [`NULL`] marker when this slot holds the sentinel.
    pub fn sentinel(&self) -> Option<&'static Null> {
        match self {
            Wrapped::Value(_) => None,
            Wrapped::Null => Some(&NULL),
        }
    }

    /// Borrowing view of the unwrapped item.
    pub fn as_option(&self) -> Option<&T> {
        match self {
            Wrapped::Value(value) => Some(value),
            Wrapped::Null => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        unwrap(self)
    }
}

impl<T: fmt::Display> fmt::Display for Wrapped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wrapped::Value(value) => value.fmt(f),
            Wrapped::Null => f.write_str("null"),
        }
    }
}

/// Wraps an item for storage.
///
/// # Panics
/// Panics when `item` is the [`Null`] marker or an already wrapped slot.
pub fn wrap<T: 'static>(item: Option<T>) -> Wrapped<T> {
    match try_wrap(item) {
        Ok(wrapped) => wrapped,
        Err(err) => panic!("{err}"),
    }
}

/// Non-panicking variant of [`wrap`].
pub fn try_wrap<T: 'static>(item: Option<T>) -> FlowResult<Wrapped<T>> {
    match item {
        Some(_) if is_sentinel_type::<T>() => Err(FlowError::InvariantViolation(
            "attempt to null-wrap an already wrapped item",
        )),
        Some(value) => Ok(Wrapped::Value(value)),
        None => Ok(Wrapped::Null),
    }
}

/// Reverses [`wrap`].
pub fn unwrap<T>(wrapped: Wrapped<T>) -> Option<T> {
    match wrapped {
        Wrapped::Value(value) => Some(value),
        Wrapped::Null => None,
    }
}

fn is_sentinel_type<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<Null>() || is_wrapped_type::<T>()
}

// `Wrapped<U>` for any `U`: the instantiations only share their path.
fn is_wrapped_type<T: 'static>() -> bool {
    let Some((path, _)) = type_name::<Wrapped<Null>>().split_once('<') else {
        return false;
    };
    type_name::<T>()
        .strip_prefix(path)
        .is_some_and(|rest| rest.starts_with('<'))
}
