//! # Result Utilities
//!
//! Support for building ``expect_<func>(...) -> T`` variants of
//! ``try_<func>(...) -> anyhow::Result<T>`` methods.

use std::fmt::Debug;

/// Unwraps Result, or Panics with the error.
///
/// Unlike the `.unwrap()` method, this does not add a prefix about
/// `.unwrap()`; the panic message is the error message.
pub fn expect_unwrap<T, E>(result: Result<T, E>) -> T
where
    E: Debug,
{
    match result {
        Ok(t) => t,
        Err(e) => panic!("{e:?}"),
    }
}
