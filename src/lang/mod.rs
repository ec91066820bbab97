//! # Drift type vocabulary
//!
//! Types shared by the compiler (which records them in the type pool of a
//! code object) and the VM (which checks values against them).
//!
//! ## Notation
//!
//! - `[T]` array, `(T)` tuple, `{K : V}` map.
//! - `|A, B| -> R` function.
//! - `<T: int | float>` generic parameter with a permitted-type set.

pub mod types;

pub use types::{Generic, Type};
