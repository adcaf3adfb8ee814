// SPDX-License-Identifier: MIT OR Apache-2.0

//! Marker traits for the identifier types threaded through the engine.

use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Identifier of a user account.
///
/// Users are compared and sorted when building unordered relationship pairs, so an `Ord`
/// implementation is required.
pub trait UserId: Copy + Debug + Display + Eq + Hash + Ord {}

/// Identifier of a thread (a channel or conversation node in the hierarchy).
pub trait ThreadId: Copy + Debug + Display + Eq + Hash {}

/// Identifier of a role owned by a thread.
pub trait RoleId: Copy + Debug + Display + Eq + Hash {}
