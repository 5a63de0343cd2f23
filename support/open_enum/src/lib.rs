// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`open_enum`] macro.

#![no_std]
#![forbid(unsafe_code)]

/// Declares a set of named integer constants that behaves like an enum while
/// keeping every other value of the storage type representable.
///
/// Wire protocols and hardware registers carry values a driver's enum may not
/// know about; matching a true Rust enum against such a value would be
/// undefined behavior after an unchecked transmute and a decode error
/// otherwise. This macro instead expands to a `#[repr(transparent)]` tuple
/// struct over the given storage type, with one associated constant per
/// variant. The constants work as match patterns, the raw value stays
/// reachable through `.0`, and `Debug` prints the variant name when the value
/// is a known one.
///
/// The generated struct derives `Copy`, `Clone`, `PartialEq`, `Eq`,
/// `PartialOrd`, `Ord`, and `Hash`.
///
/// # Example
///
/// ```
/// use open_enum::open_enum;
///
/// open_enum! {
///     /// Link state reported by a port.
///     pub enum LinkState: u8 {
///         DOWN = 0,
///         UP = 1,
///     }
/// }
///
/// let state = LinkState(1);
/// assert_eq!(state, LinkState::UP);
/// assert_eq!(LinkState::DOWN.0, 0);
/// match state {
///     LinkState::UP => {}
///     _ => panic!("link should be up"),
/// }
/// // Unknown values survive and print as their raw value.
/// assert_eq!(format!("{:?}", LinkState::UP), "UP");
/// assert_eq!(format!("{:?}", LinkState(7)), "7");
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$attr:meta])*
        $vis:vis enum $name:ident : $storage:ty {
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(pub $storage);

        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                match *self {
                    $( Self::$variant => f.pad(stringify!($variant)), )*
                    _ => ::core::fmt::Debug::fmt(&self.0, f),
                }
            }
        }
    };
}
