// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted chained byte buffers for zero-copy I/O.
//!
//! The central type is [`IoBuf`], a logical byte sequence stored as an
//! ordered chain of [`BufSlice`]s. Each slice views a region of a
//! reference-counted block, so buffers can be split ([`IoBuf::cut`]),
//! spliced ([`IoBuf::append`]) and cloned without copying payload bytes.
//!
//! Blocks come in three flavors:
//!
//! * *native* - fixed-size chunks (4 KiB / 64 KiB / 1 MiB) recycled through
//!   the typed object pool; these back the builder and the socket read path;
//! * *foreign* - an owned container adopted as-is ([`BufSlice::owning`]);
//! * *referenced* - a non-owning view with a completion callback that fires
//!   when the last reference goes away ([`BufSlice::referencing`]).
//!
//! [`IoBufBuilder`] produces buffers: it owns one current native block and
//! appends small writes with a single `memcpy`, while reattaching large
//! payloads by reference.
//!
//! ```
//! use abel_buf::{BufSlice, IoBufBuilder};
//!
//! let mut builder = IoBufBuilder::new();
//! builder.append("HTTP/1.1 200 OK\r\n\r\n");
//! builder.append_slice(BufSlice::owning(vec![0_u8; 16 * 1024])); // Reattached, not copied.
//!
//! let mut response = builder.destructive_get();
//! let header = response.cut(19);
//! assert_eq!(header.flatten(usize::MAX), b"HTTP/1.1 200 OK\r\n\r\n");
//! assert_eq!(response.byte_size(), 16 * 1024);
//! ```

mod block;
mod buf;
mod builder;
mod slice;

pub use block::{ExclusiveBlock, NativeBlockSize};
pub use buf::IoBuf;
pub use builder::IoBufBuilder;
pub use slice::BufSlice;
