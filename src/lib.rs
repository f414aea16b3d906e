//! # Chunkbuf
//!
//! A buffered reader that adapts push-based byte sources to pull-based,
//! exact-size reads.
//!
//! Push sources (sockets, pipes, multiplexed stream channels) deliver bytes
//! in arbitrarily sized chunks on their own schedule, while protocol parsers
//! want to ask for exactly N bytes at a time. [`BufferedReader`] sits between
//! the two: it accumulates chunks as they arrive, resolves each read with
//! exactly the requested byte count in arrival order, and hands any excess
//! back to the source so the next read sees it first. Reads can carry a
//! deadline when the source supports one, and a source closing mid-read
//! fails that read instead of leaving it hanging.
//!
//! ## Example
//!
//! ```rust
//! use chunkbuf::{BufferedReader, MemorySource};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), chunkbuf::ReadError> {
//!     let source = MemorySource::new();
//!     let mut reader = BufferedReader::new(source.clone());
//!
//!     // Chunks arrive on the source's schedule, in whatever sizes it likes.
//!     source.write(vec![0u8, 1, 2]);
//!     source.write(vec![3u8, 4, 5, 6]);
//!
//!     // Reads resolve with exactly the requested byte count.
//!     let header = reader.read_bytes(5, None).await?;
//!     assert_eq!(&header[..], &[0, 1, 2, 3, 4]);
//!
//!     // The two excess bytes went back to the source.
//!     let rest = reader.read_bytes(2, None).await?;
//!     assert_eq!(&rest[..], &[5, 6]);
//!     Ok(())
//! }
//! ```

mod error;
mod reader;
mod source;

pub use error::ReadError;
pub use reader::{BufferedReader, ReadHandle};
pub use source::{ChunkSource, MemorySource, SourceEvent, Subscription};
