//! The core of a BitTorrent download, without the sockets.
//!
//! This crate keeps track of what a download has and what it is missing. It
//! maps the chunks of a torrent onto its files, frames the messages that peers
//! send, assembles blocks into chunks, verifies them and tracks how many peers
//! have each chunk.
//!
//! Nothing in here performs network I/O and nothing spawns tasks. The owner of
//! a [`download::Download`] feeds it the bytes it receives from every peer and
//! sends back the messages queued for them. File access goes through the
//! [`content::storage::Storage`] trait.
//!
//! # Example
//!
//! ```
//! use vcz_content::content::{storage::MemoryStorage, Content};
//!
//! let mut content = Content::new(MemoryStorage::new(), 16384);
//! content.add_file("a.txt", 20_000);
//! content.add_file("b.txt", 100);
//! content.set_complete_hash(vec![0; 2 * 20]);
//! content.open().unwrap();
//!
//! let done = content.subscribe();
//! content.mark_done(1);
//! content.mark_done(0);
//!
//! assert!(*done.borrow());
//! assert!(content.files().iter().all(|f| f.is_done()));
//! ```

pub mod availability;
pub mod bitfield;
pub mod check;
pub mod config;
pub mod content;
pub mod counter;
pub mod download;
pub mod error;
pub mod peer;
pub mod piece;
pub mod ranges;
pub mod swarm;
pub mod wire;
