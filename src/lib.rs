#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
)]

mod call;
mod channel;
mod completion_queue;
mod compression;
mod connection;
mod flags;
mod flow;
mod frame;
mod hpack;
mod metadata;
mod runtime;
mod server;
mod socket;
mod stream;
mod stream_coordinator;
mod types;

pub use bytes::Bytes;
pub use call::{Call, Op, WRITE_BUFFER_HINT, WRITE_NO_COMPRESS};
pub use channel::Channel;
pub use completion_queue::{CompletionQueue, CompletionType, Event, EventKind, Tag};
pub use compression::{compress, decompress, Algorithm};
pub use connection::ConnectionConfig;
pub use metadata::Metadata;
pub use runtime::Runtime;
pub use server::{RequestedCall, Server, ServerOptions};
pub use socket::{ChannelCredentials, ServerCredentials};
pub use types::{ByteBuffer, CallError, Status, StatusCode, TransportError};
