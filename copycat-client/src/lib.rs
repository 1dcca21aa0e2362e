//! Client session for the clipboard relay: upload queue, live message and file
//! lists, clipboard polling, URL ingest and file previews.

pub mod clipboard;
pub mod error;
pub mod ingest;
pub mod preview;
pub mod realtime;
pub mod session;
pub mod status;
pub mod storage;
pub mod sync;
pub mod upload_queue;

pub use error::{ClientError, ErrorKind};
