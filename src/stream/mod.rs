//! Frame hand-off and TCP streaming

pub mod mailbox;
pub mod protocol;
pub mod server;

pub use mailbox::{FrameMailbox, MailboxStats};
pub use protocol::{FrameHeader, StreamFrame, FRAME_HEADER_LEN, FRAME_MAGIC};
pub use server::{ClientExit, ServerStats, ServerStatsSnapshot, StreamServer, CHUNK_SIZE};
