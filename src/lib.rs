//! Client-side message handling for an XRootD-style multiplexed binary
//! protocol.
//!
//! The crate drives one outstanding request per handler over a
//! connection shared with other in-flight requests: frame
//! classification, partial-response assembly, raw-body streaming in both
//! directions, server-directed redirects and waits, retry at the load
//! balancer with tried-host bookkeeping, and wall-clock deadline
//! enforcement. The surrounding transport, timer and worker services are
//! injected through traits so the state machine is testable without a
//! socket.

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod handler;
pub mod message;
pub mod postmaster;
pub mod protocol;
pub mod response;
pub mod runtime;
pub mod sid;
pub mod status;
#[cfg(test)]
mod test_support;
pub mod url;

pub use chunk::{Chunk, ChunkList, ChunkStatus};
pub use config::Config;
pub use dispatch::{redirect_request, send_request, SendParams};
pub use handler::RequestHandler;
pub use message::Message;
pub use postmaster::{
    CallbackRunner,
    ExamineResult,
    FrameAction,
    HandlerContext,
    HostInfo,
    HostList,
    LocalFileHandler,
    MessageHandler,
    Postmaster,
    Redirector,
    ResponseHandler,
    SharedHandler,
    StreamAction,
    StreamEvent,
    WaitScheduler,
    WaitTask,
};
pub use response::ResponseBody;
pub use sid::{SidManager, StreamId};
pub use status::{Status, StatusCode};
pub use url::Url;
