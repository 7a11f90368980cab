// Module: sync

pub mod deregister;
pub mod driver;
pub mod factory;
pub mod fanout;
pub mod message;
pub mod push_listener;
pub mod transport;

pub use deregister::{DeregistrationReport, ServiceDeregistrar};
pub use driver::{PollOutcome, SyncDriver};
pub use factory::{DriverFactory, ProcessContext};
pub use fanout::{FanOut, FanOutReport};
pub use message::PipeMessage;
pub use push_listener::{AckType, PushAck, PushHandler, PushListener};
pub use transport::{
    MessageSender, ProcessIdentity, ProcessReceiver, ProcessSender, RecipientKind, ServerTransport,
    WorkerId, WorkerSender,
};
#[cfg(unix)]
pub use transport::process_channel;
