//! Wire protocol: JSON envelopes, the message taxonomy, coded errors, and
//! the dispatch runtime shared by every server role.

pub mod codec;
mod dispatcher;
mod envelope;
mod error_code;
mod messages;
mod server;

pub use codec::{read_envelope, write_envelope, CodecError, MalformedMessage, ReadOutcome};
pub use dispatcher::{
    AllowAll, Authorizer, Dispatcher, HandlerError, Interceptor, MessageContext, MessageHandler,
    Role,
};
pub use envelope::{
    Envelope, HEADER_ATTEMPTS, HEADER_LAST_BACKOFF_MS, HEADER_ORIGINAL_MESSAGE_ID,
    PROTOCOL_VERSION,
};
pub use error_code::{ErrorClass, ErrorCode, RetryGuidance};
pub use messages::{InvalidMessage, Message, PeerInfo, PeerRef, TRANSFER_CHUNK_SIZE};
pub use server::serve;
