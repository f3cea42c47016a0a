pub mod poll;
pub mod push;

pub use poll::{CommentPage, PollSource, YouTubePollSource};
pub use push::{
    ConnectionState, PushHandle, PushTransport, SocketConnector, SocketFrame, SocketStream,
    TungsteniteConnector, DEFAULT_PUSH_URL,
};
