//! Events the client surfaces to its embedder (the bot layer routes most
//! of these on to plugins).

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A text message we received.
    Message {
        actor: Option<u32>,
        receivers: Vec<u32>,
        channels: Vec<u32>,
        message: String,
    },
    /// A session other than ours appeared on the server.
    UserJoined { session: u32, name: String },
    /// Stats arrived for a user we queried.
    UserStats { session: u32 },
    /// A queued playback input started playing.
    Playback {
        name: String,
        /// Plugin that queued the input, if any.
        origin: Option<String>,
    },
}
