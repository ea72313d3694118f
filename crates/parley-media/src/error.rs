use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    /// No camera or microphone could be opened.
    #[error("No capture device available")]
    NoDevice,

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Playback error: {0}")]
    Playback(String),

    /// A stream operation needs an active call.
    #[error("Not in a call")]
    NotInCall,

    /// The call is bound to a different chat.
    #[error("Call is bound to another chat")]
    WrongChat,
}
