mod channel;

pub use channel::{
    connect_channel, decode_frame, decode_legacy_text, encode_frame, ChannelHandle, ChannelInbound,
    ChannelStatus, InProcessPeer, FRAME_MARKER,
};
