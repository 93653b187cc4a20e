use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTypeH2 {
    Data,         // 0x0
    Headers,      // 0x1
    Priority,     // 0x2
    RstStream,    // 0x3
    Settings,     // 0x4
    PushPromise,  // 0x5
    Ping,         // 0x6
    GoAway,       // 0x7
    WindowUpdate, // 0x8
    Continuation, // 0x9
    Unknown(u8),
}

#[derive(Debug, Clone)]
pub struct FrameH2 {
    pub frame_type: FrameTypeH2,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}
