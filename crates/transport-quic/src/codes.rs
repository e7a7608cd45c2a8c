//! Application error codes carried in QUIC `CONNECTION_CLOSE` frames.

pub const DONE: u32 = 0;
pub const PROTOCOL: u32 = 1;
pub const REJECTED: u32 = 2;
pub const TRANSFER: u32 = 3;
pub const HANDSHAKE: u32 = 4;
pub const CANCELLED: u32 = 5;
pub const INTERNAL: u32 = 6;

pub fn describe(code: u64) -> &'static str {
    match code {
        0 => "done",
        1 => "protocol error",
        2 => "verification rejected",
        3 => "transfer error",
        4 => "handshake error",
        5 => "cancelled",
        6 => "internal error",
        _ => "unknown",
    }
}
