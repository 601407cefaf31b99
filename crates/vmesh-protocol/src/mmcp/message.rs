//! MMCP wire format.
//!
//! ```text
//! what:i8 | message_id:i32 | body
//! ```
//!
//! | what | body |
//! |---|---|
//! | 1 Ping | - |
//! | 2 Pong | reply_to:i32 |
//! | 3 Ack | ack_of:i32 |
//! | 4 Originator | ping_time_sum:i16, has_config:u8, [config] |
//! | 5 HotspotRequest | band:i8, hotspot_type:i8 |
//! | 6 HotspotResponse | reply_to:i32, error_code:i32, has_config:u8, [config] |

use bytes::{Buf, BufMut};
use serde::Serialize;

use super::connect::{need, Band, ConnectConfig, HotspotType};
use crate::error::MmcpError;

pub const WHAT_PING: u8 = 1;
pub const WHAT_PONG: u8 = 2;
pub const WHAT_ACK: u8 = 3;
pub const WHAT_ORIGINATOR: u8 = 4;
pub const WHAT_HOTSPOT_REQUEST: u8 = 5;
pub const WHAT_HOTSPOT_RESPONSE: u8 = 6;

/// Hotspot came up; the response carries its config.
pub const HOTSPOT_OK: i32 = 0;
/// The node cannot host a hotspot.
pub const HOTSPOT_UNSUPPORTED: i32 = 1;
pub const HOTSPOT_FAILED: i32 = 2;
pub const HOTSPOT_BUSY: i32 = 3;

/// Ask a neighbor to bring up a shared access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HotspotRequest {
    pub band: Band,
    pub hotspot_type: HotspotType,
}

/// Outcome of a hotspot request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotResult {
    pub error_code: i32,
    pub config: Option<ConnectConfig>,
}

impl HotspotResult {
    pub fn ok(config: ConnectConfig) -> Self {
        Self {
            error_code: HOTSPOT_OK,
            config: Some(config),
        }
    }

    pub fn error(code: i32) -> Self {
        Self {
            error_code: code,
            config: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == HOTSPOT_OK
    }
}

/// One control message. `message_id` is only unique per sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcpMessage {
    pub message_id: i32,
    pub body: MmcpBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmcpBody {
    Ping,
    Pong {
        reply_to: i32,
    },
    Ack {
        ack_of: i32,
    },
    /// Periodic flood announcing the sender of the packet as reachable.
    Originator {
        /// Latency accumulated along the path so far, in ms.
        ping_time_sum: i16,
        connect_config: Option<ConnectConfig>,
    },
    HotspotRequest(HotspotRequest),
    HotspotResponse {
        reply_to: i32,
        result: HotspotResult,
    },
}

impl MmcpBody {
    pub fn what(&self) -> u8 {
        match self {
            MmcpBody::Ping => WHAT_PING,
            MmcpBody::Pong { .. } => WHAT_PONG,
            MmcpBody::Ack { .. } => WHAT_ACK,
            MmcpBody::Originator { .. } => WHAT_ORIGINATOR,
            MmcpBody::HotspotRequest(_) => WHAT_HOTSPOT_REQUEST,
            MmcpBody::HotspotResponse { .. } => WHAT_HOTSPOT_RESPONSE,
        }
    }
}

impl MmcpMessage {
    pub fn new(message_id: i32, body: MmcpBody) -> Self {
        Self { message_id, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.put_u8(self.body.what());
        out.put_i32(self.message_id);
        match &self.body {
            MmcpBody::Ping => {}
            MmcpBody::Pong { reply_to } => out.put_i32(*reply_to),
            MmcpBody::Ack { ack_of } => out.put_i32(*ack_of),
            MmcpBody::Originator {
                ping_time_sum,
                connect_config,
            } => {
                out.put_i16(*ping_time_sum);
                put_optional_config(&mut out, connect_config.as_ref());
            }
            MmcpBody::HotspotRequest(request) => {
                out.put_i8(request.band.to_wire());
                out.put_i8(request.hotspot_type.to_wire());
            }
            MmcpBody::HotspotResponse { reply_to, result } => {
                out.put_i32(*reply_to);
                out.put_i32(result.error_code);
                put_optional_config(&mut out, result.config.as_ref());
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, MmcpError> {
        let mut buf = data;
        need(&buf, 5)?;
        let what = buf.get_u8();
        let message_id = buf.get_i32();
        let body = match what {
            WHAT_PING => MmcpBody::Ping,
            WHAT_PONG => {
                need(&buf, 4)?;
                MmcpBody::Pong {
                    reply_to: buf.get_i32(),
                }
            }
            WHAT_ACK => {
                need(&buf, 4)?;
                MmcpBody::Ack {
                    ack_of: buf.get_i32(),
                }
            }
            WHAT_ORIGINATOR => {
                need(&buf, 3)?;
                let ping_time_sum = buf.get_i16();
                if ping_time_sum < 0 {
                    return Err(MmcpError::Malformed {
                        reason: format!("negative ping time sum {ping_time_sum}"),
                    });
                }
                MmcpBody::Originator {
                    ping_time_sum,
                    connect_config: get_optional_config(&mut buf)?,
                }
            }
            WHAT_HOTSPOT_REQUEST => {
                need(&buf, 2)?;
                MmcpBody::HotspotRequest(HotspotRequest {
                    band: Band::from_wire(buf.get_i8())?,
                    hotspot_type: HotspotType::from_wire(buf.get_i8())?,
                })
            }
            WHAT_HOTSPOT_RESPONSE => {
                need(&buf, 9)?;
                let reply_to = buf.get_i32();
                let error_code = buf.get_i32();
                MmcpBody::HotspotResponse {
                    reply_to,
                    result: HotspotResult {
                        error_code,
                        config: get_optional_config(&mut buf)?,
                    },
                }
            }
            other => return Err(MmcpError::UnknownMessageType(other)),
        };
        Ok(Self { message_id, body })
    }
}

fn put_optional_config(out: &mut Vec<u8>, config: Option<&ConnectConfig>) {
    match config {
        None => out.put_u8(0),
        Some(config) => {
            out.put_u8(1);
            config.encode(out);
        }
    }
}

fn get_optional_config(buf: &mut &[u8]) -> Result<Option<ConnectConfig>, MmcpError> {
    need(&*buf, 1)?;
    match buf.get_u8() {
        0 => Ok(None),
        1 => ConnectConfig::decode(buf).map(Some),
        other => Err(MmcpError::Malformed {
            reason: format!("bad config presence flag {other}"),
        }),
    }
}
