use bytes::Bytes;

/// Transport-neutral websocket message.
///
/// This is the surface the codec collaborator exposes to the pump: transports convert
/// their native frame representation into/from `Frame`. Control frames (ping/pong) are
/// answered inside the codec and never reach this level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

/// Close payload carried by a peer- or self-initiated closure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

/// Closure codes this crate sends or inspects (RFC 6455 §7.4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the regular goodbye.
    Normal,
    /// 1001, the endpoint is going away (server shutdown).
    EndpointUnavailable,
    /// Anything else observed on the wire.
    Other(u16),
}

impl CloseCode {
    #[inline]
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::EndpointUnavailable => 1001,
            CloseCode::Other(code) => code,
        }
    }

    #[inline]
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::EndpointUnavailable,
            other => CloseCode::Other(other),
        }
    }
}

impl Frame {
    #[inline]
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }
}

/// Borrow the payload bytes from data frames without allocation.
#[inline]
pub fn frame_bytes(frame: &Frame) -> Option<&[u8]> {
    match frame {
        Frame::Text(bytes) => Some(bytes.as_ref()),
        Frame::Binary(bytes) => Some(bytes.as_ref()),
        Frame::Close(_) => None,
    }
}

/// Describe a peer closure the way event consumers see it: the reason text when the
/// peer supplied one, a code-derived placeholder otherwise.
pub fn describe_close(frame: &Option<CloseFrame>) -> String {
    match frame {
        Some(close) if !close.reason.is_empty() => close.reason.clone(),
        Some(close) => format!("remote closed with code {}", close.code.as_u16()),
        None => "remote closed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_round_trips() {
        assert_eq!(CloseCode::from_u16(1000), CloseCode::Normal);
        assert_eq!(CloseCode::from_u16(1001), CloseCode::EndpointUnavailable);
        assert_eq!(CloseCode::from_u16(4000), CloseCode::Other(4000));
        assert_eq!(CloseCode::Other(4000).as_u16(), 4000);
    }

    #[test]
    fn close_description_prefers_reason() {
        let frame = Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done for today".to_string(),
        });
        assert_eq!(describe_close(&frame), "done for today");

        let bare = Some(CloseFrame {
            code: CloseCode::EndpointUnavailable,
            reason: String::new(),
        });
        assert_eq!(describe_close(&bare), "remote closed with code 1001");
        assert_eq!(describe_close(&None), "remote closed");
    }

    #[test]
    fn frame_bytes_skips_close() {
        assert!(frame_bytes(&Frame::close(CloseCode::Normal, "bye")).is_none());
        let frame = Frame::Text(Bytes::from_static(b"hello"));
        assert_eq!(frame_bytes(&frame), Some(&b"hello"[..]));
    }
}
