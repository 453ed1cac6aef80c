//! The fixed-size frame exchanged on the rendezvous socket.
//!
//! Every frame is exactly [`FRAME_LEN`] bytes: a kind byte, a length byte,
//! and a payload buffer sized to the largest variant, the window-size
//! record. Small inputs still travel as a full frame; that trades a few
//! bytes of bandwidth for readers that never have to parse incrementally.

use crate::error::FrameError;

/// Payload capacity: the window-size record, four u16 fields.
pub const PAYLOAD_MAX: usize = std::mem::size_of::<WindowSize>();

/// Size of one wire frame: kind byte, length byte, payload.
pub const FRAME_LEN: usize = 2 + PAYLOAD_MAX;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Reserved for a forced-detach notification; never sent today.
    Snatch = 0,
    /// Keyboard bytes from the attached client to the terminal.
    Input = 1,
    /// Terminal bytes from the daemon to the attached client.
    Output = 2,
    /// The attached client's terminal dimensions changed.
    WindowResize = 3,
}

impl PacketKind {
    fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0 => Ok(PacketKind::Snatch),
            1 => Ok(PacketKind::Input),
            2 => Ok(PacketKind::Output),
            3 => Ok(PacketKind::WindowResize),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Terminal dimensions, the shape TIOCGWINSZ reports them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub xpixel: u16,
    pub ypixel: u16,
}

/// One wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    length: u8,
    payload: [u8; PAYLOAD_MAX],
}

impl Packet {
    /// Wrap keyboard bytes bound for the terminal.
    ///
    /// `bytes` must fit the payload; callers chunk longer input themselves.
    pub fn input(bytes: &[u8]) -> Self {
        Self::data(PacketKind::Input, bytes)
    }

    /// Wrap terminal bytes bound for the attached client.
    pub fn output(bytes: &[u8]) -> Self {
        Self::data(PacketKind::Output, bytes)
    }

    fn data(kind: PacketKind, bytes: &[u8]) -> Self {
        assert!(
            bytes.len() <= PAYLOAD_MAX,
            "payload of {} bytes exceeds frame capacity",
            bytes.len()
        );
        let mut payload = [0u8; PAYLOAD_MAX];
        payload[..bytes.len()].copy_from_slice(bytes);
        Self {
            kind,
            length: bytes.len() as u8,
            payload,
        }
    }

    /// Build a window-resize frame. The length byte carries no meaning for
    /// this kind; the whole payload is the record.
    pub fn resize(size: WindowSize) -> Self {
        let mut payload = [0u8; PAYLOAD_MAX];
        // Native byte order: frames never leave the host.
        payload[0..2].copy_from_slice(&size.rows.to_ne_bytes());
        payload[2..4].copy_from_slice(&size.cols.to_ne_bytes());
        payload[4..6].copy_from_slice(&size.xpixel.to_ne_bytes());
        payload[6..8].copy_from_slice(&size.ypixel.to_ne_bytes());
        Self {
            kind: PacketKind::WindowResize,
            length: PAYLOAD_MAX as u8,
            payload,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// The valid payload prefix, exactly `length` bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length as usize]
    }

    /// Reinterpret the payload as a window-size record.
    pub fn window_size(&self) -> WindowSize {
        let p = &self.payload;
        WindowSize {
            rows: u16::from_ne_bytes([p[0], p[1]]),
            cols: u16::from_ne_bytes([p[2], p[3]]),
            xpixel: u16::from_ne_bytes([p[4], p[5]]),
            ypixel: u16::from_ne_bytes([p[6], p[7]]),
        }
    }

    /// Serialize into one full wire frame.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.length;
        buf[2..].copy_from_slice(&self.payload);
        buf
    }

    /// Deserialize one full wire frame.
    ///
    /// The caller guarantees the buffer was filled by a read of exactly
    /// [`FRAME_LEN`] bytes. A garbled frame (unknown kind, impossible
    /// length) is reported so the caller can drop the connection.
    pub fn decode(buf: &[u8; FRAME_LEN]) -> Result<Self, FrameError> {
        let kind = PacketKind::from_byte(buf[0])?;
        let length = buf[1];
        if length as usize > PAYLOAD_MAX {
            return Err(FrameError::BadLength(length));
        }
        let mut payload = [0u8; PAYLOAD_MAX];
        payload.copy_from_slice(&buf[2..]);
        Ok(Self {
            kind,
            length,
            payload,
        })
    }
}
