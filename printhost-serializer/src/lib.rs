use bytes::{BufMut, Bytes, BytesMut};

/// XOR fold of every byte of `payload`; the value Marlin-family firmwares
/// expect after the `*` of a numbered line.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |sum, byte| sum ^ byte)
}

/// Renders command lines into their wire form.
///
/// Lines accumulate in an internal buffer and are handed out as frozen
/// [`Bytes`], so a formatted line can be kept for resends or pushed into a
/// channel without re-copying the text.
#[derive(Debug, Default)]
pub struct LineFormatter {
    buffer: BytesMut,
}

impl LineFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format `command` as `N<sequence> <command>*<checksum>\n`.
    ///
    /// The checksum covers the `N<sequence> <command>` region, newline
    /// excluded.
    pub fn sequenced(&mut self, sequence: i32, command: &str) -> Bytes {
        let mut itoa = itoa::Buffer::new();
        self.buffer.put_u8(b'N');
        self.buffer.put_slice(itoa.format(sequence).as_bytes());
        self.buffer.put_u8(b' ');
        self.buffer.put_slice(command.as_bytes());
        let sum = checksum(&self.buffer);
        self.buffer.put_u8(b'*');
        self.buffer.put_slice(itoa.format(sum).as_bytes());
        self.buffer.put_u8(b'\n');
        self.buffer.split().freeze()
    }

    /// Format `command` verbatim with the framing newline; no sequence
    /// number, no checksum.
    pub fn raw(&mut self, command: &str) -> Bytes {
        self.buffer.put_slice(command.as_bytes());
        self.buffer.put_u8(b'\n');
        self.buffer.split().freeze()
    }
}
