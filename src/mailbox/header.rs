use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Six little-endian `u32` fields.
pub const HEADER_SIZE: usize = 24;

/// Fixed record at offset 0 of the data file. All zero means "no frame yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub timestamp_sec: u32,
    pub timestamp_usec: u32,
    pub payload_size: u32,
}

impl MailboxHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let fields = [
            self.width,
            self.height,
            self.channels,
            self.timestamp_sec,
            self.timestamp_usec,
            self.payload_size,
        ];

        let mut out = [0u8; HEADER_SIZE];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// Decode the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` when fewer bytes are available.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..HEADER_SIZE)?;
        let field = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(raw)
        };

        Some(Self {
            width: field(0),
            height: field(1),
            channels: field(2),
            timestamp_sec: field(3),
            timestamp_usec: field(4),
            payload_size: field(5),
        })
    }

    /// True once a producer has published something readable.
    pub fn has_frame(&self) -> bool {
        self.width != 0 && self.height != 0 && self.payload_size != 0
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp {
            secs: self.timestamp_sec,
            micros: self.timestamp_usec,
        }
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            width: self.width,
            height: self.height,
            channels: self.channels,
            timestamp: self.timestamp(),
            payload_size: self.payload_size,
        }
    }
}

/// Wall-clock publish time, split the way the header stores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub secs: u32,
    pub micros: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Truncates to whole microseconds; times before the epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs() as u32,
            micros: since.subsec_micros(),
        }
    }

    /// `secs + micros / 1_000_000`
    pub fn as_secs_f64(&self) -> f64 {
        f64::from(self.secs) + f64::from(self.micros) / 1_000_000.0
    }

    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(u64::from(self.secs), self.micros.saturating_mul(1_000))
    }
}

/// Header contents of a published frame, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub timestamp: Timestamp,
    pub payload_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let header = MailboxHeader {
            width: 640,
            height: 480,
            channels: 3,
            timestamp_sec: 0x0102_0304,
            timestamp_usec: 999_999,
            payload_size: 0xAABB,
        };
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &640u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[20..24], &[0xBB, 0xAA, 0, 0]);
        assert_eq!(MailboxHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn zeroed_header_has_no_frame() {
        let header = MailboxHeader::decode(&[0; HEADER_SIZE]).unwrap();
        assert_eq!(header, MailboxHeader::default());
        assert!(!header.has_frame());
    }

    #[test]
    fn zero_payload_is_not_a_frame() {
        let header = MailboxHeader {
            width: 2,
            height: 2,
            channels: 3,
            ..MailboxHeader::default()
        };
        assert!(!header.has_frame());
    }

    #[test]
    fn short_input_does_not_decode() {
        assert_eq!(MailboxHeader::decode(&[0; HEADER_SIZE - 1]), None);
    }

    #[test]
    fn timestamp_splits_and_rejoins() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let ts = Timestamp::from_system_time(time);
        assert_eq!(ts.secs, 1_700_000_000);
        assert_eq!(ts.micros, 123_456);
        assert!((ts.as_secs_f64() - 1_700_000_000.123456).abs() < 1e-6);
        assert_eq!(ts.to_system_time(), UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_000));
    }
}
