//! Telemetry record encoding. `spec.md` §6 scopes the UART/DMA transport
//! out of this core — the core only produces the bytes to enqueue.

/// One sample's worth of telemetry: 10 bytes, big-endian, `\r\n`-terminated.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct TelemetryRecord {
    pub timestamp: u32,
    pub instantaneous: i16,
    pub averaged: i16,
}

impl TelemetryRecord {
    /// Encode to the wire format: `u32 timestamp, i16 instantaneous, i16
    /// averaged, b"\r\n"`, all big-endian.
    pub fn encode(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        out[4..6].copy_from_slice(&self.instantaneous.to_be_bytes());
        out[6..8].copy_from_slice(&self.averaged.to_be_bytes());
        out[8] = b'\r';
        out[9] = b'\n';
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_big_endian_layout() {
        let record = TelemetryRecord {
            timestamp: 0x0102_0304,
            instantaneous: -2,
            averaged: 100,
        };
        let bytes = record.encode();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..6], &(-2i16).to_be_bytes());
        assert_eq!(&bytes[6..8], &100i16.to_be_bytes());
        assert_eq!(&bytes[8..10], b"\r\n");
    }
}
