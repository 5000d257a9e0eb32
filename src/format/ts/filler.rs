//! "No signal" filler stream.
//!
//! Served in place of live TV when the backend delivers nothing. A small
//! elementary-stream payload is wrapped once into PAT, PMT and PES packets
//! and then replayed in a loop.

use super::types::{
    ElementaryStreamInfo, TSHeader, PAT, PID_PAT, PID_PMT, PID_VIDEO, PMT, PROGRAM_NUMBER,
    STREAM_ID_VIDEO, STREAM_TYPE_MPEG2_VIDEO, TS_HEADER_SIZE, TS_PACKET_SIZE, TS_SYNC_BYTE,
};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::path::Path;

/// MPEG-2 video sequence header (720x576, 4:3, 25 fps) and sequence end.
const BUILTIN_PAYLOAD: [u8; 16] = [
    0x00, 0x00, 0x01, 0xb3, 0x2d, 0x02, 0x40, 0x23, 0xff, 0xff, 0xe0, 0x18, 0x00, 0x00, 0x01,
    0xb7,
];

const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;

/// Looping TS source for the "no signal" picture.
#[derive(Debug, Clone)]
pub struct FillerStream {
    packets: Bytes,
    position: usize,
}

impl FillerStream {
    /// Loads the payload from `path`, falling back to the built-in one when
    /// no path is given or the file cannot be read.
    ///
    /// A file that already is a transport stream is used unchanged.
    pub async fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::builtin();
        };

        match tokio::fs::read(path).await {
            Ok(data) if is_transport_stream(&data) => {
                debug!("using TS filler from {}", path.display());
                Self {
                    packets: Bytes::from(data),
                    position: 0,
                }
            }
            Ok(data) if !data.is_empty() => {
                debug!("wrapping {} byte filler from {}", data.len(), path.display());
                Self::from_payload(&data)
            }
            Ok(_) => {
                warn!("filler file {} is empty, using built-in", path.display());
                Self::builtin()
            }
            Err(e) => {
                warn!("cannot read filler file {}: {}", path.display(), e);
                Self::builtin()
            }
        }
    }

    /// Built-in filler.
    pub fn builtin() -> Self {
        Self::from_payload(&BUILTIN_PAYLOAD)
    }

    /// Wraps an elementary-stream payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            packets: wrap_payload(payload),
            position: 0,
        }
    }

    /// Length of one loop in bytes; always a multiple of the packet size.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// True if the stream holds no packets.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Fills `buf` with whole packets, wrapping around at the end.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.packets.is_empty() {
            return 0;
        }
        let wanted = buf.len() / TS_PACKET_SIZE * TS_PACKET_SIZE;
        let mut filled = 0;
        while filled < wanted {
            let chunk = (wanted - filled).min(self.packets.len() - self.position);
            buf[filled..filled + chunk]
                .copy_from_slice(&self.packets[self.position..self.position + chunk]);
            filled += chunk;
            self.position = (self.position + chunk) % self.packets.len();
        }
        filled
    }

    /// Restarts the loop at the PAT.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl Default for FillerStream {
    fn default() -> Self {
        Self::builtin()
    }
}

fn is_transport_stream(data: &[u8]) -> bool {
    !data.is_empty()
        && data.len() % TS_PACKET_SIZE == 0
        && data.chunks(TS_PACKET_SIZE).all(|p| p[0] == TS_SYNC_BYTE)
}

/// Builds PAT, PMT and the PES packets carrying `payload`.
pub fn wrap_payload(payload: &[u8]) -> Bytes {
    let crc = Crc32Mpeg2::new();
    let mut out = BytesMut::new();

    let pat = PAT::single(PROGRAM_NUMBER, PID_PMT).section(&crc);
    write_section_packet(&mut out, PID_PAT, &pat);

    let pmt = PMT {
        program_number: PROGRAM_NUMBER,
        pcr_pid: PID_VIDEO,
        elementary_stream_infos: vec![ElementaryStreamInfo {
            stream_type: STREAM_TYPE_MPEG2_VIDEO,
            elementary_pid: PID_VIDEO,
        }],
    }
    .section(&crc);
    write_section_packet(&mut out, PID_PMT, &pmt);

    write_pes_packets(&mut out, PID_VIDEO, &pes(payload));
    out.freeze()
}

fn pes(payload: &[u8]) -> Vec<u8> {
    let mut pes = Vec::with_capacity(payload.len() + 9);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
    // Optional header (3 bytes) plus payload; 0 means unbounded for video.
    let length = payload.len() + 3;
    let length = if length > 0xffff { 0 } else { length as u16 };
    pes.extend_from_slice(&length.to_be_bytes());
    pes.extend_from_slice(&[0x80, 0x00, 0x00]);
    pes.extend_from_slice(payload);
    pes
}

fn write_section_packet(out: &mut BytesMut, pid: u16, section: &[u8]) {
    TSHeader {
        payload_unit_start: true,
        pid,
        ..Default::default()
    }
    .write_to(out);
    out.put_u8(0x00);
    out.put_slice(section);
    out.put_bytes(0xff, TS_PAYLOAD_SIZE - 1 - section.len());
}

fn write_pes_packets(out: &mut BytesMut, pid: u16, pes: &[u8]) {
    for (counter, chunk) in pes.chunks(TS_PAYLOAD_SIZE).enumerate() {
        let stuffing = TS_PAYLOAD_SIZE - chunk.len();
        TSHeader {
            payload_unit_start: counter == 0,
            pid,
            adaptation_field_exists: stuffing > 0,
            continuity_counter: (counter & 0x0f) as u8,
            ..Default::default()
        }
        .write_to(out);

        if stuffing > 0 {
            // adaptation_field_length counts the bytes after itself.
            out.put_u8((stuffing - 1) as u8);
            if stuffing > 1 {
                out.put_u8(0x00);
                out.put_bytes(0xff, stuffing - 2);
            }
        }
        out.put_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pid(packet: &[u8]) -> u16 {
        TSHeader::parse(packet).unwrap().pid
    }

    /// Reassembles the payload bytes of every packet on `wanted`.
    fn payload_of(stream: &[u8], wanted: u16) -> Vec<u8> {
        let mut out = Vec::new();
        for packet in stream.chunks(TS_PACKET_SIZE) {
            let header = TSHeader::parse(packet).unwrap();
            if header.pid != wanted {
                continue;
            }
            let mut start = TS_HEADER_SIZE;
            if header.adaptation_field_exists {
                start += 1 + packet[TS_HEADER_SIZE] as usize;
            }
            out.extend_from_slice(&packet[start..]);
        }
        out
    }

    #[test]
    fn test_builtin_layout() {
        let filler = FillerStream::builtin();
        assert_eq!(filler.len(), 3 * TS_PACKET_SIZE);

        let packets: Vec<&[u8]> = filler.packets.chunks(TS_PACKET_SIZE).collect();
        assert_eq!(pid(packets[0]), PID_PAT);
        assert_eq!(pid(packets[1]), PID_PMT);
        assert_eq!(pid(packets[2]), PID_VIDEO);

        let pes = payload_of(&filler.packets, PID_VIDEO);
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
        assert_eq!(&pes[9..], &BUILTIN_PAYLOAD);
    }

    #[test]
    fn test_psi_sections_carry_valid_crc() {
        let filler = FillerStream::builtin();
        let crc = Crc32Mpeg2::new();
        for packet in filler.packets.chunks(TS_PACKET_SIZE).take(2) {
            let section = &packet[TS_HEADER_SIZE + 1..];
            let length = ((section[1] as usize & 0x0f) << 8 | section[2] as usize) + 3;
            assert_eq!(crc.calculate(&section[..length]), 0);
        }
    }

    #[test]
    fn test_large_payload_spans_packets() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let stream = wrap_payload(&payload);
        assert_eq!(stream.len() % TS_PACKET_SIZE, 0);
        // PAT + PMT + ceil((1000 + 9) / 184) PES packets
        assert_eq!(stream.len() / TS_PACKET_SIZE, 2 + 6);

        let pes = payload_of(&stream, PID_VIDEO);
        assert_eq!(&pes[9..], &payload[..]);

        let counters: Vec<u8> = stream
            .chunks(TS_PACKET_SIZE)
            .skip(2)
            .map(|p| TSHeader::parse(p).unwrap().continuity_counter)
            .collect();
        assert_eq!(counters, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_read_loops_whole_packets() {
        let mut filler = FillerStream::builtin();
        let mut buf = vec![0u8; 4 * TS_PACKET_SIZE + 100];
        assert_eq!(filler.read(&mut buf), 4 * TS_PACKET_SIZE);
        // The fourth packet is the PAT again.
        assert_eq!(pid(&buf[3 * TS_PACKET_SIZE..]), PID_PAT);
        assert_eq!(pid(&filler.packets[TS_PACKET_SIZE..]), PID_PMT);

        let mut next = vec![0u8; TS_PACKET_SIZE];
        assert_eq!(filler.read(&mut next), TS_PACKET_SIZE);
        assert_eq!(pid(&next), PID_PMT);

        let mut tiny = [0u8; 10];
        assert_eq!(filler.read(&mut tiny), 0);
    }

    #[test]
    fn test_load_falls_back_to_builtin() {
        let missing = std::env::temp_dir().join("vtpio-no-such-filler.mpg");
        let filler = tokio_test::block_on(FillerStream::load(Some(&missing)));
        assert_eq!(filler.packets, FillerStream::builtin().packets);

        let filler = tokio_test::block_on(FillerStream::load(None));
        assert_eq!(filler.len(), 3 * TS_PACKET_SIZE);
    }

    #[tokio::test]
    async fn test_load_uses_ts_file_unchanged() {
        let ts = wrap_payload(&[1, 2, 3, 4]);
        let path = std::env::temp_dir().join(format!("vtpio-filler-{}.ts", std::process::id()));
        tokio::fs::write(&path, &ts).await.unwrap();

        let filler = FillerStream::load(Some(&path)).await;
        assert_eq!(filler.packets, ts);
        tokio::fs::remove_file(&path).await.unwrap();
    }
}
