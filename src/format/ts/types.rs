use crate::error::{Result, VtpError};
use crate::utils::Crc32Mpeg2;
use bytes::{BufMut, BytesMut};

// Packet geometry
/// Size of one transport packet.
pub const TS_PACKET_SIZE: usize = 188;
/// Size of the fixed packet header.
pub const TS_HEADER_SIZE: usize = 4;
/// First byte of every packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

// PIDs
/// PID carrying the PAT.
pub const PID_PAT: u16 = 0x0000;
/// PID of the filler PMT.
pub const PID_PMT: u16 = 0x1000;
/// PID of the filler video stream.
pub const PID_VIDEO: u16 = 0x0100;

// Table IDs
/// PAT table id.
pub const TABLE_ID_PAT: u8 = 0x00;
/// PMT table id.
pub const TABLE_ID_PMT: u8 = 0x02;

// Elementary streams
/// ISO/IEC 13818-2 video.
pub const STREAM_TYPE_MPEG2_VIDEO: u8 = 0x02;
/// PES stream id of the first video stream.
pub const STREAM_ID_VIDEO: u8 = 0xe0;

/// Program number used by the generated PSI.
pub const PROGRAM_NUMBER: u16 = 1;

/// One program in a [`PAT`].
#[derive(Debug, Clone)]
pub struct PATEntry {
    /// Program number
    pub program_number: u16,
    /// PID of the program's PMT
    pub program_map_pid: u16,
}

/// Program association table.
#[derive(Debug, Clone, Default)]
pub struct PAT {
    /// Transport stream id
    pub transport_stream_id: u16,
    /// Programs
    pub entries: Vec<PATEntry>,
}

impl PAT {
    /// Single-program table pointing at `pmt_pid`.
    pub fn single(program_number: u16, pmt_pid: u16) -> Self {
        Self {
            transport_stream_id: 1,
            entries: vec![PATEntry {
                program_number,
                program_map_pid: pmt_pid,
            }],
        }
    }

    /// Complete section including table header and CRC.
    pub fn section(&self, crc: &Crc32Mpeg2) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(self.entries.len() * 4);
        for entry in &self.entries {
            body.put_u16(entry.program_number);
            body.put_u16(entry.program_map_pid & 0x1fff | 7 << 13);
        }
        long_section(TABLE_ID_PAT, self.transport_stream_id, &body, crc)
    }
}

/// One elementary stream in a [`PMT`].
#[derive(Debug, Clone)]
pub struct ElementaryStreamInfo {
    /// Stream type
    pub stream_type: u8,
    /// PID carrying the stream
    pub elementary_pid: u16,
}

/// Program map table without descriptors.
#[derive(Debug, Clone, Default)]
pub struct PMT {
    /// Program number
    pub program_number: u16,
    /// PID carrying the PCR
    pub pcr_pid: u16,
    /// Streams of the program
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

impl PMT {
    /// Complete section including table header and CRC.
    pub fn section(&self, crc: &Crc32Mpeg2) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(4 + self.elementary_stream_infos.len() * 5);
        body.put_u16(self.pcr_pid & 0x1fff | 7 << 13);
        // No program descriptors.
        body.put_u16(0xf << 12);

        for info in &self.elementary_stream_infos {
            body.put_u8(info.stream_type);
            body.put_u16(info.elementary_pid & 0x1fff | 7 << 13);
            body.put_u16(0xf << 12);
        }
        long_section(TABLE_ID_PMT, self.program_number, &body, crc)
    }
}

/// Wraps `body` in the long section syntax: version 0, current, one section.
fn long_section(table_id: u8, table_ext: u16, body: &[u8], crc: &Crc32Mpeg2) -> Vec<u8> {
    // table_ext .. last_section_number, body, CRC
    let section_length = 5 + body.len() + 4;
    let mut section = Vec::with_capacity(3 + section_length);
    section.push(table_id);
    section.push(0xb0 | ((section_length >> 8) & 0x0f) as u8);
    section.push((section_length & 0xff) as u8);
    section.extend_from_slice(&table_ext.to_be_bytes());
    section.push(0xc1);
    section.push(0x00);
    section.push(0x00);
    section.extend_from_slice(body);
    crc.seal(&mut section);
    section
}

/// The four-byte packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TSHeader {
    /// Transport error indicator
    pub transport_error: bool,
    /// A PES packet or section starts here
    pub payload_unit_start: bool,
    /// Packet identifier
    pub pid: u16,
    /// Adaptation field follows the header
    pub adaptation_field_exists: bool,
    /// Payload follows
    pub contains_payload: bool,
    /// 4-bit continuity counter
    pub continuity_counter: u8,
}

impl Default for TSHeader {
    fn default() -> Self {
        Self {
            transport_error: false,
            payload_unit_start: false,
            pid: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TSHeader {
    /// Appends the header to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(TS_SYNC_BYTE);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        b1 |= ((self.pid >> 8) & 0x1f) as u8;
        buf.put_u8(b1);

        buf.put_u8((self.pid & 0xff) as u8);

        let mut b3 = 0u8;
        if self.adaptation_field_exists {
            b3 |= 0x20;
        }
        if self.contains_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0f;
        buf.put_u8(b3);
    }

    /// Parses the four header bytes of a packet.
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < TS_HEADER_SIZE {
            return Err(VtpError::InvalidData(format!(
                "TS header needs {} bytes, got {}",
                TS_HEADER_SIZE,
                packet.len()
            )));
        }
        if packet[0] != TS_SYNC_BYTE {
            return Err(VtpError::InvalidData(format!(
                "expected sync byte, found 0x{:02x}",
                packet[0]
            )));
        }

        Ok(Self {
            transport_error: packet[1] & 0x80 != 0,
            payload_unit_start: packet[1] & 0x40 != 0,
            pid: u16::from(packet[1] & 0x1f) << 8 | u16::from(packet[2]),
            adaptation_field_exists: packet[3] & 0x20 != 0,
            contains_payload: packet[3] & 0x10 != 0,
            continuity_counter: packet[3] & 0x0f,
        })
    }
}

/// Position of the first sync byte in `data`.
pub fn find_sync(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == TS_SYNC_BYTE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_write_and_parse() {
        let header = TSHeader {
            payload_unit_start: true,
            pid: PID_VIDEO,
            adaptation_field_exists: true,
            continuity_counter: 7,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(&buf[..], &[0x47, 0x41, 0x00, 0x37]);
        assert_eq!(TSHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_parse_rejects_missing_sync() {
        assert!(TSHeader::parse(&[0x00, 0x00, 0x00, 0x10]).is_err());
        assert!(TSHeader::parse(&[0x47, 0x00]).is_err());
    }

    #[test]
    fn test_pat_section() {
        let crc = Crc32Mpeg2::new();
        let section = PAT::single(PROGRAM_NUMBER, PID_PMT).section(&crc);
        assert_eq!(
            &section[..12],
            &[0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc1, 0x00, 0x00, 0x00, 0x01, 0xf0, 0x00]
        );
        assert_eq!(section.len(), 16);
        assert_eq!(crc.calculate(&section), 0);
    }

    #[test]
    fn test_pmt_section() {
        let crc = Crc32Mpeg2::new();
        let pmt = PMT {
            program_number: PROGRAM_NUMBER,
            pcr_pid: PID_VIDEO,
            elementary_stream_infos: vec![ElementaryStreamInfo {
                stream_type: STREAM_TYPE_MPEG2_VIDEO,
                elementary_pid: PID_VIDEO,
            }],
        };
        let section = pmt.section(&crc);
        // 3 header bytes + section_length (5 + 4 + 5 + 4)
        assert_eq!(section.len(), 21);
        assert_eq!(section[2], 18);
        assert_eq!(section[12], STREAM_TYPE_MPEG2_VIDEO);
        assert_eq!(crc.calculate(&section), 0);
    }

    #[test]
    fn test_find_sync() {
        assert_eq!(find_sync(&[1, 2, 0x47, 3]), Some(2));
        assert_eq!(find_sync(&[1, 2, 3]), None);
    }
}
