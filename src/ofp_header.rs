use std::io::{Cursor, Read};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::OfpError;
use crate::openflow0x01::MsgCode;

/// OpenFlow Header
///
/// The first fields of every OpenFlow message, no matter the protocol version.
/// This is parsed to determine version and length of the remaining message, so that
/// it can be properly handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct OfpHeader {
    version: u8,
    typ: u8,
    length: u16,
    xid: u32,
}

impl OfpHeader {
    /// Create an `OfpHeader` out of the arguments.
    pub fn new(version: u8, typ: u8, length: u16, xid: u32) -> OfpHeader {
        OfpHeader {
            version,
            typ,
            length,
            xid,
        }
    }

    /// Return the byte-size of an `OfpHeader`.
    pub fn size() -> usize {
        size_of::<OfpHeader>()
    }

    /// Fills a message buffer with the header fields of an `OfpHeader`.
    pub fn marshal(bytes: &mut Vec<u8>, header: OfpHeader) {
        // Writes into a `Vec` cannot fail.
        let _ = bytes.write_u8(header.version());
        let _ = bytes.write_u8(header.typ);
        let _ = bytes.write_u16::<BigEndian>(header.length() as u16);
        let _ = bytes.write_u32::<BigEndian>(header.xid());
    }

    /// Takes a message buffer (sized for an `OfpHeader`) and returns an `OfpHeader`.
    pub fn parse(buf: [u8; 8]) -> OfpHeader {
        OfpHeader {
            version: buf[0],
            typ: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Read a header off `reader`, blocking until all eight bytes arrive.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<OfpHeader, OfpError> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(Self::parse(buf))
    }

    /// Parse a header from the front of `bytes`.
    pub fn parse_slice(bytes: &[u8]) -> Result<OfpHeader, OfpError> {
        if bytes.len() < Self::size() {
            return Err(OfpError::Truncated("OpenFlow header"));
        }
        let mut c = Cursor::new(bytes);
        Ok(OfpHeader {
            version: c.read_u8()?,
            typ: c.read_u8()?,
            length: c.read_u16::<BigEndian>()?,
            xid: c.read_u32::<BigEndian>()?,
        })
    }

    /// Return the `version` field of a header.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the OpenFlow message type code of a header.
    pub fn type_code(&self) -> Result<MsgCode, OfpError> {
        MsgCode::try_from(self.typ)
    }

    /// Return the `length` field of a header. Includes the length of the header itself.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Return the `xid` field of a header, the transaction id associated with this packet.
    ///  Replies use the same id to facilitate pairing.
    pub fn xid(&self) -> u32 {
        self.xid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_eight_bytes() {
        assert_eq!(OfpHeader::size(), 8);
    }

    #[test]
    fn marshal_then_parse_keeps_fields() {
        let mut bytes = vec![];
        OfpHeader::marshal(&mut bytes, OfpHeader::new(0x01, 14, 80, 0xdead_beef));
        let hdr = OfpHeader::parse_slice(&bytes).unwrap();
        assert_eq!(hdr.version(), 0x01);
        assert!(matches!(hdr.type_code().unwrap(), MsgCode::FlowMod));
        assert_eq!(hdr.length(), 80);
        assert_eq!(hdr.xid(), 0xdead_beef);
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert!(matches!(
            OfpHeader::parse_slice(&[1, 0, 0]),
            Err(OfpError::Truncated(_))
        ));
    }
}
