//! BER-TLV framing for APDUs exchanged with the card simulator.
//!
//! Every message on the simulator's TCP interface is wrapped in a single primitive,
//! context-specific TLV object (tag `0x80`) with a definite length.

/// Tag used to wrap APDUs, context-specific primitive `[0]`.
pub const APDU_TAG: u8 = 0x80;

const CONSTRUCTED: u8 = 0x20;
const MULTI_BYTE_TAG: u8 = 0x1F;
const LONG_FORM: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Illegal BER-TLV data structure")]
    IllegalStructure,

    #[error("TLV frame is incomplete: {needed} more bytes needed")]
    Incomplete { needed: usize },

    #[error("TLV object is constructed, a primitive was expected")]
    NotPrimitive,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stateful reader of TLV headers over a possibly partial buffer.
pub struct Reader<'a> {
    buffer: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader from the buffer.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    /// Reads a next octet and seeks the cursor.
    pub fn next_octet(&mut self) -> Result<u8> {
        let byte = *self
            .buffer
            .get(self.cursor)
            .ok_or(Error::Incomplete { needed: 1 })?;
        self.cursor += 1;

        Ok(byte)
    }

    /// Reads data of specified size and seeks the cursor.
    pub fn read(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.cursor.checked_add(length).ok_or(Error::IllegalStructure)?;
        let bytes = self
            .buffer
            .get(self.cursor..end)
            .ok_or_else(|| Error::Incomplete {
                needed: end.saturating_sub(self.buffer.len()),
            })?;
        self.cursor = end;

        Ok(bytes)
    }

    /// Reads the tag at the current position, returning its first octet.
    pub fn read_tag(&mut self) -> Result<u8> {
        let tag = self.next_octet()?;
        if tag & MULTI_BYTE_TAG == MULTI_BYTE_TAG {
            while self.next_octet()? & 0x80 != 0 {}
        }

        Ok(tag)
    }

    /// Reads the length at the current position, seeking the cursor.
    pub fn read_length(&mut self) -> Result<usize> {
        let head = self.next_octet()?;
        if head & LONG_FORM == 0 {
            return Ok(head as usize);
        }

        let octets = (head & 0x7F) as usize;
        if octets == 0 || octets > std::mem::size_of::<usize>() {
            // Indefinite lengths are not used on the simulator interface.
            return Err(Error::IllegalStructure);
        }

        let mut size = 0usize;
        for _ in 0..octets {
            size <<= 8;
            size |= self.next_octet()? as usize;
        }

        Ok(size)
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

/// Parses the header of a frame, returning the size of the header and the length of the value.
pub fn header(partial: &[u8]) -> Result<(usize, usize)> {
    let mut reader = Reader::new(partial);
    reader.read_tag()?;
    let length = reader.read_length()?;

    Ok((reader.position(), length))
}

/// Calculates the entire size of the frame from a partial buffer holding at least its header.
pub fn frame_size(partial: &[u8]) -> Result<usize> {
    let (header, length) = header(partial)?;

    header.checked_add(length).ok_or(Error::IllegalStructure)
}

/// Wraps the data into a primitive TLV object with [`APDU_TAG`].
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 6);
    frame.push(APDU_TAG);

    if data.len() < 0x80 {
        frame.push(data.len() as u8);
    } else {
        let bytes = data.len().to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        frame.push(LONG_FORM | (bytes.len() - skip) as u8);
        frame.extend_from_slice(&bytes[skip..]);
    }

    frame.extend_from_slice(data);
    frame
}

/// Strips the TLV header of a single primitive object and returns its value.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let mut reader = Reader::new(frame);
    let tag = reader.read_tag()?;
    if tag & CONSTRUCTED != 0 {
        return Err(Error::NotPrimitive);
    }

    let length = reader.read_length()?;
    let value = reader.read(length)?;
    if reader.position() != frame.len() {
        return Err(Error::IllegalStructure);
    }

    Ok(value.to_vec())
}
