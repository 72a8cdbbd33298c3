//! Binary image framing: magic, version, then tagged LZ4 chunks.

use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"GATENET1";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

/// Chunk holding a JSON-encoded network snapshot.
pub const TAG_SNAPSHOT: [u8; 4] = *b"SNAP";

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Raw LZ4 block; the uncompressed size travels in the chunk header.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<u32> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad network image magic",
        ));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported network image version",
        ));
    }
    Ok(version)
}

/// Write an LZ4 chunk.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the next chunk and return its tag and decompressed payload, or
/// `None` at a clean end of stream.
pub fn read_chunk_lz4<R: Read>(r: &mut R) -> io::Result<Option<([u8; 4], Vec<u8>)>> {
    let (tag, len) = match read_chunk_header(r) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut take = r.take(u64::from(len));
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk",
        ));
    }
    let payload = decompress_lz4(&compressed, uncompressed_len)?;
    Ok(Some((tag, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_rejects_foreign_magic() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"NOTANET0");
        write_u32_le(&mut buf, VERSION_CURRENT).unwrap();
        let err = read_header(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn chunks_are_read_back_until_eof() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        write_chunk_lz4(&mut buf, TAG_SNAPSHOT, b"{\"neurons\":[]}").unwrap();
        write_chunk_lz4(&mut buf, *b"XTRA", &[7u8; 64]).unwrap();

        let mut r = Cursor::new(buf);
        assert_eq!(read_header(&mut r).unwrap(), VERSION_CURRENT);
        let (tag, payload) = read_chunk_lz4(&mut r).unwrap().unwrap();
        assert_eq!(tag, TAG_SNAPSHOT);
        assert_eq!(payload, b"{\"neurons\":[]}");
        let (tag, payload) = read_chunk_lz4(&mut r).unwrap().unwrap();
        assert_eq!(&tag, b"XTRA");
        assert_eq!(payload.len(), 64);
        assert!(read_chunk_lz4(&mut r).unwrap().is_none());
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let mut buf = Vec::new();
        write_chunk_lz4(&mut buf, TAG_SNAPSHOT, &[1u8; 128]).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(read_chunk_lz4(&mut Cursor::new(buf)).is_err());
    }
}
