//! Content encodings accepted for upload bodies.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::mem;

use flate2::write::GzDecoder;

use crate::upload::UploadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

impl ContentEncoding {
    /// Interpret a `Content-Encoding` value. Absent and empty mean identity.
    pub fn parse(value: Option<&str>) -> Result<Self, UploadError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Identity),
            Some(v) if v.eq_ignore_ascii_case("identity") => Ok(Self::Identity),
            Some(v) if v.eq_ignore_ascii_case("gzip") => Ok(Self::Gzip),
            Some(other) => Err(UploadError::ContentEncodingUnsupported(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental decoder turning raw body chunks into file content.
pub(crate) enum BodyDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
}

impl BodyDecoder {
    pub(crate) fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => Self::Identity,
            ContentEncoding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
        }
    }

    /// Decode one chunk. The result may be empty while gzip buffers input.
    pub(crate) fn feed<'a>(&'a mut self, chunk: &'a [u8]) -> io::Result<Cow<'a, [u8]>> {
        match self {
            Self::Identity => Ok(Cow::Borrowed(chunk)),
            Self::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Ok(Cow::Owned(mem::take(decoder.get_mut())))
            }
        }
    }

    /// Flush whatever the decoder still holds. Fails on a truncated stream.
    pub(crate) fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(Vec::new()),
            Self::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(mem::take(decoder.get_mut()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn decode_in_chunks(encoding: ContentEncoding, body: &[u8], chunk: usize) -> io::Result<Vec<u8>> {
        let mut decoder = BodyDecoder::new(encoding);
        let mut out = Vec::new();
        for piece in body.chunks(chunk) {
            out.extend_from_slice(&decoder.feed(piece)?);
        }
        out.extend(decoder.finish()?);
        Ok(out)
    }

    #[test]
    fn test_parse() {
        assert_eq!(ContentEncoding::parse(None).unwrap(), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::parse(Some("")).unwrap(), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::parse(Some("identity")).unwrap(), ContentEncoding::Identity);
        assert_eq!(ContentEncoding::parse(Some("GZIP")).unwrap(), ContentEncoding::Gzip);
        assert!(matches!(
            ContentEncoding::parse(Some("br")),
            Err(UploadError::ContentEncodingUnsupported(e)) if e == "br"
        ));
    }

    #[test]
    fn test_gzip_in_small_chunks() {
        let content: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let decoded = decode_in_chunks(ContentEncoding::Gzip, &gzip(&content), 7).unwrap();
        assert_eq!(decoded, content);
    }

    #[test]
    fn test_identity_passthrough() {
        let decoded = decode_in_chunks(ContentEncoding::Identity, b"plain bytes", 3).unwrap();
        assert_eq!(decoded, b"plain bytes");
    }

    #[test]
    fn test_truncated_gzip_fails() {
        let compressed = gzip(b"this stream will be cut short");
        let truncated = &compressed[..compressed.len() / 2];
        assert!(decode_in_chunks(ContentEncoding::Gzip, truncated, 4).is_err());
    }
}
