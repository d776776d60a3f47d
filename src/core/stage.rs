//! Purpose: Byte transforms that sit between a source and a sink.
//! Exports: `Stage`, `Identity`, `GzipCompress`, `GzipDecompress`.
//! Role: Pure chunk-in/chunks-out steps driven by the pipeline coordinator.
//! Invariants: `flush` is called exactly once, after the last `transform`.
//! Invariants: A stage owns its codec state; no state is shared between instances.
//! Invariants: Emitted chunks never exceed `DEFAULT_CHUNK_BYTES`.
use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder};

use crate::core::error::{Error, ErrorKind};
use crate::core::source::DEFAULT_CHUNK_BYTES;

pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Consumes one chunk and returns zero or more chunks.
    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error>;

    /// Drains anything buffered once upstream has ended.
    fn flush(&mut self) -> Result<Vec<Bytes>, Error>;
}

/// Passes chunks through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Stage for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        Ok(vec![chunk])
    }

    fn flush(&mut self) -> Result<Vec<Bytes>, Error> {
        Ok(Vec::new())
    }
}

fn split_output(buf: Vec<u8>) -> Vec<Bytes> {
    if buf.is_empty() {
        return Vec::new();
    }
    let mut buf = Bytes::from(buf);
    let mut out = Vec::with_capacity(buf.len().div_ceil(DEFAULT_CHUNK_BYTES));
    while buf.len() > DEFAULT_CHUNK_BYTES {
        out.push(buf.split_to(DEFAULT_CHUNK_BYTES));
    }
    out.push(buf);
    out
}

fn finished_error(stage: &str) -> Error {
    Error::new(ErrorKind::Internal).with_message(format!("{stage} stage already flushed"))
}

/// gzip encoder; output appears whenever the codec decides to emit a block.
pub struct GzipCompress {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipCompress {
    pub fn new() -> Self {
        Self::with_level(Compression::default())
    }

    pub fn with_level(level: Compression) -> Self {
        Self {
            encoder: Some(GzEncoder::new(Vec::new(), level)),
        }
    }
}

impl Default for GzipCompress {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for GzipCompress {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        let encoder = self.encoder.as_mut().ok_or_else(|| finished_error("gzip"))?;
        encoder.write_all(&chunk).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("gzip encoder rejected input")
                .with_source(err)
        })?;
        Ok(split_output(std::mem::take(encoder.get_mut())))
    }

    fn flush(&mut self) -> Result<Vec<Bytes>, Error> {
        let encoder = self.encoder.take().ok_or_else(|| finished_error("gzip"))?;
        let tail = encoder.finish().map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to finish gzip stream")
                .with_source(err)
        })?;
        Ok(split_output(tail))
    }
}

/// gzip decoder; the inverse of `GzipCompress`.
pub struct GzipDecompress {
    decoder: Option<GzDecoder<Vec<u8>>>,
    consumed: u64,
}

impl GzipDecompress {
    pub fn new() -> Self {
        Self {
            decoder: Some(GzDecoder::new(Vec::new())),
            consumed: 0,
        }
    }

    fn corrupt(&self, err: std::io::Error, message: &str) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_message(message)
            .with_offset(self.consumed)
            .with_source(err)
    }
}

impl Default for GzipDecompress {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for GzipDecompress {
    fn name(&self) -> &'static str {
        "gunzip"
    }

    fn transform(&mut self, chunk: Bytes) -> Result<Vec<Bytes>, Error> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(finished_error("gunzip"));
        };
        if let Err(err) = decoder.write_all(&chunk) {
            return Err(self.corrupt(err, "invalid gzip input"));
        }
        let out = std::mem::take(decoder.get_mut());
        self.consumed += chunk.len() as u64;
        Ok(split_output(out))
    }

    fn flush(&mut self) -> Result<Vec<Bytes>, Error> {
        let decoder = self.decoder.take().ok_or_else(|| finished_error("gunzip"))?;
        match decoder.finish() {
            Ok(tail) => Ok(split_output(tail)),
            Err(err) => Err(self.corrupt(err, "truncated gzip input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GzipCompress, GzipDecompress, Identity, Stage, split_output};
    use crate::core::error::ErrorKind;
    use crate::core::source::DEFAULT_CHUNK_BYTES;
    use bytes::Bytes;

    fn run_stage(stage: &mut dyn Stage, input: &[u8], chunk_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for piece in input.chunks(chunk_len.max(1)) {
            for chunk in stage.transform(Bytes::copy_from_slice(piece)).expect("transform") {
                out.extend_from_slice(&chunk);
            }
        }
        for chunk in stage.flush().expect("flush") {
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|i| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                if i % 3 == 0 { b'a' } else { (state & 0xff) as u8 }
            })
            .collect()
    }

    #[test]
    fn identity_passes_chunks_through() {
        let mut stage = Identity;
        let chunk = Bytes::from_static(b"abc");
        assert_eq!(stage.transform(chunk.clone()).expect("transform"), vec![chunk]);
        assert!(stage.flush().expect("flush").is_empty());
    }

    #[test]
    fn gzip_round_trips_across_chunkings() {
        let input = sample(200_000);
        for (compress_chunk, decompress_chunk) in [(1, 7), (4096, 1), (65_536, 333), (300_000, 300_000)] {
            let compressed = run_stage(&mut GzipCompress::new(), &input, compress_chunk);
            assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
            let restored = run_stage(&mut GzipDecompress::new(), &compressed, decompress_chunk);
            assert_eq!(restored, input);
        }
    }

    #[test]
    fn gzip_of_empty_input_is_a_valid_stream() {
        let compressed = run_stage(&mut GzipCompress::new(), b"", 1);
        assert!(!compressed.is_empty());
        let restored = run_stage(&mut GzipDecompress::new(), &compressed, 3);
        assert!(restored.is_empty());
    }

    #[test]
    fn codec_output_is_split_into_bounded_chunks() {
        let chunks = split_output(vec![7u8; 2 * DEFAULT_CHUNK_BYTES + 1]);
        let lens: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![DEFAULT_CHUNK_BYTES, DEFAULT_CHUNK_BYTES, 1]);
        assert!(split_output(Vec::new()).is_empty());
    }

    #[test]
    fn truncated_gzip_fails_on_flush() {
        let compressed = run_stage(&mut GzipCompress::new(), &sample(10_000), 512);
        let truncated = &compressed[..compressed.len() - 4];

        let mut decoder = GzipDecompress::new();
        decoder
            .transform(Bytes::copy_from_slice(truncated))
            .expect("transform");
        let err = decoder.flush().expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn flush_twice_is_rejected() {
        let mut stage = GzipCompress::new();
        stage.flush().expect("flush");
        let err = stage.flush().expect_err("second flush");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
