//! Content-defined chunking.
//!
//! Splits a byte stream into variable-length chunks so that identical
//! content lands on identical chunk boundaries regardless of where it sits
//! in a file — the property byte-level dedup across snapshots depends on.
//!
//! The repository-scoped [`Polynomial`] is generated once at `init` time
//! and stored in the repository [`Config`](crate::config::Config). It is
//! treated as the low 53 coefficients of a degree-53 polynomial over GF(2)
//! (the leading term is implicit, per the "odd" convention enforced by
//! [`Polynomial::random`]); the rolling fingerprint below is that
//! polynomial's actual Rabin fingerprint of the trailing 64-byte window,
//! not an approximation of one.
//!
//! Modeled on the existing chunk-stream shape
//! (`backup::chunk_stream::ChunkStream`, which scans buffers fed to it and
//! returns a boundary offset or `0`/`len` to mean "no boundary yet"/"boundary
//! at the end") and its fixed-size sibling `backup::tools::file_chunker`'s
//! read-then-scan loop, generalized here to the design's variable-size CDC.

use std::io::Read;

use serde::{Deserialize, Serialize};

pub const MIN_CHUNK_SIZE: usize = 512 * 1024;
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;
pub const AVG_CHUNK_SIZE: usize = 1024 * 1024;
const WINDOW_SIZE: usize = 64;

/// Degree of the (implicitly monic) repository polynomial. `Polynomial`
/// stores only the 53 low-order coefficients; bit 53 itself is always 1.
const POLY_DEGREE: u32 = 53;

/// Repository-scoped chunker constant, fixed at `init` and stored verbatim
/// in the repository config. Any two repositories with
/// different polynomials may chunk the same bytes differently; within one
/// repository the chunk sequence for given bytes is stable across the
/// repository's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polynomial(pub u64);

impl Polynomial {
    /// Generate a fresh repository polynomial at `init` time.
    pub fn random() -> Self {
        use rand::RngCore;
        // restrict to 53 bits ("random 53-bit irreducible
        // polynomial"); odd so the low bit (the "1" term) is always set,
        // matching how such polynomials are conventionally represented
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = u64::from_le_bytes(bytes) & ((1u64 << 53) - 1);
        Polynomial(raw | 1)
    }

    /// The degree-53 polynomial this value represents, with the implicit
    /// leading coefficient (bit 53) made explicit.
    fn full(self) -> u64 {
        self.0 | (1u64 << POLY_DEGREE)
    }

    /// Precompute the tables the rolling fingerprint needs: the fully
    /// expanded modulus, and, for every possible byte value, that byte's
    /// contribution when it sits at the most-significant position of a
    /// 64-byte window (i.e. `byte * x^(8*(WINDOW_SIZE-1)) mod full`) — the
    /// term that has to be subtracted out when it slides out of the
    /// window.
    fn fingerprint_tables(self) -> FingerprintTables {
        let full_poly = self.full();
        let shifted_one = pow_x_mod(8 * (WINDOW_SIZE as u32 - 1), full_poly);
        let mut out_table = [0u64; 256];
        for (byte, entry) in out_table.iter_mut().enumerate() {
            *entry = poly_mul_mod(byte as u64, shifted_one, full_poly);
        }
        FingerprintTables { full_poly, out_table }
    }
}

struct FingerprintTables {
    full_poly: u64,
    out_table: [u64; 256],
}

/// Reduce `v` (a GF(2) polynomial of degree < 64) modulo `full_poly` (a
/// polynomial of degree exactly [`POLY_DEGREE`]) down to degree < `POLY_DEGREE`.
fn reduce(mut v: u64, full_poly: u64) -> u64 {
    while v >= (1u64 << POLY_DEGREE) {
        let highest_bit = 63 - v.leading_zeros();
        v ^= full_poly << (highest_bit - POLY_DEGREE);
    }
    v
}

/// `x^exp mod full_poly`, computed by repeated multiply-by-`x`-and-reduce.
fn pow_x_mod(exp: u32, full_poly: u64) -> u64 {
    let mut v: u64 = 1;
    for _ in 0..exp {
        v <<= 1;
        if v & (1u64 << POLY_DEGREE) != 0 {
            v ^= full_poly;
        }
    }
    v
}

/// `a * b mod full_poly` where `a` is a degree-<8 polynomial (a byte) and
/// `b` has degree < [`POLY_DEGREE`].
fn poly_mul_mod(a: u64, b: u64, full_poly: u64) -> u64 {
    let mut result = 0u64;
    for i in 0..8 {
        if (a >> i) & 1 == 1 {
            result ^= b << i;
        }
    }
    reduce(result, full_poly)
}

impl Default for Polynomial {
    fn default() -> Self {
        // used only by tests/fixtures that don't care about a specific
        // repository identity
        Polynomial(0x3DA3358B4DC173)
    }
}

/// Stateful content-defined chunk scanner. Feed it bytes with [`scan`] as
/// they become available (e.g. from a file read loop); it returns the
/// offset of a chunk boundary within the newly fed slice, or `0` if none
/// was found yet.
///
/// Maintains the Rabin fingerprint of the trailing [`WINDOW_SIZE`]-byte
/// window: each incoming byte is shifted in and reduced mod the
/// repository polynomial, and the byte sliding out the back of the window
/// has its weighted contribution subtracted back out via `out_table`, so
/// the digest always reflects exactly the last 64 bytes seen, not the
/// whole stream.
#[derive(Clone)]
pub struct Chunker {
    full_poly: u64,
    out_table: [u64; 256],
    min_size: usize,
    max_size: usize,
    mask: u64,
    digest: u64,
    window: [u8; WINDOW_SIZE],
    window_pos: usize,
    window_filled: usize,
    current_size: usize,
}

impl Chunker {
    pub fn new(polynomial: Polynomial) -> Self {
        Self::with_bounds(polynomial, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, AVG_CHUNK_SIZE)
    }

    pub fn with_bounds(
        polynomial: Polynomial,
        min_size: usize,
        max_size: usize,
        avg_size: usize,
    ) -> Self {
        let bits = avg_size.trailing_zeros().max(1);
        let tables = polynomial.fingerprint_tables();
        Chunker {
            full_poly: tables.full_poly,
            out_table: tables.out_table,
            min_size,
            max_size,
            mask: (1u64 << bits) - 1,
            digest: 0,
            window: [0u8; WINDOW_SIZE],
            window_pos: 0,
            window_filled: 0,
            current_size: 0,
        }
    }

    /// Feed `data`, return the offset of a chunk boundary within it, `0` if
    /// no boundary was found (the caller should buffer `data` and keep
    /// scanning), or `data.len()` if the boundary falls exactly at the end.
    pub fn scan(&mut self, data: &[u8]) -> usize {
        for (i, &byte) in data.iter().enumerate() {
            self.current_size += 1;

            if self.window_filled == WINDOW_SIZE {
                let leaving = self.window[self.window_pos];
                self.digest ^= self.out_table[leaving as usize];
            } else {
                self.window_filled += 1;
            }
            self.digest = reduce((self.digest << 8) | byte as u64, self.full_poly);
            self.window[self.window_pos] = byte;
            self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;

            if self.current_size >= self.max_size {
                self.reset();
                return i + 1;
            }
            if self.current_size >= self.min_size
                && self.window_filled == WINDOW_SIZE
                && (self.digest & self.mask) == 0
            {
                self.reset();
                return i + 1;
            }
        }
        0
    }

    fn reset(&mut self) {
        self.digest = 0;
        self.window = [0u8; WINDOW_SIZE];
        self.window_pos = 0;
        self.window_filled = 0;
        self.current_size = 0;
    }

    /// Split an in-memory buffer into chunks in one call — used by tests
    /// and by small in-memory objects (e.g. tree blobs, which are never
    /// larger than a few MiB and are chunked as a single unit anyway by
    /// virtue of being stored as one tree blob, not content-chunked data).
    pub fn chunk_all(polynomial: Polynomial, data: &[u8]) -> Vec<std::ops::Range<usize>> {
        let mut chunker = Chunker::new(polynomial);
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        while offset < data.len() {
            let boundary = chunker.scan(&data[offset..]);
            if boundary == 0 {
                offset = data.len();
                continue;
            }
            offset += boundary;
            ranges.push(start..offset);
            start = offset;
        }
        if start < data.len() {
            ranges.push(start..data.len());
        }
        ranges
    }
}

/// Pull chunks out of a [`Read`] source, the shape the archiver ingest
/// pipeline drives: one file at a time, streamed rather than
/// loaded wholesale into memory.
pub struct ChunkReader<R> {
    reader: R,
    chunker: Chunker,
    read_buf: Vec<u8>,
    pending: Vec<u8>,
    eof: bool,
}

const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, polynomial: Polynomial) -> Self {
        ChunkReader {
            reader,
            chunker: Chunker::new(polynomial),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            pending: Vec::with_capacity(AVG_CHUNK_SIZE),
            eof: false,
        }
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.pending.is_empty() {
                let boundary = self.chunker.scan(&self.pending);
                if boundary != 0 {
                    let rest = self.pending.split_off(boundary);
                    let chunk = std::mem::replace(&mut self.pending, rest);
                    return Some(Ok(chunk));
                }
            }

            if self.eof {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.pending)));
            }

            match self.reader.read(&mut self.read_buf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.pending.extend_from_slice(&self.read_buf[..n]),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
