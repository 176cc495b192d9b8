//! Byte encoding of role-to-role messages. Everything crossing a `Transport` is a `bincode`
//! payload; bulk grid data travels as flat f64 vectors.

use bincode::{Decode, Encode, config};
use rustfft::num_complex::Complex;

use crate::PmeError;

pub(crate) fn encode<T: Encode>(val: &T) -> Result<Vec<u8>, PmeError> {
    bincode::encode_to_vec(val, config::standard()).map_err(|e| PmeError::Codec(e.to_string()))
}

pub(crate) fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, PmeError> {
    let (val, len) = bincode::decode_from_slice(bytes, config::standard())
        .map_err(|e| PmeError::Codec(e.to_string()))?;

    if len != bytes.len() {
        return Err(PmeError::Codec(format!(
            "{} trailing bytes after message",
            bytes.len() - len
        )));
    }
    Ok(val)
}

pub(crate) fn encode_f64s(v: &[f64]) -> Result<Vec<u8>, PmeError> {
    encode(&v)
}

pub(crate) fn decode_f64s(bytes: &[u8]) -> Result<Vec<f64>, PmeError> {
    decode(bytes)
}

/// Interleave re, im.
pub(crate) fn pack_complex(src: &[Complex<f64>], dest: &mut Vec<f64>) {
    dest.reserve(2 * src.len());
    for c in src {
        dest.push(c.re);
        dest.push(c.im);
    }
}

pub(crate) fn unpack_complex(src: &[f64]) -> Result<Vec<Complex<f64>>, PmeError> {
    if !src.len().is_multiple_of(2) {
        return Err(PmeError::Codec(
            "Complex payload has an odd number of values".to_owned(),
        ));
    }
    Ok(src
        .chunks_exact(2)
        .map(|c| Complex::new(c[0], c[1]))
        .collect())
}
