//! Sample format conversion to and from 32-bit float.
//!
//! Converters are plain function pointers picked once per stream, so the
//! producer path does a single indirect call per block.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use cadence_core::DataFormat;

/// Convert encoded samples to float. Returns the number of samples written.
pub type ToFloatFn = fn(input: &[u8], output: &mut [f32]) -> usize;

/// Convert float samples to an encoding. Returns the number of bytes written.
pub type FromFloatFn = fn(input: &[f32], output: &mut [u8]) -> usize;

const I8_SCALE: f32 = 128.0;
const I16_SCALE: f32 = 32768.0;
const I24_SCALE: f32 = 8_388_608.0;
const I32_SCALE: f64 = 2_147_483_648.0;

/// Select the routine decoding `format` into float samples.
///
/// Returns `None` for passthrough bitstreams, which are never converted.
pub fn to_float(format: DataFormat) -> Option<ToFloatFn> {
    let convert: ToFloatFn = match format.resolve_native() {
        DataFormat::U8 => u8_to_float,
        DataFormat::S8 => s8_to_float,
        DataFormat::S16Le => s16le_to_float,
        DataFormat::S16Be => s16be_to_float,
        DataFormat::S24Le3 => s24le3_to_float,
        DataFormat::S24Be3 => s24be3_to_float,
        DataFormat::S24Le4 => s24le4_to_float,
        DataFormat::S24Be4 => s24be4_to_float,
        DataFormat::S32Le => s32le_to_float,
        DataFormat::S32Be => s32be_to_float,
        DataFormat::Float => float_to_float,
        DataFormat::Double => double_to_float,
        _ => return None,
    };
    Some(convert)
}

/// Select the routine encoding float samples as `format`.
pub fn from_float(format: DataFormat) -> Option<FromFloatFn> {
    let convert: FromFloatFn = match format.resolve_native() {
        DataFormat::U8 => float_to_u8,
        DataFormat::S16Le => float_to_s16le,
        DataFormat::S16Be => float_to_s16be,
        DataFormat::S24Le3 => float_to_s24le3,
        DataFormat::S24Le4 => float_to_s24le4,
        DataFormat::S32Le => float_to_s32le,
        DataFormat::S32Be => float_to_s32be,
        DataFormat::Float => float_to_bytes,
        _ => return None,
    };
    Some(convert)
}

/// Reinterpret a byte block of native-endian floats.
pub fn bytes_to_floats(input: &[u8], output: &mut [f32]) -> usize {
    float_to_float(input, output)
}

/// Write floats as native-endian bytes.
pub fn floats_to_bytes(input: &[f32], output: &mut [u8]) -> usize {
    float_to_bytes(input, output)
}

fn convert_chunks<const N: usize>(
    input: &[u8],
    output: &mut [f32],
    decode: impl Fn([u8; N]) -> f32,
) -> usize {
    let mut count = 0;
    for (chunk, out) in input.chunks_exact(N).zip(output.iter_mut()) {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(chunk);
        *out = decode(bytes);
        count += 1;
    }
    count
}

fn encode_chunks<const N: usize>(
    input: &[f32],
    output: &mut [u8],
    encode: impl Fn(f32) -> [u8; N],
) -> usize {
    let mut count = 0;
    for (sample, chunk) in input.iter().zip(output.chunks_exact_mut(N)) {
        chunk.copy_from_slice(&encode(sample.clamp(-1.0, 1.0)));
        count += N;
    }
    count
}

fn u8_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<1>(input, output, |b| (f32::from(b[0]) - I8_SCALE) / I8_SCALE)
}

fn s8_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<1>(input, output, |b| f32::from(i8::from_ne_bytes(b)) / I8_SCALE)
}

fn s16le_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<2>(input, output, |b| f32::from(i16::from_le_bytes(b)) / I16_SCALE)
}

fn s16be_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<2>(input, output, |b| f32::from(i16::from_be_bytes(b)) / I16_SCALE)
}

#[allow(clippy::cast_precision_loss)]
fn s24le3_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<3>(input, output, |b| {
        (i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8) as f32 / I24_SCALE
    })
}

#[allow(clippy::cast_precision_loss)]
fn s24be3_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<3>(input, output, |b| {
        (i32::from_be_bytes([b[0], b[1], b[2], 0]) >> 8) as f32 / I24_SCALE
    })
}

#[allow(clippy::cast_precision_loss)]
fn s24le4_to_float(input: &[u8], output: &mut [f32]) -> usize {
    // 24 significant bits in the low three bytes
    convert_chunks::<4>(input, output, |b| {
        ((i32::from_le_bytes(b) << 8) >> 8) as f32 / I24_SCALE
    })
}

#[allow(clippy::cast_precision_loss)]
fn s24be4_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<4>(input, output, |b| {
        ((i32::from_be_bytes(b) << 8) >> 8) as f32 / I24_SCALE
    })
}

fn s32le_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<4>(input, output, |b| {
        (f64::from(i32::from_le_bytes(b)) / I32_SCALE) as f32
    })
}

fn s32be_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<4>(input, output, |b| {
        (f64::from(i32::from_be_bytes(b)) / I32_SCALE) as f32
    })
}

fn float_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<4>(input, output, f32::from_ne_bytes)
}

fn double_to_float(input: &[u8], output: &mut [f32]) -> usize {
    convert_chunks::<8>(input, output, |b| f64::from_ne_bytes(b) as f32)
}

fn float_to_u8(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<1>(input, output, |s| {
        [(s * 127.0 + I8_SCALE).round().clamp(0.0, 255.0) as u8]
    })
}

fn float_to_s16le(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<2>(input, output, |s| ((s * 32767.0).round() as i16).to_le_bytes())
}

fn float_to_s16be(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<2>(input, output, |s| ((s * 32767.0).round() as i16).to_be_bytes())
}

fn float_to_s24le3(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<3>(input, output, |s| {
        let v = ((s * 8_388_607.0).round() as i32).to_le_bytes();
        [v[0], v[1], v[2]]
    })
}

fn float_to_s24le4(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<4>(input, output, |s| ((s * 8_388_607.0).round() as i32).to_le_bytes())
}

fn float_to_s32le(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<4>(input, output, |s| {
        ((f64::from(s) * 2_147_483_647.0).round() as i32).to_le_bytes()
    })
}

fn float_to_s32be(input: &[f32], output: &mut [u8]) -> usize {
    encode_chunks::<4>(input, output, |s| {
        ((f64::from(s) * 2_147_483_647.0).round() as i32).to_be_bytes()
    })
}

fn float_to_bytes(input: &[f32], output: &mut [u8]) -> usize {
    let mut count = 0;
    for (sample, chunk) in input.iter().zip(output.chunks_exact_mut(4)) {
        chunk.copy_from_slice(&sample.to_ne_bytes());
        count += 4;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_every_pcm_format_has_a_converter() {
        for format in DataFormat::PCM {
            assert!(to_float(format).is_some(), "{format} has no converter");
        }
        assert!(to_float(DataFormat::Ac3).is_none());
        assert!(to_float(DataFormat::TrueHd).is_none());
    }

    #[test]
    fn test_u8_midpoint_is_silence() {
        let convert = to_float(DataFormat::U8).unwrap();
        let mut out = [1.0f32; 3];
        assert_eq!(convert(&[128, 0, 255], &mut out), 3);
        assert!(approx(out[0], 0.0));
        assert!(approx(out[1], -1.0));
        assert!(out[2] > 0.99);
    }

    #[test]
    fn test_s16_endianness() {
        let mut out = [0.0f32; 1];
        to_float(DataFormat::S16Le).unwrap()(&[0x00, 0x40], &mut out);
        assert!(approx(out[0], 0.5));
        to_float(DataFormat::S16Be).unwrap()(&[0x40, 0x00], &mut out);
        assert!(approx(out[0], 0.5));
        to_float(DataFormat::S16Le).unwrap()(&[0x00, 0x80], &mut out);
        assert!(approx(out[0], -1.0));
    }

    #[test]
    fn test_s24_sign_extension() {
        let mut out = [0.0f32; 1];
        to_float(DataFormat::S24Le3).unwrap()(&[0x00, 0x00, 0xC0], &mut out);
        assert!(approx(out[0], -0.5));
        to_float(DataFormat::S24Be3).unwrap()(&[0x40, 0x00, 0x00], &mut out);
        assert!(approx(out[0], 0.5));
        to_float(DataFormat::S24Le4).unwrap()(&[0x00, 0x00, 0xC0, 0x00], &mut out);
        assert!(approx(out[0], -0.5));
    }

    #[test]
    fn test_s32_and_double() {
        let mut out = [0.0f32; 1];
        to_float(DataFormat::S32Le).unwrap()(&i32::MIN.to_le_bytes(), &mut out);
        assert!(approx(out[0], -1.0));
        to_float(DataFormat::Double).unwrap()(&0.25f64.to_ne_bytes(), &mut out);
        assert!(approx(out[0], 0.25));
    }

    #[test]
    fn test_output_bounded_by_buffer() {
        let convert = to_float(DataFormat::S16Le).unwrap();
        let mut out = [0.0f32; 2];
        assert_eq!(convert(&[0u8; 16], &mut out), 2);
    }

    #[test]
    fn test_float_round_trip_through_s16() {
        let input = [0.0f32, 0.5, -0.5, 1.0, -1.0];
        let mut bytes = [0u8; 10];
        assert_eq!(from_float(DataFormat::S16Le).unwrap()(&input, &mut bytes), 10);

        let mut back = [0.0f32; 5];
        to_float(DataFormat::S16Le).unwrap()(&bytes, &mut back);
        for (a, b) in input.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_from_float_clips() {
        let mut bytes = [0u8; 2];
        from_float(DataFormat::S16Le).unwrap()(&[4.0], &mut bytes);
        assert_eq!(i16::from_le_bytes(bytes), i16::MAX);
    }
}
