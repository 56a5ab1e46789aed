//! Sample conversion between user and device buffer shapes.
//!
//! One block of frames is moved between two byte regions whose sample
//! format, channel routing and layout may all differ. Strides and offsets
//! are expressed in samples rather than bytes, which lets interleaved and
//! planar layouts share a single implementation: an interleaved region uses
//! a stride equal to its channel count, a planar region uses a stride of
//! one with per-channel base offsets spaced a block apart.
//!
//! Nothing here allocates or blocks; every function operates on
//! caller-supplied spans and is safe to run on the audio thread.

use dasp_sample::{FromSample, Sample, I24};

use crate::SampleFormat;

/// Precomputed routing table for one direction of one stream side.
///
/// Built once at open time, consumed once per callback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ConvertInfo {
    /// Channels moved per block: the smaller of the two regions' counts.
    pub channels: usize,
    /// Sample stride between consecutive frames of one channel in the
    /// source region.
    pub in_jump: usize,
    /// Sample stride between consecutive frames of one channel in the
    /// destination region.
    pub out_jump: usize,
    pub in_format: SampleFormat,
    pub out_format: SampleFormat,
    /// Per-channel base offset into the source region, in samples.
    pub in_offset: Vec<usize>,
    /// Per-channel base offset into the destination region, in samples.
    pub out_offset: Vec<usize>,
}

/// A sample type that knows how to move itself through a raw byte region.
///
/// `index` is in samples; the packed 24-bit carrier occupies three bytes
/// per sample and is always little-endian, everything else is native
/// byte order.
pub(crate) trait RawSample: Sample + Copy {
    const BYTES: usize;
    fn read(bytes: &[u8], index: usize) -> Self;
    fn write(self, bytes: &mut [u8], index: usize);
}

macro_rules! impl_raw_sample {
    ($($ty:ty),*) => {
        $(
            impl RawSample for $ty {
                const BYTES: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read(bytes: &[u8], index: usize) -> Self {
                    let at = index * Self::BYTES;
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[at..at + Self::BYTES]);
                    <$ty>::from_ne_bytes(raw)
                }

                #[inline]
                fn write(self, bytes: &mut [u8], index: usize) {
                    let at = index * Self::BYTES;
                    bytes[at..at + Self::BYTES].copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_raw_sample!(i8, i16, i32, f32, f64);

impl RawSample for I24 {
    const BYTES: usize = 3;

    #[inline]
    fn read(bytes: &[u8], index: usize) -> Self {
        let at = index * 3;
        let wide = i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], 0]);
        // Sign-extend the packed 24 bits.
        I24::new_unchecked(wide << 8 >> 8)
    }

    #[inline]
    fn write(self, bytes: &mut [u8], index: usize) {
        let at = index * 3;
        let raw = self.inner().to_le_bytes();
        bytes[at..at + 3].copy_from_slice(&raw[..3]);
    }
}

fn convert<S, D>(out: &mut [u8], inp: &[u8], info: &ConvertInfo, frames: usize)
where
    S: RawSample,
    D: RawSample + FromSample<S>,
{
    for ch in 0..info.channels {
        let mut at_in = info.in_offset[ch];
        let mut at_out = info.out_offset[ch];
        for _ in 0..frames {
            let sample = S::read(inp, at_in);
            sample.to_sample::<D>().write(out, at_out);
            at_in += info.in_jump;
            at_out += info.out_jump;
        }
    }
}

/// Moves one block of `frames` frames from `inp` to `out` according to
/// `info`, converting the sample format of each routed sample with
/// canonical scaling (integer full-scale <-> `[-1.0, 1.0]`).
pub(crate) fn convert_buffer(out: &mut [u8], inp: &[u8], info: &ConvertInfo, frames: usize) {
    use SampleFormat::*;
    match (info.in_format, info.out_format) {
        (S8, S8) => convert::<i8, i8>(out, inp, info, frames),
        (S8, S16) => convert::<i8, i16>(out, inp, info, frames),
        (S8, S24) => convert::<i8, I24>(out, inp, info, frames),
        (S8, S32) => convert::<i8, i32>(out, inp, info, frames),
        (S8, F32) => convert::<i8, f32>(out, inp, info, frames),
        (S8, F64) => convert::<i8, f64>(out, inp, info, frames),
        (S16, S8) => convert::<i16, i8>(out, inp, info, frames),
        (S16, S16) => convert::<i16, i16>(out, inp, info, frames),
        (S16, S24) => convert::<i16, I24>(out, inp, info, frames),
        (S16, S32) => convert::<i16, i32>(out, inp, info, frames),
        (S16, F32) => convert::<i16, f32>(out, inp, info, frames),
        (S16, F64) => convert::<i16, f64>(out, inp, info, frames),
        (S24, S8) => convert::<I24, i8>(out, inp, info, frames),
        (S24, S16) => convert::<I24, i16>(out, inp, info, frames),
        (S24, S24) => convert::<I24, I24>(out, inp, info, frames),
        (S24, S32) => convert::<I24, i32>(out, inp, info, frames),
        (S24, F32) => convert::<I24, f32>(out, inp, info, frames),
        (S24, F64) => convert::<I24, f64>(out, inp, info, frames),
        (S32, S8) => convert::<i32, i8>(out, inp, info, frames),
        (S32, S16) => convert::<i32, i16>(out, inp, info, frames),
        (S32, S24) => convert::<i32, I24>(out, inp, info, frames),
        (S32, S32) => convert::<i32, i32>(out, inp, info, frames),
        (S32, F32) => convert::<i32, f32>(out, inp, info, frames),
        (S32, F64) => convert::<i32, f64>(out, inp, info, frames),
        (F32, S8) => convert::<f32, i8>(out, inp, info, frames),
        (F32, S16) => convert::<f32, i16>(out, inp, info, frames),
        (F32, S24) => convert::<f32, I24>(out, inp, info, frames),
        (F32, S32) => convert::<f32, i32>(out, inp, info, frames),
        (F32, F32) => convert::<f32, f32>(out, inp, info, frames),
        (F32, F64) => convert::<f32, f64>(out, inp, info, frames),
        (F64, S8) => convert::<f64, i8>(out, inp, info, frames),
        (F64, S16) => convert::<f64, i16>(out, inp, info, frames),
        (F64, S24) => convert::<f64, I24>(out, inp, info, frames),
        (F64, S32) => convert::<f64, i32>(out, inp, info, frames),
        (F64, F32) => convert::<f64, f32>(out, inp, info, frames),
        (F64, F64) => convert::<f64, f64>(out, inp, info, frames),
    }
}

/// Reverses the byte order of every sample in `bytes`.
///
/// Applied to device-side buffers when the device reports the opposite
/// endianness from the host. Swapping twice restores the original bytes.
pub(crate) fn byte_swap_buffer(bytes: &mut [u8], format: SampleFormat) {
    let width = format.sample_size();
    if width < 2 {
        return;
    }
    for sample in bytes.chunks_exact_mut(width) {
        sample.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_info(channels: usize, in_format: SampleFormat, out_format: SampleFormat) -> ConvertInfo {
        ConvertInfo {
            channels,
            in_jump: channels,
            out_jump: channels,
            in_format,
            out_format,
            in_offset: (0..channels).collect(),
            out_offset: (0..channels).collect(),
        }
    }

    fn as_bytes<T: RawSample>(samples: &[T]) -> Vec<u8> {
        let mut bytes = vec![0u8; samples.len() * T::BYTES];
        for (index, sample) in samples.iter().enumerate() {
            sample.write(&mut bytes, index);
        }
        bytes
    }

    fn from_bytes<T: RawSample>(bytes: &[u8]) -> Vec<T> {
        (0..bytes.len() / T::BYTES)
            .map(|index| T::read(bytes, index))
            .collect()
    }

    #[test]
    fn s16_to_f32_full_scale() {
        let inp = as_bytes(&[i16::MAX, 0, i16::MIN, 0]);
        let mut out = vec![0u8; 4 * 4];
        let info = identity_info(1, SampleFormat::S16, SampleFormat::F32);
        convert_buffer(&mut out, &inp, &info, 4);
        let result = from_bytes::<f32>(&out);
        assert!((result[0] - 1.0).abs() < 1.0 / 32768.0);
        assert_eq!(result[1], 0.0);
        assert_eq!(result[2], -1.0);
        assert_eq!(result[3], 0.0);
    }

    #[test]
    fn widening_round_trips_are_exact() {
        let source: Vec<i16> = vec![i16::MIN, -12345, -1, 0, 1, 9876, i16::MAX];
        let frames = source.len();
        let inp = as_bytes(&source);
        let info_up = identity_info(1, SampleFormat::S16, SampleFormat::S32);
        let info_down = identity_info(1, SampleFormat::S32, SampleFormat::S16);

        let mut wide = vec![0u8; frames * 4];
        convert_buffer(&mut wide, &inp, &info_up, frames);
        let mut back = vec![0u8; frames * 2];
        convert_buffer(&mut back, &wide, &info_down, frames);
        assert_eq!(from_bytes::<i16>(&back), source);

        // Through f32 as well: every i16 is exactly representable.
        let info_up = identity_info(1, SampleFormat::S16, SampleFormat::F32);
        let info_down = identity_info(1, SampleFormat::F32, SampleFormat::S16);
        let mut float = vec![0u8; frames * 4];
        convert_buffer(&mut float, &inp, &info_up, frames);
        let mut back = vec![0u8; frames * 2];
        convert_buffer(&mut back, &float, &info_down, frames);
        assert_eq!(from_bytes::<i16>(&back), source);
    }

    #[test]
    fn s8_survives_s16() {
        let source: Vec<i8> = vec![i8::MIN, -5, 0, 5, i8::MAX];
        let frames = source.len();
        let inp = as_bytes(&source);
        let mut wide = vec![0u8; frames * 2];
        convert_buffer(
            &mut wide,
            &inp,
            &identity_info(1, SampleFormat::S8, SampleFormat::S16),
            frames,
        );
        let mut back = vec![0u8; frames];
        convert_buffer(
            &mut back,
            &wide,
            &identity_info(1, SampleFormat::S16, SampleFormat::S8),
            frames,
        );
        assert_eq!(from_bytes::<i8>(&back), source);
    }

    #[test]
    fn packed_24_bit_is_little_endian_and_signed() {
        let mut bytes = vec![0u8; 6];
        I24::new_unchecked(0x0203_04).write(&mut bytes, 0);
        I24::new_unchecked(-1).write(&mut bytes, 1);
        assert_eq!(&bytes[..3], &[0x04, 0x03, 0x02]);
        assert_eq!(&bytes[3..], &[0xff, 0xff, 0xff]);
        assert_eq!(I24::read(&bytes, 0).inner(), 0x0203_04);
        assert_eq!(I24::read(&bytes, 1).inner(), -1);
    }

    #[test]
    fn s24_to_s32_scales_by_shift() {
        let mut inp = vec![0u8; 3];
        I24::new_unchecked(1 << 22).write(&mut inp, 0);
        let mut out = vec![0u8; 4];
        convert_buffer(
            &mut out,
            &inp,
            &identity_info(1, SampleFormat::S24, SampleFormat::S32),
            1,
        );
        assert_eq!(from_bytes::<i32>(&out)[0], 1 << 30);
    }

    #[test]
    fn interleaved_to_planar_routing() {
        // Two channels, three frames: [l0 r0 l1 r1 l2 r2] -> [l0 l1 l2][r0 r1 r2].
        let inp = as_bytes(&[10i16, 20, 11, 21, 12, 22]);
        let mut out = vec![0u8; 6 * 2];
        let info = ConvertInfo {
            channels: 2,
            in_jump: 2,
            out_jump: 1,
            in_format: SampleFormat::S16,
            out_format: SampleFormat::S16,
            in_offset: vec![0, 1],
            out_offset: vec![0, 3],
        };
        convert_buffer(&mut out, &inp, &info, 3);
        assert_eq!(from_bytes::<i16>(&out), vec![10, 11, 12, 20, 21, 22]);
    }

    #[test]
    fn first_channel_offset_picks_a_device_slice() {
        // Four interleaved device channels; route channels 2..4 to a stereo
        // user buffer.
        let inp = as_bytes(&[0i16, 1, 2, 3, 10, 11, 12, 13]);
        let mut out = vec![0u8; 4 * 2];
        let info = ConvertInfo {
            channels: 2,
            in_jump: 4,
            out_jump: 2,
            in_format: SampleFormat::S16,
            out_format: SampleFormat::S16,
            in_offset: vec![2, 3],
            out_offset: vec![0, 1],
        };
        convert_buffer(&mut out, &inp, &info, 2);
        assert_eq!(from_bytes::<i16>(&out), vec![2, 3, 12, 13]);
    }

    #[test]
    fn byte_swap_is_an_involution() {
        let source = as_bytes(&[0x0102i16, 0x0304, -2]);
        let mut swapped = source.clone();
        byte_swap_buffer(&mut swapped, SampleFormat::S16);
        assert_ne!(swapped, source);
        assert_eq!(swapped[0], source[1]);
        assert_eq!(swapped[1], source[0]);
        byte_swap_buffer(&mut swapped, SampleFormat::S16);
        assert_eq!(swapped, source);
    }
}
