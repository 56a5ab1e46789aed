//! Audio sample format types.
//!
//! # Byte order
//!
//! Multi-byte sample formats use the native endianness of the target
//! platform, with one exception: the packed 24-bit format is always three
//! little-endian bytes. When a device reports the opposite byte order, the
//! stream engine swaps the device-side buffer as part of the conversion
//! pass.

use std::{fmt::Display, mem};

pub use dasp_sample::{FromSample, Sample};

/// 24-bit signed integer sample arithmetic type.
///
/// Represents 24-bit audio with range `-(1 << 23)..=((1 << 23) - 1)`. Note
/// that this is the *arithmetic* carrier for [`SampleFormat::S24`]; on the
/// wire that format occupies three packed bytes, not four.
pub use dasp_sample::I24;

/// Format of a single sample in a stream buffer.
///
/// The stream engine accepts any pairing of a user format and a device
/// format and converts between them on the audio thread, so the format a
/// client asks for does not need to be one the device can produce natively.
/// Integer formats are full-scale symmetric; float formats cover
/// `-1.0..=1.0` with `0.0` as the origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum SampleFormat {
    /// `i8` with a valid range of `i8::MIN..=i8::MAX` with `0` being the origin.
    #[default]
    S8,

    /// `i16` with a valid range of `i16::MIN..=i16::MAX` with `0` being the origin.
    S16,

    /// Packed 24-bit signed integer, three little-endian bytes per sample,
    /// with a valid range of `-(1 << 23)..=((1 << 23) - 1)` and `0` being
    /// the origin.
    S24,

    /// `i32` with a valid range of `i32::MIN..=i32::MAX` with `0` being the origin.
    S32,

    /// `f32` with a valid range of `-1.0..=1.0` with `0.0` being the origin.
    F32,

    /// `f64` with a valid range of `-1.0..=1.0` with `0.0` being the origin.
    F64,
}

impl SampleFormat {
    /// Returns the size in bytes one sample of this format occupies in a
    /// stream buffer. The packed 24-bit format occupies three bytes.
    #[inline]
    #[must_use]
    pub fn sample_size(&self) -> usize {
        match *self {
            SampleFormat::S8 => mem::size_of::<i8>(),
            SampleFormat::S16 => mem::size_of::<i16>(),
            SampleFormat::S24 => 3,
            SampleFormat::S32 => mem::size_of::<i32>(),
            SampleFormat::F32 => mem::size_of::<f32>(),
            SampleFormat::F64 => mem::size_of::<f64>(),
        }
    }

    /// Returns the number of significant bits in a sample of this format.
    #[inline]
    #[must_use]
    pub fn bits_per_sample(&self) -> u32 {
        match *self {
            SampleFormat::S8 => i8::BITS,
            SampleFormat::S16 => i16::BITS,
            SampleFormat::S24 => 24,
            SampleFormat::S32 => i32::BITS,
            SampleFormat::F32 => 32,
            SampleFormat::F64 => 64,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_int(&self) -> bool {
        matches!(
            *self,
            SampleFormat::S8 | SampleFormat::S16 | SampleFormat::S24 | SampleFormat::S32
        )
    }

    #[inline]
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(*self, SampleFormat::F32 | SampleFormat::F64)
    }
}

impl Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            SampleFormat::S8 => "s8",
            SampleFormat::S16 => "s16",
            SampleFormat::S24 => "s24",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        }
        .fmt(f)
    }
}

/// A [`Sample`] type with a known corresponding [`SampleFormat`].
///
/// Implemented for the primitive sample types a stream buffer can be viewed
/// as. The packed 24-bit format has no primitive carrier and is reached
/// through the byte accessors of [`Samples`](crate::Samples) instead.
pub trait SizedSample: Sample {
    /// The corresponding [`SampleFormat`] for this sample type.
    const FORMAT: SampleFormat;
}

impl SizedSample for i8 {
    const FORMAT: SampleFormat = SampleFormat::S8;
}

impl SizedSample for i16 {
    const FORMAT: SampleFormat = SampleFormat::S16;
}

impl SizedSample for i32 {
    const FORMAT: SampleFormat = SampleFormat::S32;
}

impl SizedSample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
}

impl SizedSample for f64 {
    const FORMAT: SampleFormat = SampleFormat::F64;
}
