//! Typed samples and their byte encodings.

use std::fmt::Debug;

use crate::format::SampleType;

/// A sample type that can be read from and written to native buffer memory.
pub trait Sample: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const TYPE: SampleType;

    /// Decodes one sample. `bytes` is exactly `TYPE.size()` long.
    fn read(bytes: &[u8]) -> Self;

    /// Encodes one sample. `bytes` is exactly `TYPE.size()` long.
    fn write(self, bytes: &mut [u8]);

    /// Converts from a normalized value in `[-1.0, 1.0]`, clamping out-of-range input.
    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;
}

/// 24-bit signed integer sample, stored sign-extended in an `i32`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct I24(i32);

impl I24 {
    pub const MIN: I24 = I24(-(1 << 23));
    pub const MAX: I24 = I24((1 << 23) - 1);

    /// Saturates values outside the 24-bit range.
    pub fn new(value: i32) -> I24 {
        I24(value.clamp(Self::MIN.0, Self::MAX.0))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

macro_rules! impl_int_sample {
    ($ty:ty, $variant:ident, $scale:expr, $offset:expr) => {
        impl Sample for $ty {
            const TYPE: SampleType = SampleType::$variant;

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }

            fn from_f64(value: f64) -> Self {
                let scaled = (value.clamp(-1.0, 1.0) * $scale).round() + $offset;
                scaled.clamp(<$ty>::MIN as f64, <$ty>::MAX as f64) as $ty
            }

            fn to_f64(self) -> f64 {
                (self as f64 - $offset) / $scale
            }
        }
    };
}

impl_int_sample!(u8, U8, 128.0, 128.0);
impl_int_sample!(i8, I8, 128.0, 0.0);
impl_int_sample!(i16, I16, 32768.0, 0.0);
impl_int_sample!(i32, I32, 2147483648.0, 0.0);

impl Sample for I24 {
    const TYPE: SampleType = SampleType::I24;

    fn read(bytes: &[u8]) -> Self {
        // Place the three bytes in the top of an i32, then shift back to sign-extend.
        let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]);
        I24(raw >> 8)
    }

    fn write(self, bytes: &mut [u8]) {
        let raw = self.0.to_le_bytes();
        bytes.copy_from_slice(&raw[..3]);
    }

    fn from_f64(value: f64) -> Self {
        I24::new((value.clamp(-1.0, 1.0) * 8388608.0).round() as i32)
    }

    fn to_f64(self) -> f64 {
        self.0 as f64 / 8388608.0
    }
}

impl Sample for f32 {
    const TYPE: SampleType = SampleType::F32;

    fn read(bytes: &[u8]) -> Self {
        let mut raw = [0; 4];
        raw.copy_from_slice(bytes);
        f32::from_ne_bytes(raw)
    }

    fn write(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_ne_bytes());
    }

    fn from_f64(value: f64) -> Self {
        value.clamp(-1.0, 1.0) as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Sample for f64 {
    const TYPE: SampleType = SampleType::F64;

    fn read(bytes: &[u8]) -> Self {
        let mut raw = [0; 8];
        raw.copy_from_slice(bytes);
        f64::from_ne_bytes(raw)
    }

    fn write(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_ne_bytes());
    }

    fn from_f64(value: f64) -> Self {
        value.clamp(-1.0, 1.0)
    }

    fn to_f64(self) -> f64 {
        self
    }
}

/// Writes the encoding of silence for `sample` into `bytes`, which may hold several samples.
pub fn fill_silence(sample: SampleType, bytes: &mut [u8]) {
    match sample {
        SampleType::U8 => bytes.fill(128),
        _ => bytes.fill(0),
    }
}

/// Encodes a normalized value as `sample` into `bytes`.
pub fn encode(sample: SampleType, value: f64, bytes: &mut [u8]) {
    match sample {
        SampleType::U8 => u8::from_f64(value).write(bytes),
        SampleType::I8 => i8::from_f64(value).write(bytes),
        SampleType::I16 => i16::from_f64(value).write(bytes),
        SampleType::I24 => I24::from_f64(value).write(bytes),
        SampleType::I32 => i32::from_f64(value).write(bytes),
        SampleType::F32 => f32::from_f64(value).write(bytes),
        SampleType::F64 => f64::from_f64(value).write(bytes),
    }
}

/// Decodes one `sample` from `bytes` into a normalized value.
pub fn decode(sample: SampleType, bytes: &[u8]) -> f64 {
    match sample {
        SampleType::U8 => u8::read(bytes).to_f64(),
        SampleType::I8 => i8::read(bytes).to_f64(),
        SampleType::I16 => i16::read(bytes).to_f64(),
        SampleType::I24 => I24::read(bytes).to_f64(),
        SampleType::I32 => i32::read(bytes).to_f64(),
        SampleType::F32 => f32::read(bytes).to_f64(),
        SampleType::F64 => f64::read(bytes).to_f64(),
    }
}
