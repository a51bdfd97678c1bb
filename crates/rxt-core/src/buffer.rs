use bumpalo::Bump;

use crate::format::SampleType;
use crate::sample::fill_silence;

/// Shape of native sample memory in one direction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Layout {
    pub channels: usize,
    /// Bytes per sample.
    pub sample_size: usize,
}

impl Layout {
    pub fn frame_size(&self) -> usize {
        self.channels * self.sample_size
    }
}

/// Native input memory for one period.
#[derive(Debug, Clone, Copy)]
pub enum NativeInput<'a> {
    /// `frames * channels` samples, cycling through channels.
    Interleaved(&'a [u8]),
    /// One slice of `frames` samples per channel.
    NonInterleaved(&'a [&'a [u8]]),
}

/// Native output memory for one period.
#[derive(Debug)]
pub enum NativeOutput<'a> {
    Interleaved(&'a mut [u8]),
    NonInterleaved(&'a mut [&'a mut [u8]]),
}

/// Raw buffers handed to a stream callback, once per period.
#[derive(Debug)]
pub struct Buffer<'a> {
    /// Frames in this period. Never more than the stream's frame count.
    pub frames: usize,
    /// `None` when the stream has no inputs.
    pub input: Option<NativeInput<'a>>,
    /// `None` when the stream has no outputs.
    pub output: Option<NativeOutput<'a>>,
    /// Frames delivered before this period. Only meaningful if `time_valid` is set.
    pub position: u64,
    pub time_valid: bool,
    /// An x-run happened right before this period; its contents are undefined.
    pub xrun: bool,
}

/// Random access to the samples of a buffer.
pub(crate) trait Samples {
    fn sample(&self, layout: Layout, frame: usize, channel: usize) -> &[u8];
}

pub(crate) trait SamplesMut: Samples {
    fn sample_mut(&mut self, layout: Layout, frame: usize, channel: usize) -> &mut [u8];
}

fn interleaved_at(layout: Layout, frame: usize, channel: usize) -> usize {
    (frame * layout.channels + channel) * layout.sample_size
}

impl Samples for NativeInput<'_> {
    fn sample(&self, layout: Layout, frame: usize, channel: usize) -> &[u8] {
        let size = layout.sample_size;
        match self {
            NativeInput::Interleaved(data) => {
                let at = interleaved_at(layout, frame, channel);
                &data[at..at + size]
            }
            NativeInput::NonInterleaved(channels) => {
                &channels[channel][frame * size..(frame + 1) * size]
            }
        }
    }
}

impl Samples for NativeOutput<'_> {
    fn sample(&self, layout: Layout, frame: usize, channel: usize) -> &[u8] {
        let size = layout.sample_size;
        match self {
            NativeOutput::Interleaved(data) => {
                let at = interleaved_at(layout, frame, channel);
                &data[at..at + size]
            }
            NativeOutput::NonInterleaved(channels) => {
                &channels[channel][frame * size..(frame + 1) * size]
            }
        }
    }
}

impl SamplesMut for NativeOutput<'_> {
    fn sample_mut(&mut self, layout: Layout, frame: usize, channel: usize) -> &mut [u8] {
        let size = layout.sample_size;
        match self {
            NativeOutput::Interleaved(data) => {
                let at = interleaved_at(layout, frame, channel);
                &mut data[at..at + size]
            }
            NativeOutput::NonInterleaved(channels) => {
                &mut channels[channel][frame * size..(frame + 1) * size]
            }
        }
    }
}

impl NativeOutput<'_> {
    pub fn is_interleaved(&self) -> bool {
        matches!(self, NativeOutput::Interleaved(_))
    }

    /// Writes silence into the first `frames` frames.
    pub fn silence(&mut self, sample: SampleType, layout: Layout, frames: usize) {
        match self {
            NativeOutput::Interleaved(data) => {
                let len = (frames * layout.frame_size()).min(data.len());
                fill_silence(sample, &mut data[..len]);
            }
            NativeOutput::NonInterleaved(channels) => {
                for channel in channels.iter_mut() {
                    let len = (frames * layout.sample_size).min(channel.len());
                    fill_silence(sample, &mut channel[..len]);
                }
            }
        }
    }
}

impl NativeInput<'_> {
    pub fn is_interleaved(&self) -> bool {
        matches!(self, NativeInput::Interleaved(_))
    }
}

/// Copies one channel between buffers of possibly different shapes and widths.
pub(crate) fn weave<S, D>(
    dst: &mut D,
    dst_layout: Layout,
    dst_channel: usize,
    src: &S,
    src_layout: Layout,
    src_channel: usize,
    frames: usize,
) where
    S: Samples + ?Sized,
    D: SamplesMut + ?Sized,
{
    for frame in 0..frames {
        dst.sample_mut(dst_layout, frame, dst_channel)
            .copy_from_slice(src.sample(src_layout, frame, src_channel));
    }
}

/// Copies every channel of `src` into `dst`, starting at channel `offset` of `dst`.
pub(crate) fn weave_all<S, D>(
    dst: &mut D,
    dst_layout: Layout,
    offset: usize,
    src: &S,
    src_layout: Layout,
    frames: usize,
) where
    S: Samples + ?Sized,
    D: SamplesMut + ?Sized,
{
    for channel in 0..src_layout.channels {
        weave(dst, dst_layout, offset + channel, src, src_layout, channel, frames);
    }
}

/// Copies channels `offset..offset + dst_layout.channels` of `src` into all of `dst`.
pub(crate) fn unweave_all<S, D>(
    dst: &mut D,
    dst_layout: Layout,
    src: &S,
    src_layout: Layout,
    offset: usize,
    frames: usize,
) where
    S: Samples + ?Sized,
    D: SamplesMut + ?Sized,
{
    for channel in 0..dst_layout.channels {
        weave(dst, dst_layout, channel, src, src_layout, offset + channel, frames);
    }
}

/// Owned sample memory in either shape, allocated once for a maximum frame count.
pub(crate) struct Scratch {
    interleaved: bool,
    layout: Layout,
    sample: SampleType,
    planes: Vec<Vec<u8>>,
}

impl Scratch {
    pub fn new(interleaved: bool, sample: SampleType, layout: Layout, frames: usize) -> Scratch {
        let planes = if interleaved {
            vec![vec![0; frames * layout.frame_size()]]
        } else {
            vec![vec![0; frames * layout.sample_size]; layout.channels]
        };

        let mut scratch = Scratch {
            interleaved,
            layout,
            sample,
            planes,
        };
        scratch.silence();
        scratch
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn silence(&mut self) {
        for plane in &mut self.planes {
            fill_silence(self.sample, plane);
        }
    }

    /// Interleaved bytes of the first `frames` frames. Only valid for interleaved scratch.
    pub fn bytes(&self, frames: usize) -> &[u8] {
        debug_assert!(self.interleaved);
        &self.planes[0][..frames * self.layout.frame_size()]
    }

    pub fn bytes_mut(&mut self, frames: usize) -> &mut [u8] {
        debug_assert!(self.interleaved);
        let len = frames * self.layout.frame_size();
        &mut self.planes[0][..len]
    }

    pub fn input<'b>(&'b self, bump: &'b Bump, frames: usize) -> NativeInput<'b> {
        if self.interleaved {
            return NativeInput::Interleaved(self.bytes(frames));
        }

        let len = frames * self.layout.sample_size;
        let planes = bump.alloc_slice_fill_iter(self.planes.iter().map(|plane| &plane[..len]));
        NativeInput::NonInterleaved(planes)
    }

    pub fn output<'b>(&'b mut self, bump: &'b Bump, frames: usize) -> NativeOutput<'b> {
        if self.interleaved {
            let len = frames * self.layout.frame_size();
            return NativeOutput::Interleaved(&mut self.planes[0][..len]);
        }

        let len = frames * self.layout.sample_size;
        let planes =
            bump.alloc_slice_fill_iter(self.planes.iter_mut().map(|plane| &mut plane[..len]));
        NativeOutput::NonInterleaved(planes)
    }
}

impl Samples for Scratch {
    fn sample(&self, layout: Layout, frame: usize, channel: usize) -> &[u8] {
        let size = layout.sample_size;
        if self.interleaved {
            let at = interleaved_at(layout, frame, channel);
            &self.planes[0][at..at + size]
        } else {
            &self.planes[channel][frame * size..(frame + 1) * size]
        }
    }
}

impl SamplesMut for Scratch {
    fn sample_mut(&mut self, layout: Layout, frame: usize, channel: usize) -> &mut [u8] {
        let size = layout.sample_size;
        if self.interleaved {
            let at = interleaved_at(layout, frame, channel);
            &mut self.planes[0][at..at + size]
        } else {
            &mut self.planes[channel][frame * size..(frame + 1) * size]
        }
    }
}
