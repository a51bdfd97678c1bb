//! Typed, preallocated views over native stream buffers.
//!
//! A [`SafeBuffer`] is registered against a stream from the control thread. Inside the stream
//! callback, [`crate::Callback::safe_buffer`] gives access to it: `lock` converts the native input
//! into typed samples and clears the typed output, `unlock` converts the typed output back into
//! native memory. Nothing is allocated between registration and unregistration.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;

use crate::buffer::{Buffer, Layout, NativeInput, NativeOutput, Samples, SamplesMut};
use crate::error::{Error, ErrorKind, Result};
use crate::format::{Format, SampleType};
use crate::sample::{Sample, I24};
use crate::stream::{Stream, StreamShared};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;
const LOCKED: u8 = 3;

/// Registration slot owned by a stream.
///
/// The state word decides who may touch the storage: the control thread while `BUSY`, the
/// callback thread while `LOCKED`, nobody otherwise.
pub(crate) struct SafeSlot {
    state: AtomicU8,
    storage: UnsafeCell<Option<Storage>>,
}

// SAFETY: access to `storage` is serialized by `state`, see above.
unsafe impl Sync for SafeSlot {}

impl SafeSlot {
    pub(crate) fn new() -> SafeSlot {
        SafeSlot {
            state: AtomicU8::new(EMPTY),
            storage: UnsafeCell::new(None),
        }
    }

    pub(crate) fn is_registered(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), READY | LOCKED)
    }

    fn install(&self, storage: Storage) -> Result<()> {
        self.state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Error::core(ErrorKind::AlreadyRegistered))?;

        // SAFETY: we hold `BUSY`.
        unsafe { *self.storage.get() = Some(storage) };

        self.state.store(READY, Ordering::Release);
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        if let Err(state) =
            self.state
                .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            let kind = match state {
                LOCKED => ErrorKind::StillLocked,
                _ => ErrorKind::NotRegistered,
            };
            return Err(Error::core(kind));
        }

        // SAFETY: we hold `BUSY`.
        let storage = unsafe { (*self.storage.get()).take() };

        self.state.store(EMPTY, Ordering::Release);
        drop(storage);
        Ok(())
    }

    fn acquire(&self) -> Result<()> {
        if let Err(state) =
            self.state
                .compare_exchange(READY, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            let kind = match state {
                LOCKED => ErrorKind::AlreadyLocked,
                _ => ErrorKind::NotRegistered,
            };
            return Err(Error::core(kind));
        }

        Ok(())
    }

    fn release(&self) {
        self.state.store(READY, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) == LOCKED
    }

    /// SAFETY: the caller must hold `LOCKED` for the whole lifetime of the returned reference,
    /// and no mutable reference into the storage may exist meanwhile.
    unsafe fn storage_ref(&self) -> Option<&Storage> {
        (*self.storage.get()).as_ref()
    }

    /// SAFETY: the caller must hold `LOCKED` for the whole lifetime of the returned reference,
    /// and must not create another reference into the storage meanwhile.
    #[allow(clippy::mut_from_ref)]
    unsafe fn storage_mut(&self) -> Option<&mut Storage> {
        (*self.storage.get()).as_mut()
    }
}

/// Preallocated typed storage for one registration.
struct Storage {
    sample: SampleType,
    max_frames: usize,
    frames: usize,
    input: Option<Box<dyn Typed>>,
    output: Option<Box<dyn Typed>>,
}

impl Storage {
    fn new(format: &Format, interleaved: bool, max_frames: usize) -> Storage {
        let sample = format.mix.sample();
        let typed = |channels: usize| {
            (channels > 0).then(|| typed_buffer(sample, interleaved, channels, max_frames))
        };

        Storage {
            sample,
            max_frames,
            frames: 0,
            input: typed(format.channels.inputs),
            output: typed(format.channels.outputs),
        }
    }

    fn begin(&mut self, buffer: &Buffer<'_>, format: &Format) {
        self.frames = buffer.frames.min(self.max_frames);

        if let Some(input) = &mut self.input {
            match &buffer.input {
                Some(native) => input.load(native, format.layout(false), self.frames),
                None => input.clear(self.frames),
            }
        }

        if let Some(output) = &mut self.output {
            output.clear(self.frames);
        }
    }

    fn finish(&self, buffer: &mut Buffer<'_>, format: &Format) {
        if let (Some(output), Some(native)) = (&self.output, &mut buffer.output) {
            output.store(native, format.layout(true), self.frames);
        }
    }

    fn view<'a, T: Sample>(&self, typed: Option<&'a dyn Typed>) -> Result<&'a TypedBuffer<T>> {
        self.check_type::<T>()?;
        typed
            .and_then(|typed| typed.as_any().downcast_ref::<TypedBuffer<T>>())
            .ok_or_else(no_channels)
    }

    fn check_type<T: Sample>(&self) -> Result<()> {
        if T::TYPE != self.sample {
            return Err(Error::core(ErrorKind::SampleMismatch {
                expected: self.sample,
                requested: T::TYPE,
            }));
        }

        Ok(())
    }
}

fn no_channels() -> Error {
    Error::core(ErrorKind::InvalidConfiguration(
        "no channels in this direction".into(),
    ))
}

/// Type-erased [`TypedBuffer`].
trait Typed: Send {
    fn load(&mut self, src: &NativeInput<'_>, layout: Layout, frames: usize);

    fn store(&self, dst: &mut NativeOutput<'_>, layout: Layout, frames: usize);

    fn clear(&mut self, frames: usize);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

fn typed_buffer(
    sample: SampleType,
    interleaved: bool,
    channels: usize,
    frames: usize,
) -> Box<dyn Typed> {
    fn make<T: Sample>(interleaved: bool, channels: usize, frames: usize) -> Box<dyn Typed> {
        Box::new(TypedBuffer::<T>::new(interleaved, channels, frames))
    }

    match sample {
        SampleType::U8 => make::<u8>(interleaved, channels, frames),
        SampleType::I8 => make::<i8>(interleaved, channels, frames),
        SampleType::I16 => make::<i16>(interleaved, channels, frames),
        SampleType::I24 => make::<I24>(interleaved, channels, frames),
        SampleType::I32 => make::<i32>(interleaved, channels, frames),
        SampleType::F32 => make::<f32>(interleaved, channels, frames),
        SampleType::F64 => make::<f64>(interleaved, channels, frames),
    }
}

struct TypedBuffer<T> {
    interleaved: bool,
    channels: usize,
    /// One plane when interleaved, one per channel otherwise.
    planes: Vec<Box<[T]>>,
}

impl<T: Sample> TypedBuffer<T> {
    fn new(interleaved: bool, channels: usize, frames: usize) -> TypedBuffer<T> {
        let silence = T::from_f64(0.0);
        let planes = if interleaved {
            vec![vec![silence; frames * channels].into_boxed_slice()]
        } else {
            (0..channels)
                .map(|_| vec![silence; frames].into_boxed_slice())
                .collect()
        };

        TypedBuffer {
            interleaved,
            channels,
            planes,
        }
    }

    fn index(&self, frame: usize, channel: usize) -> (usize, usize) {
        if self.interleaved {
            (0, frame * self.channels + channel)
        } else {
            (channel, frame)
        }
    }
}

impl<T: Sample> Typed for TypedBuffer<T> {
    fn load(&mut self, src: &NativeInput<'_>, layout: Layout, frames: usize) {
        for frame in 0..frames {
            for channel in 0..self.channels {
                let (plane, at) = self.index(frame, channel);
                self.planes[plane][at] = T::read(src.sample(layout, frame, channel));
            }
        }
    }

    fn store(&self, dst: &mut NativeOutput<'_>, layout: Layout, frames: usize) {
        for frame in 0..frames {
            for channel in 0..self.channels {
                let (plane, at) = self.index(frame, channel);
                self.planes[plane][at].write(dst.sample_mut(layout, frame, channel));
            }
        }
    }

    fn clear(&mut self, frames: usize) {
        let silence = T::from_f64(0.0);
        let len = if self.interleaved {
            frames * self.channels
        } else {
            frames
        };

        for plane in &mut self.planes {
            plane[..len].fill(silence);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Read-only typed view of this period's input.
///
/// Interleaved views expose one flat slice of `frames * channels` samples. Non-interleaved views
/// expose one slice of `frames` samples per channel.
#[derive(Debug)]
pub struct InputView<'a, T> {
    planes: &'a [Box<[T]>],
    interleaved: bool,
    channels: usize,
    frames: usize,
}

impl<'a, T: Sample> InputView<'a, T> {
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    /// The flat sample array, if interleaved.
    pub fn interleaved(&self) -> Option<&'a [T]> {
        let planes = self.planes;
        let len = self.frames * self.channels;
        self.interleaved.then(|| &planes[0][..len])
    }

    /// One channel's samples, if non-interleaved.
    pub fn channel(&self, channel: usize) -> Option<&'a [T]> {
        if self.interleaved {
            return None;
        }

        let planes = self.planes;
        planes.get(channel).map(|plane| &plane[..self.frames])
    }

    pub fn get(&self, frame: usize, channel: usize) -> T {
        if self.interleaved {
            self.planes[0][frame * self.channels + channel]
        } else {
            self.planes[channel][frame]
        }
    }
}

/// Writable typed view of this period's output, cleared to silence by `lock`.
#[derive(Debug)]
pub struct OutputView<'a, T> {
    planes: &'a mut [Box<[T]>],
    interleaved: bool,
    channels: usize,
    frames: usize,
}

impl<T: Sample> OutputView<'_, T> {
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    pub fn interleaved_mut(&mut self) -> Option<&mut [T]> {
        let len = self.frames * self.channels;
        if self.interleaved {
            Some(&mut self.planes[0][..len])
        } else {
            None
        }
    }

    pub fn channel_mut(&mut self, channel: usize) -> Option<&mut [T]> {
        if self.interleaved {
            return None;
        }

        let frames = self.frames;
        self.planes.get_mut(channel).map(|plane| &mut plane[..frames])
    }

    /// All channels at once, if non-interleaved.
    pub fn planes_mut(&mut self) -> Option<impl Iterator<Item = &mut [T]> + '_> {
        if self.interleaved {
            return None;
        }

        let frames = self.frames;
        Some(self.planes.iter_mut().map(move |plane| &mut plane[..frames]))
    }

    pub fn set(&mut self, frame: usize, channel: usize, value: T) {
        if self.interleaved {
            self.planes[0][frame * self.channels + channel] = value;
        } else {
            self.planes[channel][frame] = value;
        }
    }
}

/// Control-side handle of a safe buffer registration.
///
/// Dropping the handle unregisters, waiting for an in-progress callback to unlock first.
pub struct SafeBuffer {
    shared: Arc<StreamShared>,
    interleaved: bool,
    registered: bool,
}

impl SafeBuffer {
    /// Allocates typed storage for `stream` and registers it.
    ///
    /// Storage covers the stream's frame count and channel counts in its sample type. Only one
    /// registration per stream may be active.
    pub fn register(stream: &Stream, interleaved: bool) -> Result<SafeBuffer> {
        stream.check_platform("register safe buffer")?;

        let storage = Storage::new(stream.format(), interleaved, stream.frames());
        stream.shared().safe.install(storage)?;

        tracing::debug!(interleaved, frames = stream.frames(), "registered safe buffer");

        Ok(SafeBuffer {
            shared: stream.shared().clone(),
            interleaved,
            registered: true,
        })
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    /// Releases the storage. Fails with `StillLocked` while a callback holds the lock.
    pub fn unregister(&mut self) -> Result<()> {
        if !self.registered {
            return Err(Error::core(ErrorKind::NotRegistered));
        }

        self.shared.safe.remove()?;
        self.registered = false;
        Ok(())
    }
}

impl fmt::Debug for SafeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeBuffer")
            .field("interleaved", &self.interleaved)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl Drop for SafeBuffer {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }

        let backoff = Backoff::new();
        loop {
            match self.shared.safe.remove() {
                Err(e) if matches!(e.kind(), ErrorKind::StillLocked) => backoff.snooze(),
                _ => break,
            }
        }
    }
}

/// Callback-side access to a stream's safe buffer for one period.
///
/// If dropped while locked, the output is flushed and the lock released.
pub struct SafeAccess<'c, 'b> {
    slot: &'c SafeSlot,
    buffer: &'c mut Buffer<'b>,
    format: &'c Format,
    locked: bool,
}

impl<'c, 'b> SafeAccess<'c, 'b> {
    pub(crate) fn new(
        slot: &'c SafeSlot,
        buffer: &'c mut Buffer<'b>,
        format: &'c Format,
    ) -> SafeAccess<'c, 'b> {
        SafeAccess {
            slot,
            buffer,
            format,
            locked: false,
        }
    }

    fn storage(&self) -> Result<&Storage> {
        if !self.locked || !self.slot.is_locked() {
            return Err(Error::core(ErrorKind::NotLocked));
        }

        // SAFETY: we hold `LOCKED`, and the returned borrow is tied to `&self`, which excludes
        // `lock`, `unlock` and the mutable views. Shared borrows may coexist.
        unsafe { self.slot.storage_ref() }.ok_or_else(|| Error::core(ErrorKind::NotRegistered))
    }

    fn storage_mut(&mut self) -> Result<&mut Storage> {
        if !self.locked || !self.slot.is_locked() {
            return Err(Error::core(ErrorKind::NotLocked));
        }

        // SAFETY: as above, tied to `&mut self`.
        unsafe { self.slot.storage_mut() }.ok_or_else(|| Error::core(ErrorKind::NotRegistered))
    }

    /// Converts native input into the typed input view and clears the typed output view.
    pub fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Err(Error::core(ErrorKind::AlreadyLocked));
        }

        self.slot.acquire()?;
        self.locked = true;

        let format = self.format;
        let buffer: &Buffer<'_> = &*self.buffer;
        // SAFETY: `LOCKED` was just acquired.
        if let Some(storage) = unsafe { self.slot.storage_mut() } {
            storage.begin(buffer, format);
        }

        Ok(())
    }

    /// Flushes the typed output view into native output memory and releases the lock.
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Err(Error::core(ErrorKind::NotLocked));
        }

        let format = self.format;
        // SAFETY: we hold `LOCKED`; the storage is not otherwise borrowed since we have `&mut
        // self`.
        if let Some(storage) = unsafe { self.slot.storage_mut() } {
            storage.finish(self.buffer, format);
        }

        self.locked = false;
        self.slot.release();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn input<T: Sample>(&self) -> Result<InputView<'_, T>> {
        let storage = self.storage()?;
        let typed = storage.view::<T>(storage.input.as_deref())?;

        Ok(InputView {
            planes: &typed.planes,
            interleaved: typed.interleaved,
            channels: typed.channels,
            frames: storage.frames,
        })
    }

    pub fn output<T: Sample>(&mut self) -> Result<OutputView<'_, T>> {
        let storage = self.storage_mut()?;
        storage.check_type::<T>()?;

        let frames = storage.frames;
        let typed = storage
            .output
            .as_deref_mut()
            .and_then(|typed| typed.as_any_mut().downcast_mut::<TypedBuffer<T>>())
            .ok_or_else(no_channels)?;

        Ok(OutputView {
            interleaved: typed.interleaved,
            channels: typed.channels,
            planes: &mut typed.planes,
            frames,
        })
    }
}

impl Drop for SafeAccess<'_, '_> {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.unlock();
        }
    }
}
