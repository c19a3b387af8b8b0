//! Mock codec for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::lock;
use super::mock_renderer::RendererShared;
use crate::error::{Result, ShrinkError};
use crate::media::{
    BufferInfo, Codec, InputSurface, MediaFormat, OutputEvent, SampleFlags, SurfaceHandle,
};

/// Size of the payload a mock encoder emits per surface frame.
const SURFACE_FRAME_SIZE: usize = 64;

/// Observable state of a [`MockCodec`], shared with whoever created it.
#[derive(Debug, Clone, Default)]
pub struct MockCodecState {
    pub started: bool,
    pub stopped: bool,
    pub released: bool,
    /// Every `queue_input_buffer` call, in order.
    pub queued_inputs: Vec<BufferInfo>,
    /// Output buffers handed out that were neither empty nor codec config.
    pub data_outputs: u64,
    /// Output buffers released with `render`.
    pub rendered_frames: u64,
    pub input_surface_created: bool,
    pub input_surface_released: bool,
    pub end_of_input_signalled: bool,
}

#[derive(Debug)]
struct Packet {
    data: Vec<u8>,
    presentation_time_us: i64,
    flags: SampleFlags,
}

#[derive(Debug, Default)]
pub(crate) struct CodecShared {
    state: MockCodecState,
    pending: VecDeque<Packet>,
}

/// Configures a [`MockCodec`].
///
/// Kept by [`MockBackend`](super::MockBackend) as a template so every
/// creation yields a fresh codec.
#[derive(Debug, Clone)]
pub struct MockCodecBuilder {
    name: String,
    output_format: MediaFormat,
    input_capacity: usize,
    input_slots: usize,
    stop_delay: Duration,
    codec_config_output: bool,
    fail_output_after: Option<u64>,
    fail_create: bool,
}

impl MockCodecBuilder {
    /// Format reported by `output_format`.
    pub fn output_format(mut self, format: MediaFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Length of every input slot.
    pub fn input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    pub fn input_slots(mut self, slots: usize) -> Self {
        self.input_slots = slots;
        self
    }

    /// Makes `stop` sleep.
    pub fn stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Emits a codec config buffer before the first data buffer.
    pub fn codec_config_output(mut self, enabled: bool) -> Self {
        self.codec_config_output = enabled;
        self
    }

    /// Fails `dequeue_output_buffer` once `count` data buffers went out.
    pub fn fail_output_after(mut self, count: u64) -> Self {
        self.fail_output_after = Some(count);
        self
    }

    /// Makes the backend fail to instantiate this codec.
    pub fn fail_create(mut self, fail: bool) -> Self {
        self.fail_create = fail;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn fails_create(&self) -> bool {
        self.fail_create
    }

    pub fn build(&self) -> MockCodec {
        MockCodec {
            name: self.name.clone(),
            output_format: self.output_format.clone(),
            stop_delay: self.stop_delay,
            codec_config_output: self.codec_config_output,
            fail_output_after: self.fail_output_after,
            input_slots: vec![vec![0; self.input_capacity]; self.input_slots],
            free_inputs: (0..self.input_slots).collect(),
            outputs: HashMap::new(),
            next_output_index: 0,
            format_announced: false,
            config_emitted: false,
            delivered: 0,
            shared: Arc::new(Mutex::new(CodecShared::default())),
            render_target: None,
        }
    }
}

/// Passthrough codec: every queued input comes back out as one output
/// buffer with the same bytes, timestamp and flags.
///
/// A surface-input encoder instead emits one buffer per
/// [`InputSurface::swap_buffers`]. A decoder configured with a surface hands
/// rendered buffers to the matching [`MockFrameRenderer`](super::MockFrameRenderer).
pub struct MockCodec {
    name: String,
    output_format: MediaFormat,
    stop_delay: Duration,
    codec_config_output: bool,
    fail_output_after: Option<u64>,
    input_slots: Vec<Vec<u8>>,
    free_inputs: VecDeque<usize>,
    outputs: HashMap<usize, (Vec<u8>, i64)>,
    next_output_index: usize,
    format_announced: bool,
    config_emitted: bool,
    delivered: u64,
    shared: Arc<Mutex<CodecShared>>,
    render_target: Option<Arc<Mutex<RendererShared>>>,
}

impl MockCodec {
    pub fn builder(name: impl Into<String>) -> MockCodecBuilder {
        MockCodecBuilder {
            name: name.into(),
            output_format: MediaFormat::default(),
            input_capacity: 4096,
            input_slots: 4,
            stop_delay: Duration::ZERO,
            codec_config_output: false,
            fail_output_after: None,
            fail_create: false,
        }
    }

    /// Snapshot of the observable state.
    pub fn state(&self) -> MockCodecState {
        lock(&self.shared).state.clone()
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<CodecShared>> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn render_into(&mut self, target: Arc<Mutex<RendererShared>>) {
        self.render_target = Some(target);
    }

    fn emit(&mut self, data: Vec<u8>, presentation_time_us: i64, flags: SampleFlags) -> OutputEvent {
        let index = self.next_output_index;
        self.next_output_index += 1;
        let info = BufferInfo::new(0, data.len(), presentation_time_us, flags);
        self.outputs.insert(index, (data, presentation_time_us));
        OutputEvent::Buffer { index, info }
    }
}

impl CodecShared {
    pub(crate) fn state(&self) -> &MockCodecState {
        &self.state
    }
}

impl Codec for MockCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        lock(&self.shared).state.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.stop_delay.is_zero() {
            std::thread::sleep(self.stop_delay);
        }
        lock(&self.shared).state.stopped = true;
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.shared).state.released = true;
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>> {
        Ok(self.free_inputs.pop_front())
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8]> {
        self.input_slots
            .get_mut(index)
            .map(|slot| slot.as_mut_slice())
            .ok_or_else(|| ShrinkError::codec(format!("no input buffer {}", index)))
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: SampleFlags,
    ) -> Result<()> {
        let data = self
            .input_slots
            .get(index)
            .and_then(|slot| slot.get(offset..offset + size))
            .ok_or_else(|| ShrinkError::codec(format!("bad input range on buffer {}", index)))?
            .to_vec();
        let mut shared = lock(&self.shared);
        shared
            .state
            .queued_inputs
            .push(BufferInfo::new(offset, size, presentation_time_us, flags));
        shared.pending.push_back(Packet {
            data,
            presentation_time_us,
            flags,
        });
        drop(shared);
        self.free_inputs.push_back(index);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<OutputEvent> {
        if let Some(limit) = self.fail_output_after {
            if self.delivered >= limit {
                return Err(ShrinkError::codec(format!("{}: codec reported an error", self.name)));
            }
        }

        let packet = {
            let mut shared = lock(&self.shared);
            if shared.pending.is_empty() {
                return Ok(OutputEvent::TryAgainLater);
            }
            if !self.format_announced {
                self.format_announced = true;
                return Ok(OutputEvent::FormatChanged);
            }
            if self.codec_config_output && !self.config_emitted {
                None
            } else {
                let packet = shared.pending.pop_front();
                if let Some(packet) = &packet {
                    if !packet.data.is_empty() {
                        shared.state.data_outputs += 1;
                    }
                }
                packet
            }
        };

        match packet {
            None => {
                self.config_emitted = true;
                Ok(self.emit(vec![0, 0], 0, SampleFlags::CODEC_CONFIG))
            }
            Some(packet) => {
                if !packet.data.is_empty() {
                    self.delivered += 1;
                }
                Ok(self.emit(packet.data, packet.presentation_time_us, packet.flags))
            }
        }
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8]> {
        self.outputs
            .get(&index)
            .map(|(data, _)| data.as_slice())
            .ok_or_else(|| ShrinkError::codec(format!("no output buffer {}", index)))
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<()> {
        let (_, presentation_time_us) = self
            .outputs
            .remove(&index)
            .ok_or_else(|| ShrinkError::codec(format!("output buffer {} is not held", index)))?;
        if render {
            lock(&self.shared).state.rendered_frames += 1;
            if let Some(target) = &self.render_target {
                lock(target).frame_available(presentation_time_us);
            }
        }
        Ok(())
    }

    fn output_format(&self) -> Result<MediaFormat> {
        Ok(self.output_format.clone())
    }

    fn signal_end_of_input_stream(&mut self) -> Result<()> {
        let mut shared = lock(&self.shared);
        shared.state.end_of_input_signalled = true;
        shared.pending.push_back(Packet {
            data: Vec::new(),
            presentation_time_us: 0,
            flags: SampleFlags::END_OF_STREAM,
        });
        Ok(())
    }

    fn create_input_surface(&mut self) -> Result<Box<dyn InputSurface>> {
        lock(&self.shared).state.input_surface_created = true;
        Ok(Box::new(MockInputSurface {
            codec: Arc::clone(&self.shared),
            presentation_time_ns: 0,
        }))
    }
}

/// Input surface of a surface-input [`MockCodec`].
pub struct MockInputSurface {
    codec: Arc<Mutex<CodecShared>>,
    presentation_time_ns: i64,
}

impl InputSurface for MockInputSurface {
    fn handle(&self) -> SurfaceHandle {
        SurfaceHandle(Arc::as_ptr(&self.codec) as u64)
    }

    fn set_presentation_time_ns(&mut self, time_ns: i64) -> Result<()> {
        self.presentation_time_ns = time_ns;
        Ok(())
    }

    fn swap_buffers(&mut self) -> Result<()> {
        lock(&self.codec).pending.push_back(Packet {
            data: vec![0; SURFACE_FRAME_SIZE],
            presentation_time_us: self.presentation_time_ns / 1000,
            flags: SampleFlags::NONE,
        });
        Ok(())
    }

    fn release(&mut self) {
        lock(&self.codec).state.input_surface_released = true;
    }
}
