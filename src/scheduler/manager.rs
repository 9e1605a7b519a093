//! Per-session audio-thread glue
//!
//! The manager owns everything only the audio thread touches: the send
//! and receive rings, the stamp deque and the sizing results. Pushing
//! fills rings and claims slots for the workers; popping collects
//! finished slots in stamp order and drains the receive rings. Between
//! `prepare` and `release` none of these paths allocate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::backend::InferenceBackend;
use crate::buffer::RingBuffer;
use crate::config::HostConfig;
use crate::error::{Result, RtInferError};

use super::context::Context;
use super::session::SessionElement;

pub struct InferenceManager {
    context: Arc<Context>,
    session: Arc<SessionElement>,
    host_config: Option<HostConfig>,
    send_buffers: Vec<RingBuffer>,
    receive_buffers: Vec<RingBuffer>,
    /// In-flight stamps, newest at the front. The audio thread consumes
    /// from the back, which keeps delivery FIFO.
    pending_stamps: VecDeque<u16>,
    next_stamp: u16,
    latency: Vec<usize>,
    num_slots: usize,
    /// Samples that were replaced with silence because their inference
    /// was late; discarded once the stream has caught up again.
    missed_samples: Vec<usize>,
    wait_fraction: Option<f32>,
    released: bool,
}

impl InferenceManager {
    pub(crate) fn new(context: Arc<Context>, session: Arc<SessionElement>) -> Self {
        Self {
            context,
            session,
            host_config: None,
            send_buffers: Vec::new(),
            receive_buffers: Vec::new(),
            pending_stamps: VecDeque::new(),
            next_stamp: 0,
            latency: Vec::new(),
            num_slots: 0,
            missed_samples: Vec::new(),
            wait_fraction: None,
            released: false,
        }
    }

    /// Size rings, slots and latency for `host` and open the fast paths.
    /// `custom_latency` entries override the computed latency per
    /// streaming output tensor (`None` keeps the computed value).
    pub fn prepare(
        &mut self,
        host: HostConfig,
        custom_latency: Option<&[Option<usize>]>,
    ) -> Result<()> {
        let config = &self.session.config;

        if host.buffer_size <= 0.0 || host.sample_rate <= 0.0 {
            return Err(RtInferError::config(
                "Host buffer size and sample rate must be positive",
            ));
        }
        if host.tensor_index >= config.num_input_tensors()
            || config.stream_input_size(host.tensor_index) == 0
        {
            return Err(RtInferError::config(
                "Host tensor index must name a streaming input tensor",
            ));
        }
        if let Some(custom) = custom_latency {
            if custom.len() != config.num_output_tensors() {
                return Err(RtInferError::config(
                    "Custom latency length must match the number of output tensors",
                ));
            }
            for (i, entry) in custom.iter().enumerate() {
                if config.stream_output_size(i) == 0 && entry.unwrap_or(0) != 0 {
                    return Err(RtInferError::config(
                        "Non-streaming output tensors cannot carry custom latency",
                    ));
                }
            }
        }

        self.context.quiesce_session(&self.session);

        // The wait credit only applies when the context actually allows
        // the audio thread to block.
        let mut latency = if self.context.controlled_blocking_enabled() {
            SessionElement::calculate_latency(config, &host)
        } else {
            let mut no_wait = config.clone();
            no_wait.wait_in_process_block = None;
            SessionElement::calculate_latency(&no_wait, &host)
        };
        if let Some(custom) = custom_latency {
            for (i, entry) in custom.iter().enumerate() {
                if let Some(value) = entry {
                    if config.stream_output_size(i) > 0 {
                        latency[i] = *value;
                    }
                }
            }
        }

        let num_slots = SessionElement::calculate_num_slots(config, &host);
        let send_sizes = SessionElement::send_buffer_sizes(config, &host);
        let receive_sizes = SessionElement::receive_buffer_sizes(config, num_slots, &latency);

        self.send_buffers = send_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| RingBuffer::new(config.input_channels(i), size))
            .collect();
        self.receive_buffers = receive_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| RingBuffer::new(config.output_channels(i), size))
            .collect();

        self.latency = latency;
        self.num_slots = num_slots;
        self.missed_samples = vec![0; config.num_output_tensors()];
        self.pending_stamps = VecDeque::with_capacity(num_slots + 1);
        self.next_stamp = 0;
        self.prefill_latency();

        self.session.allocate_slots(num_slots);

        self.wait_fraction = if self.context.controlled_blocking_enabled() {
            self.session.config.wait_in_process_block
        } else {
            None
        };

        self.host_config = Some(host.clone());
        self.context.activate_session(&self.session, &host);
        Ok(())
    }

    /// Zero all positions and slot states, keeping the current sizing.
    pub fn reset(&mut self) {
        let Some(host) = self.host_config.clone() else {
            return;
        };
        self.context.quiesce_session(&self.session);

        for ring in self.send_buffers.iter_mut() {
            ring.clear();
        }
        for ring in self.receive_buffers.iter_mut() {
            ring.clear();
        }
        self.prefill_latency();
        self.session.reset_slots();
        self.pending_stamps.clear();
        self.next_stamp = 0;
        for missed in self.missed_samples.iter_mut() {
            *missed = 0;
        }

        self.context.activate_session(&self.session, &host);
    }

    /// Seed the receive rings so the first pops observe the reported
    /// latency as silence. The model-internal share arrives from the
    /// model itself.
    fn prefill_latency(&mut self) {
        let config = &self.session.config;
        for i in 0..config.num_output_tensors() {
            let zeros = self.latency[i].saturating_sub(config.internal_latency(i));
            let ring = &mut self.receive_buffers[i];
            for channel in 0..ring.num_channels() {
                for _ in 0..zeros {
                    ring.push_sample(channel, 0.0);
                }
            }
        }
    }

    /// Push one host block of planar channel data into the send ring of
    /// `tensor_index` and submit every inference that became due. With
    /// multiple streaming inputs, push secondary tensors first and the
    /// reference tensor last; submission is driven by the reference ring.
    pub fn push_data(&mut self, input: &[&[f32]], tensor_index: usize) {
        if !self.session.initialised.load(Ordering::Acquire) {
            return;
        }
        let Some(ring) = self.send_buffers.get_mut(tensor_index) else {
            return;
        };

        for (channel, samples) in input.iter().enumerate().take(ring.num_channels()) {
            for &sample in samples.iter() {
                ring.push_sample(channel, sample);
            }
        }

        self.submit_pending();
    }

    /// Pop up to one host block from the receive ring of `tensor_index`.
    /// Returns how many samples per channel were actually delivered; the
    /// rest of `output` is silence.
    pub fn pop_data(&mut self, output: &mut [&mut [f32]], tensor_index: usize) -> usize {
        let requested = output.first().map(|ch| ch.len()).unwrap_or(0);
        if !self.session.initialised.load(Ordering::Acquire)
            || tensor_index >= self.receive_buffers.len()
        {
            for channel in output.iter_mut() {
                channel.fill(0.0);
            }
            return 0;
        }

        let deadline = self.wait_deadline(requested, tensor_index);
        self.retrieve_results(deadline);

        self.catch_up(tensor_index);

        let ring = &mut self.receive_buffers[tensor_index];
        let available = ring.available_samples(0);
        let received = requested.min(available);

        for (channel, out) in output.iter_mut().enumerate() {
            for (j, sample) in out.iter_mut().enumerate() {
                *sample = if j < received && channel < ring.num_channels() {
                    ring.pop_sample(channel)
                } else {
                    0.0
                };
            }
        }

        let shortfall = requested - received;
        if shortfall > 0 && !self.pending_stamps.is_empty() {
            // Late inference, not an over-eager pop: remember the deficit
            // so the stream can realign once the result lands.
            self.missed_samples[tensor_index] += shortfall;
            log::warn!(
                "Session {}: {} samples missing on tensor {}, emitting silence",
                self.session.id,
                shortfall,
                tensor_index
            );
        }

        received
    }

    /// Refresh the receive rings and report what a pop could deliver.
    pub fn available_samples(&mut self, tensor_index: usize, channel: usize) -> usize {
        if !self.session.initialised.load(Ordering::Acquire)
            || tensor_index >= self.receive_buffers.len()
        {
            return 0;
        }
        self.retrieve_results(None);
        self.receive_buffers[tensor_index].available_samples(channel)
    }

    pub fn set_backend(&self, backend: InferenceBackend) {
        self.session.current_backend.store(backend);
    }

    pub fn backend(&self) -> InferenceBackend {
        self.session.current_backend.load()
    }

    pub fn latency(&self) -> &[usize] {
        &self.latency
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn set_non_realtime(&self, non_realtime: bool) {
        self.session.non_realtime.store(non_realtime, Ordering::Release);
    }

    pub fn session_id(&self) -> u64 {
        self.session.id
    }

    pub(crate) fn session(&self) -> &Arc<SessionElement> {
        &self.session
    }

    pub fn release(&mut self) {
        if !self.released {
            self.context.release_session(&self.session);
            self.released = true;
        }
    }

    fn wait_deadline(&self, requested: usize, tensor_index: usize) -> Option<Instant> {
        if self.session.non_realtime.load(Ordering::Acquire) {
            return None;
        }
        let wait = self.wait_fraction?;
        let host = self.host_config.as_ref()?;
        let rate = host.relative_sample_rate(&self.session.config, tensor_index, false);
        if rate <= 0.0 {
            return None;
        }
        let budget = Duration::from_secs_f64(f64::from(wait) * requested as f64 / f64::from(rate));
        Some(Instant::now() + budget)
    }

    /// Claim every inference that became due. Frames that cannot get a
    /// free slot or a queue spot are dropped to silence whole.
    fn submit_pending(&mut self) {
        let Some(host) = self.host_config.clone() else {
            return;
        };
        let reference_stream = self.session.config.stream_input_size(host.tensor_index);

        while self.send_buffers[host.tensor_index].available_samples(0) >= reference_stream {
            if self.pre_process_one() {
                if self.context.host_threads_active() {
                    if let Some(submit_task) = host.submit_task.as_ref() {
                        if !submit_task(1) {
                            self.context.disable_host_threads();
                        }
                    }
                }
            } else {
                self.drop_frame();
            }
        }
    }

    /// Claim a FREE slot, fill its input frames and enqueue it. Returns
    /// false when no slot or queue spot was available.
    fn pre_process_one(&mut self) -> bool {
        let session = self.session.clone();
        let Some(slots) = session.slots.try_read() else {
            return false;
        };
        let config = &session.config;
        let backend = session.current_backend.load();

        for (index, slot) in slots.iter().enumerate() {
            if slot
                .free
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            {
                let mut frames = slot.input_frames.lock();
                for i in 0..config.num_input_tensors() {
                    if config.stream_input_size(i) > 0 {
                        session.pp_processor.pre_process(
                            &mut self.send_buffers[i],
                            &mut frames[i],
                            i,
                            backend,
                        );
                    } else {
                        let aux = session.pp_processor.aux();
                        let frame = &mut frames[i];
                        let samples = frame.num_samples();
                        for j in 0..aux.input_len(i) {
                            frame.set_sample(j / samples, j % samples, aux.get_input(i, j));
                        }
                    }
                }
            }

            let stamp = self.next_stamp;
            slot.time_stamp.store(stamp, Ordering::Relaxed);
            self.pending_stamps.push_front(stamp);
            slot.ready.store(true, Ordering::Release);

            if !self.context.submit_job(&session, index) {
                log::error!(
                    "Session {}: job queue full, dropping frame",
                    session.id
                );
                slot.ready.store(false, Ordering::Relaxed);
                self.pending_stamps.pop_front();
                slot.free.store(true, Ordering::Release);
                return false;
            }

            self.next_stamp = self.next_stamp.wrapping_add(1);
            return true;
        }

        log::warn!("Session {}: no free slot", session.id);
        false
    }

    /// Consume one frame's worth of input and emit silence in its place.
    fn drop_frame(&mut self) {
        let config = &self.session.config;
        for i in 0..config.num_input_tensors() {
            let stream = config.stream_input_size(i);
            if stream == 0 {
                continue;
            }
            let ring = &mut self.send_buffers[i];
            for channel in 0..ring.num_channels() {
                for _ in 0..stream {
                    ring.pop_sample(channel);
                }
            }
        }
        for i in 0..config.num_output_tensors() {
            let stream = config.stream_output_size(i);
            if stream == 0 {
                continue;
            }
            let ring = &mut self.receive_buffers[i];
            for channel in 0..ring.num_channels() {
                for _ in 0..stream {
                    ring.push_sample(channel, 0.0);
                }
            }
        }
    }

    /// Post-process every finished slot in stamp order, honouring the
    /// wait policy: indefinitely in non-realtime mode, until `deadline`
    /// under controlled blocking, not at all otherwise.
    fn retrieve_results(&mut self, deadline: Option<Instant>) {
        let session = self.session.clone();
        let non_realtime = session.non_realtime.load(Ordering::Acquire);
        let config = &session.config;

        while let Some(&oldest) = self.pending_stamps.back() {
            let Some(slots) = session.slots.try_read() else {
                return;
            };

            let position = slots.iter().position(|slot| {
                !slot.free.load(Ordering::Acquire)
                    && slot.time_stamp.load(Ordering::Relaxed) == oldest
            });
            let Some(index) = position else {
                // Stamp without a live slot; drop it rather than spin
                self.pending_stamps.pop_back();
                continue;
            };
            let slot = &slots[index];

            let acquired = if non_realtime {
                while !slot.done.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                slot.done.swap(false, Ordering::AcqRel)
            } else if let Some(deadline) = deadline {
                loop {
                    if slot.done.swap(false, Ordering::AcqRel) {
                        break true;
                    }
                    if Instant::now() >= deadline {
                        break false;
                    }
                    std::thread::sleep(Duration::from_micros(50));
                }
            } else {
                slot.done.swap(false, Ordering::AcqRel)
            };

            if !acquired {
                return;
            }

            self.pending_stamps.pop_back();

            let backend = session.current_backend.load();
            {
                let frames = slot.output_frames.lock();
                for i in 0..config.num_output_tensors() {
                    if config.stream_output_size(i) > 0 {
                        session.pp_processor.post_process(
                            &frames[i],
                            &mut self.receive_buffers[i],
                            i,
                            backend,
                        );
                    } else {
                        let aux = session.pp_processor.aux();
                        let frame = &frames[i];
                        let samples = frame.num_samples();
                        for j in 0..aux.output_len(i) {
                            aux.set_output(i, j, frame.get_sample(j / samples, j % samples));
                        }
                    }
                }
            }

            slot.free.store(true, Ordering::Release);
        }
    }

    /// Discard previously missed samples once the ring holds them plus a
    /// full request, so delivery realigns with the input timeline.
    fn catch_up(&mut self, tensor_index: usize) {
        let missed = self.missed_samples[tensor_index];
        if missed == 0 {
            return;
        }
        let host = match &self.host_config {
            Some(host) => host,
            None => return,
        };
        let host_output = host
            .relative_buffer_size(&self.session.config, tensor_index, false)
            .ceil() as usize;

        let ring = &mut self.receive_buffers[tensor_index];
        if ring.available_samples(0) >= missed + host_output {
            for channel in 0..ring.num_channels() {
                for _ in 0..missed {
                    ring.pop_sample(channel);
                }
            }
            log::info!(
                "Session {}: caught up {} late samples on tensor {}",
                self.session.id,
                missed,
                tensor_index
            );
            self.missed_samples[tensor_index] = 0;
        }
    }
}

impl Drop for InferenceManager {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InferenceConfig, ModelData, TensorShape};
    use crate::processing::StreamingPrePostProcessor;
    use crate::scheduler::context::ContextConfig;

    fn passthrough_manager(frame: usize, threads: usize) -> InferenceManager {
        let config = InferenceConfig::new(
            vec![ModelData::from_path(InferenceBackend::Custom, "model.pt")],
            vec![TensorShape::universal(
                vec![vec![1, 1, frame as i64]],
                vec![vec![1, 1, frame as i64]],
            )],
            5.0,
        )
        .resolve()
        .unwrap();
        let context = Context::standalone(&ContextConfig::default().with_num_threads(threads));
        let session = context
            .create_session(config, Arc::new(StreamingPrePostProcessor::new()), None)
            .unwrap();
        InferenceManager::new(context, session)
    }

    #[test]
    fn test_prepare_rejects_bad_host_config() {
        let mut manager = passthrough_manager(64, 1);
        assert!(manager.prepare(HostConfig::new(0.0, 48000.0), None).is_err());
        assert!(manager.prepare(HostConfig::new(64.0, 0.0), None).is_err());
        assert!(
            manager
                .prepare(HostConfig::new(64.0, 48000.0).with_tensor_index(3), None)
                .is_err()
        );
    }

    #[test]
    fn test_uninitialised_process_is_silence() {
        let mut manager = passthrough_manager(64, 1);
        // No prepare: pops must not panic and must deliver silence
        let mut out = vec![1.0f32; 64];
        let mut channels = [out.as_mut_slice()];
        let received = manager.pop_data(&mut channels, 0);
        assert_eq!(received, 0);
        assert!(channels[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_streaming_roundtrip_with_latency() {
        let mut manager = passthrough_manager(64, 1);
        manager
            .prepare(HostConfig::new(64.0, 48000.0), None)
            .unwrap();
        manager.set_non_realtime(true);

        let latency = manager.latency()[0];
        assert!(latency >= 64);

        let frames = 8;
        let mut delivered = Vec::new();
        for frame in 0..frames {
            let input: Vec<f32> = (0..64).map(|j| (frame * 64 + j) as f32 + 1.0).collect();
            manager.push_data(&[&input], 0);

            let mut out = vec![0.0f32; 64];
            let mut channels = [out.as_mut_slice()];
            let received = manager.pop_data(&mut channels, 0);
            assert_eq!(received, 64);
            delivered.extend_from_slice(channels[0]);
        }

        // First `latency` samples are silence, then the ramp verbatim
        for (j, &sample) in delivered.iter().enumerate() {
            if j < latency {
                assert_eq!(sample, 0.0, "expected silence at {}", j);
            } else {
                assert_eq!(sample, (j - latency) as f32 + 1.0, "mismatch at {}", j);
            }
        }

        manager.release();
    }

    #[test]
    fn test_pop_more_than_available_keeps_alignment() {
        let mut manager = passthrough_manager(32, 1);
        manager
            .prepare(HostConfig::new(32.0, 48000.0), None)
            .unwrap();
        manager.set_non_realtime(true);

        let latency = manager.latency()[0];
        let input: Vec<f32> = (1..=32).map(|v| v as f32).collect();
        manager.push_data(&[&input], 0);

        // Ask for far more than one frame: the missing tail is silence
        // and is not counted as missed (nothing is pending afterwards)
        let mut out = vec![42.0f32; latency + 128];
        let mut channels = [out.as_mut_slice()];
        let received = manager.pop_data(&mut channels, 0);
        assert_eq!(received, latency + 32);
        for j in received..out.len() {
            assert_eq!(out[j], 0.0);
        }

        // The stream continues without drift
        let input2: Vec<f32> = (33..=64).map(|v| v as f32).collect();
        manager.push_data(&[&input2], 0);
        let mut out2 = vec![0.0f32; 32];
        let mut channels2 = [out2.as_mut_slice()];
        assert_eq!(manager.pop_data(&mut channels2, 0), 32);
        let expected: Vec<f32> = (33..=64).map(|v| v as f32).collect();
        assert_eq!(out2, expected);

        manager.release();
    }

    #[test]
    fn test_slot_exhaustion_drops_frames_to_silence() {
        // No workers and no host execution: slots fill up and stay READY
        let mut manager = passthrough_manager(16, 0);
        manager
            .prepare(HostConfig::new(16.0, 48000.0), None)
            .unwrap();
        let slots = manager.num_slots();

        let input: Vec<f32> = (1..=16).map(|v| v as f32).collect();
        for _ in 0..slots + 2 {
            manager.push_data(&[&input], 0);
        }

        // Every slot holds one pending stamp; the two overflow frames
        // were dropped and replaced with silence in the receive ring
        let available = manager.receive_buffers[0].available_samples(0);
        let prefill = manager.latency()[0];
        assert_eq!(available, prefill + 2 * 16);

        manager.release();
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut manager = passthrough_manager(64, 1);
        manager
            .prepare(HostConfig::new(64.0, 48000.0), None)
            .unwrap();
        manager.set_non_realtime(true);

        let run = |manager: &mut InferenceManager| -> Vec<f32> {
            let mut delivered = Vec::new();
            for frame in 0..4 {
                let input: Vec<f32> = (0..64).map(|j| ((frame * 64 + j) % 17) as f32).collect();
                manager.push_data(&[&input], 0);
                let mut out = vec![0.0f32; 64];
                let mut channels = [out.as_mut_slice()];
                manager.pop_data(&mut channels, 0);
                delivered.extend_from_slice(channels[0]);
            }
            delivered
        };

        let first = run(&mut manager);
        manager.reset();
        let second = run(&mut manager);
        assert_eq!(first, second);

        manager.release();
    }
}
