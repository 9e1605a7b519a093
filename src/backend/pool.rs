//! Shared backend instances and parallel sub-instance claiming

use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::config::InferenceConfig;
use crate::error::Result;
use crate::processing::AuxTensorStore;

use super::{BackendFactory, BackendProcessor, InferenceBackend};

/// One loaded model serving one backend tag.
///
/// Holds `num_parallel_processors` independent sub-instances; `process`
/// claims an idle one, runs the forward pass there and releases it. The
/// claim is a `try_lock` per sub-instance, i.e. a single atomic exchange,
/// with the guard tying the claim to exclusive access of the runtime
/// state.
pub struct ProcessorInstance {
    backend: InferenceBackend,
    config: InferenceConfig,
    session_exclusive: bool,
    subs: Vec<Mutex<Box<dyn BackendProcessor>>>,
}

impl std::fmt::Debug for ProcessorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorInstance")
            .field("backend", &self.backend)
            .field("session_exclusive", &self.session_exclusive)
            .field("sub_instances", &self.subs.len())
            .finish()
    }
}

impl ProcessorInstance {
    /// Construct, prepare and warm up `num_parallel_processors`
    /// sub-instances through the backend factory.
    pub fn build(
        backend: InferenceBackend,
        config: &InferenceConfig,
        factory: &BackendFactory,
    ) -> Result<Arc<Self>> {
        let mut subs = Vec::with_capacity(config.num_parallel_processors);
        for _ in 0..config.num_parallel_processors {
            let mut processor = factory(config)?;
            processor.prepare()?;
            warm_up(processor.as_mut(), backend, config)?;
            subs.push(Mutex::new(processor));
        }
        Ok(Arc::new(Self {
            backend,
            config: config.clone(),
            session_exclusive: config.session_exclusive_processor,
            subs,
        }))
    }

    /// Wrap a user-supplied processor as a single-sub-instance entry.
    /// Custom processors are per-session and never pooled.
    pub fn from_custom(
        config: &InferenceConfig,
        mut processor: Box<dyn BackendProcessor>,
    ) -> Result<Arc<Self>> {
        processor.prepare()?;
        Ok(Arc::new(Self {
            backend: InferenceBackend::Custom,
            config: config.clone(),
            session_exclusive: true,
            subs: vec![Mutex::new(processor)],
        }))
    }

    pub fn backend(&self) -> InferenceBackend {
        self.backend
    }

    /// Run one forward pass on an idle sub-instance, spinning until one
    /// frees up. Callers are bounded by the slot count, so at most
    /// `num_parallel_processors` of them compete at any time.
    pub fn process(
        &self,
        inputs: &[Buffer],
        outputs: &mut [Buffer],
        aux: &AuxTensorStore,
    ) -> Result<()> {
        loop {
            for sub in &self.subs {
                if let Some(mut guard) = sub.try_lock() {
                    return guard.process(inputs, outputs, aux);
                }
            }
            std::hint::spin_loop();
        }
    }
}

fn warm_up(
    processor: &mut dyn BackendProcessor,
    backend: InferenceBackend,
    config: &InferenceConfig,
) -> Result<()> {
    if config.warm_up == 0 {
        return Ok(());
    }

    let shape = config.shape_for(backend);
    let inputs: Vec<Buffer> = (0..shape.input_shape.len())
        .map(|i| {
            let channels = config.input_channels(i);
            Buffer::new(channels, shape.input_size(i) / channels)
        })
        .collect();
    let mut outputs: Vec<Buffer> = (0..shape.output_shape.len())
        .map(|i| {
            let channels = config.output_channels(i);
            Buffer::new(channels, shape.output_size(i) / channels)
        })
        .collect();
    let aux = AuxTensorStore::from_config(config);

    for _ in 0..config.warm_up {
        processor.process(&inputs, &mut outputs, &aux)?;
    }
    log::info!("Backend {} warm-up completed", backend);
    Ok(())
}

/// Registry of live backend instances, shared across sessions whose
/// configuration compares equal by value and is not session-exclusive.
#[derive(Debug, Default)]
pub struct ProcessorPool {
    instances: Vec<Arc<ProcessorInstance>>,
}

impl ProcessorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a shareable instance for `backend`, or build a fresh one.
    pub fn acquire(
        &mut self,
        backend: InferenceBackend,
        config: &InferenceConfig,
        factory: &BackendFactory,
    ) -> Result<Arc<ProcessorInstance>> {
        if !config.session_exclusive_processor {
            for instance in &self.instances {
                if instance.backend == backend
                    && !instance.session_exclusive
                    && instance.config == *config
                {
                    return Ok(instance.clone());
                }
            }
        }

        let instance = ProcessorInstance::build(backend, config, factory)?;
        self.instances.push(instance.clone());
        Ok(instance)
    }

    /// Return a session's instance. The entry is dropped once no other
    /// session references it.
    pub fn release(&mut self, instance: &Arc<ProcessorInstance>) {
        self.instances.retain(|entry| {
            // One count for the pool, one for the releasing session
            !(Arc::ptr_eq(entry, instance) && Arc::strong_count(entry) <= 2)
        });
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PassthroughProcessor;
    use crate::config::{ModelData, TensorShape};

    fn test_config(exclusive: bool) -> InferenceConfig {
        let mut config = InferenceConfig::new(
            vec![ModelData::from_path(InferenceBackend::Onnx, "m.onnx")],
            vec![TensorShape::universal(vec![vec![1, 64]], vec![vec![1, 64]])],
            5.0,
        );
        config.session_exclusive_processor = exclusive;
        config.warm_up = 1;
        config.resolve().unwrap()
    }

    fn passthrough_factory() -> BackendFactory {
        Arc::new(|_config: &InferenceConfig| {
            Ok(Box::new(PassthroughProcessor) as Box<dyn BackendProcessor>)
        })
    }

    #[test]
    fn test_pool_shares_equal_configs() {
        let mut pool = ProcessorPool::new();
        let config = test_config(false);
        let factory = passthrough_factory();

        let a = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();
        let b = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_respects_session_exclusive() {
        let mut pool = ProcessorPool::new();
        let config = test_config(true);
        let factory = passthrough_factory();

        let a = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();
        let b = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_pool_release_drops_unreferenced() {
        let mut pool = ProcessorPool::new();
        let config = test_config(false);
        let factory = passthrough_factory();

        let a = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();
        let b = pool
            .acquire(InferenceBackend::Onnx, &config, &factory)
            .unwrap();

        pool.release(&a);
        drop(a);
        // Still referenced by b
        assert_eq!(pool.len(), 1);

        pool.release(&b);
        drop(b);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_instance_processes_through_sub_instance() {
        let config = test_config(false);
        let factory = passthrough_factory();
        let instance = ProcessorInstance::build(InferenceBackend::Onnx, &config, &factory).unwrap();

        let mut input = Buffer::new(1, 64);
        input.set_sample(0, 10, 0.5);
        let mut outputs = vec![Buffer::new(1, 64)];
        instance
            .process(
                std::slice::from_ref(&input),
                &mut outputs,
                &AuxTensorStore::empty(),
            )
            .unwrap();
        assert_eq!(outputs[0].get_sample(0, 10), 0.5);
    }
}
