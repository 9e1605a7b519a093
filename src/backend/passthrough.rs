//! Pass-through processor - the default when no runtime is attached

use crate::buffer::Buffer;
use crate::error::Result;
use crate::processing::AuxTensorStore;

use super::BackendProcessor;

/// Copies each input frame to the matching output frame when the shapes
/// agree; mismatched pairs keep their prepared zeros. Used as the bypass
/// processor for sessions without a loaded runtime and as a deterministic
/// stand-in for tests.
#[derive(Debug, Default)]
pub struct PassthroughProcessor;

impl PassthroughProcessor {
    /// Shape-matched copy, also used directly on the bypass path.
    pub(crate) fn copy_through(&self, inputs: &[Buffer], outputs: &mut [Buffer]) {
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            let equal_channels = input.num_channels() == output.num_channels();
            let equal_samples = input.num_samples() == output.num_samples();
            if equal_channels && equal_samples {
                output.copy_from(input);
            }
        }
    }
}

impl BackendProcessor for PassthroughProcessor {
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Buffer],
        outputs: &mut [Buffer],
        _aux: &AuxTensorStore,
    ) -> Result<()> {
        self.copy_through(inputs, outputs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_copies_matching_shapes() {
        let mut input = Buffer::new(1, 4);
        for i in 0..4 {
            input.set_sample(0, i, i as f32 + 1.0);
        }
        let mut outputs = vec![Buffer::new(1, 4)];
        let aux = AuxTensorStore::empty();

        let mut processor = PassthroughProcessor;
        processor
            .process(std::slice::from_ref(&input), &mut outputs, &aux)
            .unwrap();

        for i in 0..4 {
            assert_eq!(outputs[0].get_sample(0, i), i as f32 + 1.0);
        }
    }

    #[test]
    fn test_passthrough_skips_mismatched_shapes() {
        let input = Buffer::new(1, 4);
        let mut outputs = vec![Buffer::new(1, 8)];
        outputs[0].fill(0.0);
        let aux = AuxTensorStore::empty();

        let mut processor = PassthroughProcessor;
        processor
            .process(std::slice::from_ref(&input), &mut outputs, &aux)
            .unwrap();

        for i in 0..8 {
            assert_eq!(outputs[0].get_sample(0, i), 0.0);
        }
    }
}
